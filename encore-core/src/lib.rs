//! ENCORE Core - Gateway Data Types
//!
//! Pure data structures shared by every ENCORE crate: identifiers, backend
//! records, playback telemetry events, configuration sections, and the error
//! taxonomy. This crate contains no I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod playback;
pub mod record;

pub use config::{
    BackendConfig, PoolConfig, ThrottleConfig, TokenConfig, TransportConfig,
};
pub use error::{
    BackendError, ConfigError, DecodeError, ErrorClass, GatewayError, GatewayResult,
    TransportError,
};
pub use identity::{ItemId, RecordId, SessionId, Timestamp};
pub use playback::{
    stream_fields, EventKind, PlaybackEvent, StreamSnapshot, TelemetryEnvelope,
};
pub use record::{FieldMap, FindOptions, Record, SortDirection, SortSpec};
