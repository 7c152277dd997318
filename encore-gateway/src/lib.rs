//! ENCORE Gateway
//!
//! Resilient access to the ENCORE record store's Data API, plus the
//! playback accumulator that turns client telemetry into stream records.
//!
//! The outbound chain, from the caller inward:
//!
//! ```text
//! PlaybackAccumulator -> RecordGateway -> TokenManager
//!                                      -> Backend (HttpBackend)
//!                                           -> RequestThrottle
//!                                           -> retry_attempts
//!                                           -> ConnectionPool
//! ```
//!
//! Every backend call, session login included, is admitted by one shared
//! throttle, so the store never sees more than the configured number of
//! concurrent requests or request starts closer together than the
//! configured gap.

pub mod backend;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod gateway;
pub mod jobs;
pub mod playback;
pub mod pool;
pub mod state;
pub mod telemetry;
pub mod throttle;
pub mod token;
pub mod transport;

pub use backend::{Backend, BackendCall, HttpBackend, IssuedToken, Method};
pub use config::{CacheConfig, GatewayConfig, JanitorConfig, PlaybackConfig};
pub use envelope::{BackendReply, Envelope};
pub use gateway::RecordGateway;
pub use playback::{
    EnsureOptions, EnsuredRecord, PlaybackAccumulator, StreamLinkCache, StreamOutcome,
};
pub use pool::ConnectionPool;
pub use state::GatewayState;
pub use throttle::RequestThrottle;
pub use token::{Token, TokenManager, TokenState};
pub use transport::{
    head_deadline, retry_attempts, run_with_retry, AttemptFailure, RetryPolicy, Sleeper,
    TokioSleeper,
};
