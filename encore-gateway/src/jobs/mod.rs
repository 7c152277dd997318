//! Background jobs for the ENCORE gateway
//!
//! - `janitor`: sweeps expired entries out of every cache store
//!
//! # Usage
//!
//! ```ignore
//! use encore_gateway::jobs::spawn_janitor;
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let handle = spawn_janitor(stores, config.janitor.clone(), shutdown.clone());
//!
//! // On shutdown
//! shutdown.cancel();
//! let metrics = handle.await?;
//! ```

pub mod janitor;

pub use janitor::{janitor_task, spawn_janitor, JanitorMetrics, JanitorSnapshot};
