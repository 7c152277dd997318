//! Cache layer for the ENCORE gateway.
//!
//! [`CacheStore`] is a process-wide, in-memory key/value store split into
//! namespaces. Each namespace carries its own capacity bound, TTL and
//! [`Expiration`] policy. Over capacity, the least recently used entry goes
//! first. Expired entries read as absent even before they are swept.
//!
//! [`ReadThroughCache`] adds `fetch_once` on top of a store: a live entry is
//! returned directly, and concurrent misses for the same key share one
//! in-flight producer. The in-flight marker is cleared on success and on
//! failure alike.
//!
//! Misses are normal. Nothing in this crate returns an error of its own.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(
//!     CacheStore::builder()
//!         .namespace("records", NamespaceConfig::new(5_000, Duration::from_secs(60)))
//!         .build(),
//! );
//! let cache = ReadThroughCache::new(store);
//!
//! let record = cache
//!     .fetch_once("records", "Tracks/42", || async move { backend.get(42).await })
//!     .await?;
//! ```

pub mod namespace;
pub mod read_through;
pub mod stats;
pub mod store;

pub use namespace::{Expiration, NamespaceConfig};
pub use read_through::ReadThroughCache;
pub use stats::CacheStats;
pub use store::{CacheEntry, CacheStore, CacheStoreBuilder, Purge};
