//! Constants for the ENCORE gateway
//!
//! This module contains the constant values shared across gateway
//! components.

// ============================================================================
// CACHE NAMESPACES
// ============================================================================

/// Namespace for records read by id.
pub const RECORDS_NAMESPACE: &str = "records";

/// Namespace for opt-in cached find results.
pub const FINDS_NAMESPACE: &str = "finds";

/// Namespace for (session, item) → record id links.
pub const STREAM_LINKS_NAMESPACE: &str = "stream-links";

/// Default record cache capacity
pub const DEFAULT_RECORD_CACHE_ENTRIES: usize = 5_000;

/// Default record cache TTL in seconds
pub const DEFAULT_RECORD_CACHE_TTL_SECS: u64 = 60;

/// Default find cache capacity
pub const DEFAULT_FIND_CACHE_ENTRIES: usize = 1_000;

/// Default find cache TTL in seconds
pub const DEFAULT_FIND_CACHE_TTL_SECS: u64 = 15;

// ============================================================================
// PLAYBACK
// ============================================================================

/// Backend layout holding one record per playback stream.
pub const DEFAULT_STREAM_LAYOUT: &str = "StreamEvents";

/// Default stream link TTL in seconds (30 minutes, sliding)
pub const DEFAULT_STREAM_LINK_TTL_SECS: u64 = 1_800;

/// Default stream link capacity
pub const DEFAULT_STREAM_LINK_ENTRIES: usize = 10_000;

/// Separator between session and item in a link key.
pub const LINK_KEY_SEPARATOR: char = '\u{1f}';

// ============================================================================
// BACKGROUND JOBS
// ============================================================================

/// Default interval between expired-entry sweeps in seconds
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60;

// ============================================================================
// BACKEND PROTOCOL
// ============================================================================

/// Backend message code for success.
pub const CODE_OK: &str = "0";

/// Backend message code for "no records match the request".
pub const CODE_NO_RECORDS: &str = "401";

/// Backend message code for a missing record.
pub const CODE_RECORD_MISSING: &str = "101";

/// Header carrying the per-call correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
