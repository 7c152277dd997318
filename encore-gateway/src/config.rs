//! Gateway configuration.
//!
//! `GatewayConfig` gathers the core sections (backend, transport, pool,
//! throttle, token) with the gateway's own cache, playback and janitor
//! settings. Everything except the backend location and credentials has a
//! default.

use std::time::Duration;

use encore_cache::NamespaceConfig;
use encore_core::{
    BackendConfig, ConfigError, PoolConfig, ThrottleConfig, TokenConfig, TransportConfig,
};

use crate::constants::{
    DEFAULT_FIND_CACHE_ENTRIES, DEFAULT_FIND_CACHE_TTL_SECS, DEFAULT_JANITOR_INTERVAL_SECS,
    DEFAULT_RECORD_CACHE_ENTRIES, DEFAULT_RECORD_CACHE_TTL_SECS, DEFAULT_STREAM_LAYOUT,
    DEFAULT_STREAM_LINK_ENTRIES, DEFAULT_STREAM_LINK_TTL_SECS,
};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// CACHE
// ============================================================================

/// Namespaces used by the record gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Records read by id.
    pub records: NamespaceConfig,
    /// Opt-in cached find results.
    pub finds: NamespaceConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            records: NamespaceConfig::new(
                DEFAULT_RECORD_CACHE_ENTRIES,
                Duration::from_secs(DEFAULT_RECORD_CACHE_TTL_SECS),
            ),
            finds: NamespaceConfig::new(
                DEFAULT_FIND_CACHE_ENTRIES,
                Duration::from_secs(DEFAULT_FIND_CACHE_TTL_SECS),
            ),
        }
    }
}

impl CacheConfig {
    /// # Environment Variables
    /// - `ENCORE_CACHE_RECORD_ENTRIES` (default: 5000)
    /// - `ENCORE_CACHE_RECORD_TTL_SECS` (default: 60)
    /// - `ENCORE_CACHE_FIND_ENTRIES` (default: 1000)
    /// - `ENCORE_CACHE_FIND_TTL_SECS` (default: 15)
    pub fn from_env() -> Self {
        Self {
            records: NamespaceConfig::new(
                env_or("ENCORE_CACHE_RECORD_ENTRIES", DEFAULT_RECORD_CACHE_ENTRIES),
                Duration::from_secs(env_or(
                    "ENCORE_CACHE_RECORD_TTL_SECS",
                    DEFAULT_RECORD_CACHE_TTL_SECS,
                )),
            ),
            finds: NamespaceConfig::new(
                env_or("ENCORE_CACHE_FIND_ENTRIES", DEFAULT_FIND_CACHE_ENTRIES),
                Duration::from_secs(env_or("ENCORE_CACHE_FIND_TTL_SECS", DEFAULT_FIND_CACHE_TTL_SECS)),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, ns) in [("records", &self.records), ("finds", &self.finds)] {
            if ns.max_entries == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("cache.{}.max_entries", field),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Playback accumulator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Backend layout holding stream records.
    pub stream_layout: String,
    /// Sliding TTL of a (session, item) link.
    pub link_ttl: Duration,
    pub link_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stream_layout: DEFAULT_STREAM_LAYOUT.to_string(),
            link_ttl: Duration::from_secs(DEFAULT_STREAM_LINK_TTL_SECS),
            link_capacity: DEFAULT_STREAM_LINK_ENTRIES,
        }
    }
}

impl PlaybackConfig {
    /// # Environment Variables
    /// - `ENCORE_STREAM_LAYOUT` (default: StreamEvents)
    /// - `ENCORE_STREAM_LINK_TTL_SECS` (default: 1800)
    /// - `ENCORE_STREAM_LINK_CAPACITY` (default: 10000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stream_layout: std::env::var("ENCORE_STREAM_LAYOUT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.stream_layout),
            link_ttl: Duration::from_secs(env_or(
                "ENCORE_STREAM_LINK_TTL_SECS",
                DEFAULT_STREAM_LINK_TTL_SECS,
            )),
            link_capacity: env_or("ENCORE_STREAM_LINK_CAPACITY", defaults.link_capacity),
        }
    }

    pub fn with_layout(mut self, layout: impl Into<String>) -> Self {
        self.stream_layout = layout.into();
        self
    }

    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    /// Namespace policy for the link cache.
    pub fn link_namespace(&self) -> NamespaceConfig {
        NamespaceConfig::new(self.link_capacity, self.link_ttl).sliding()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_layout.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "ENCORE_STREAM_LAYOUT".to_string(),
            });
        }
        if self.link_ttl.is_zero() || self.link_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ENCORE_STREAM_LINK_TTL_SECS".to_string(),
                value: format!("{}s x {}", self.link_ttl.as_secs(), self.link_capacity),
                reason: "link TTL and capacity must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// JANITOR
// ============================================================================

/// Background expired-entry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JanitorConfig {
    pub interval: Duration,
    pub enabled: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS),
            enabled: true,
        }
    }
}

impl JanitorConfig {
    /// # Environment Variables
    /// - `ENCORE_JANITOR_INTERVAL_SECS` (default: 60)
    /// - `ENCORE_JANITOR_ENABLED` (default: true)
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(env_or(
                "ENCORE_JANITOR_INTERVAL_SECS",
                DEFAULT_JANITOR_INTERVAL_SECS,
            )),
            enabled: std::env::var("ENCORE_JANITOR_ENABLED")
                .map(|s| s.to_lowercase() != "false" && s != "0")
                .unwrap_or(true),
        }
    }

    /// Short interval for development and tests.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(5),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend: BackendConfig,
    pub transport: TransportConfig,
    pub pool: PoolConfig,
    pub throttle: ThrottleConfig,
    pub token: TokenConfig,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
    pub janitor: JanitorConfig,
}

impl GatewayConfig {
    /// Defaults for everything but the backend.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            transport: TransportConfig::default(),
            pool: PoolConfig::default(),
            throttle: ThrottleConfig::default(),
            token: TokenConfig::default(),
            cache: CacheConfig::default(),
            playback: PlaybackConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }

    /// Load every section from `ENCORE_*` variables and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            backend: BackendConfig::from_env()?,
            transport: TransportConfig::from_env()?,
            pool: PoolConfig::from_env()?,
            throttle: ThrottleConfig::from_env()?,
            token: TokenConfig::from_env()?,
            cache: CacheConfig::from_env(),
            playback: PlaybackConfig::from_env(),
            janitor: JanitorConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;
        self.transport.validate()?;
        self.pool.validate()?;
        self.throttle.validate()?;
        self.token.validate()?;
        self.cache.validate()?;
        self.playback.validate()?;
        Ok(())
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_token(mut self, token: TokenConfig) -> Self {
        self.token = token;
        self
    }

    pub fn with_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    pub fn with_janitor(mut self, janitor: JanitorConfig) -> Self {
        self.janitor = janitor;
        self
    }
}
