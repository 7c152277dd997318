//! Gateway configuration sections.
//!
//! Each section has sensible defaults, a `from_env()` constructor reading
//! `ENCORE_*` variables, and a `validate()` that reports the first invalid
//! field. Only the backend location and credentials are required.

use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

// ============================================================================
// ENV HELPERS
// ============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw,
                reason: "could not be parsed".to_string(),
            }),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_parse::<u64>(key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(env_parse::<u64>(key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn require(key: &str) -> Result<String, ConfigError> {
    env_string(key).ok_or_else(|| ConfigError::MissingRequired {
        field: key.to_string(),
    })
}

fn at_least(field: &str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: format!("must be at least {}", min),
        });
    }
    Ok(())
}

// ============================================================================
// BACKEND
// ============================================================================

/// Location and credentials of the record-store backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the backend host, e.g. `https://records.example.com`.
    pub host: String,
    /// Database (file) name on the host.
    pub database: String,
    pub username: String,
    pub password: SecretString,
    /// Data API version path segment.
    pub api_version: String,
}

impl BackendConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let password: String = password.into();
        Self {
            host: host.into(),
            database: database.into(),
            username: username.into(),
            password: SecretString::new(password.into_boxed_str()),
            api_version: "vLatest".to_string(),
        }
    }

    /// Environment variables:
    /// - `ENCORE_BACKEND_HOST` (required)
    /// - `ENCORE_BACKEND_DATABASE` (required)
    /// - `ENCORE_BACKEND_USER` (required)
    /// - `ENCORE_BACKEND_PASSWORD` (required)
    /// - `ENCORE_BACKEND_API_VERSION` (default: vLatest)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            require("ENCORE_BACKEND_HOST")?,
            require("ENCORE_BACKEND_DATABASE")?,
            require("ENCORE_BACKEND_USER")?,
            require("ENCORE_BACKEND_PASSWORD")?,
        );
        if let Some(version) = env_string("ENCORE_BACKEND_API_VERSION") {
            config.api_version = version;
        }
        config.validate()?;
        Ok(config)
    }

    /// Root URL every backend path is resolved against.
    pub fn database_url(&self) -> String {
        format!(
            "{}/fmi/data/{}/databases/{}",
            self.host.trim_end_matches('/'),
            self.api_version,
            self.database
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.host.starts_with("http://") || self.host.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "host".to_string(),
                value: self.host.clone(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "database".to_string(),
            });
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "username".to_string(),
            });
        }
        if self.password.expose_secret().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "password".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Per-call timeout and retry policy for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Environment variables:
    /// - `ENCORE_TRANSPORT_TIMEOUT_MS` (default: 15000)
    /// - `ENCORE_TRANSPORT_MAX_RETRIES` (default: 3)
    /// - `ENCORE_TRANSPORT_BASE_DELAY_MS` (default: 250)
    /// - `ENCORE_TRANSPORT_MAX_DELAY_MS` (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            attempt_timeout: env_millis("ENCORE_TRANSPORT_TIMEOUT_MS", defaults.attempt_timeout)?,
            max_retries: env_parse("ENCORE_TRANSPORT_MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            base_delay: env_millis("ENCORE_TRANSPORT_BASE_DELAY_MS", defaults.base_delay)?,
            max_delay: env_millis("ENCORE_TRANSPORT_MAX_DELAY_MS", defaults.max_delay)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least(
            "attempt_timeout_ms",
            self.attempt_timeout.as_millis() as u64,
            1,
        )?;
        at_least("base_delay_ms", self.base_delay.as_millis() as u64, 1)?;
        if self.max_delay < self.base_delay {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "base_delay".to_string(),
                option_b: "max_delay".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// CONNECTION POOL
// ============================================================================

/// Outbound connection reuse settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections kept per backend host.
    pub max_idle_per_host: usize,
    /// How long an idle connection is kept open.
    pub keep_alive: Duration,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Environment variables:
    /// - `ENCORE_POOL_MAX_IDLE` (default: 20)
    /// - `ENCORE_POOL_KEEP_ALIVE_SECS` (default: 30)
    /// - `ENCORE_POOL_CONNECT_TIMEOUT_MS` (default: 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_idle_per_host: env_parse("ENCORE_POOL_MAX_IDLE")?
                .unwrap_or(defaults.max_idle_per_host),
            keep_alive: env_secs("ENCORE_POOL_KEEP_ALIVE_SECS", defaults.keep_alive)?,
            connect_timeout: env_millis(
                "ENCORE_POOL_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("max_idle_per_host", self.max_idle_per_host as u64, 1)
    }
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Concurrency ceiling and start pacing for backend calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Maximum calls executing at once.
    pub ceiling: usize,
    /// Minimum gap between two call starts.
    pub min_start_gap: Duration,
    /// Queue depth, as a multiple of `ceiling`, that triggers a backpressure warning.
    pub backpressure_multiplier: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            ceiling: 8,
            min_start_gap: Duration::from_millis(25),
            backpressure_multiplier: 4,
        }
    }
}

impl ThrottleConfig {
    /// Environment variables:
    /// - `ENCORE_THROTTLE_CEILING` (default: 8)
    /// - `ENCORE_THROTTLE_MIN_GAP_MS` (default: 25)
    /// - `ENCORE_THROTTLE_BACKPRESSURE_MULTIPLIER` (default: 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            ceiling: env_parse("ENCORE_THROTTLE_CEILING")?.unwrap_or(defaults.ceiling),
            min_start_gap: env_millis("ENCORE_THROTTLE_MIN_GAP_MS", defaults.min_start_gap)?,
            backpressure_multiplier: env_parse("ENCORE_THROTTLE_BACKPRESSURE_MULTIPLIER")?
                .unwrap_or(defaults.backpressure_multiplier),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_min_start_gap(mut self, gap: Duration) -> Self {
        self.min_start_gap = gap;
        self
    }

    /// Queue depth above which a warning is logged.
    pub fn backpressure_threshold(&self) -> usize {
        self.ceiling.saturating_mul(self.backpressure_multiplier)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("ceiling", self.ceiling as u64, 1)?;
        at_least(
            "backpressure_multiplier",
            self.backpressure_multiplier as u64,
            1,
        )
    }
}

// ============================================================================
// SESSION TOKEN
// ============================================================================

/// Session token lifetime policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    /// Lifetime the backend grants a session token.
    pub lifetime: Duration,
    /// How much earlier than `lifetime` the gateway treats the token as expired.
    pub safety_margin: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(15 * 60),
            safety_margin: Duration::from_secs(60),
        }
    }
}

impl TokenConfig {
    /// Environment variables:
    /// - `ENCORE_TOKEN_LIFETIME_SECS` (default: 900)
    /// - `ENCORE_TOKEN_SAFETY_MARGIN_SECS` (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            lifetime: env_secs("ENCORE_TOKEN_LIFETIME_SECS", defaults.lifetime)?,
            safety_margin: env_secs("ENCORE_TOKEN_SAFETY_MARGIN_SECS", defaults.safety_margin)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// How long a freshly issued token is used before proactive refresh.
    pub fn effective_lifetime(&self) -> Duration {
        self.lifetime.saturating_sub(self.safety_margin)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.safety_margin >= self.lifetime {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "lifetime".to_string(),
                option_b: "safety_margin".to_string(),
            });
        }
        Ok(())
    }
}
