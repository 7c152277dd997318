//! Per-namespace cache policy.

use std::time::Duration;

/// How a cache hit affects an entry's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Expiry is fixed at insertion time.
    #[default]
    Fixed,
    /// Every hit pushes expiry out by a full TTL.
    Sliding,
}

/// Capacity and lifetime policy for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Maximum live entries before LRU eviction.
    pub max_entries: usize,
    /// Default time-to-live for new entries.
    pub ttl: Duration,
    pub expiration: Expiration,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl: Duration::from_secs(300),
            expiration: Expiration::Fixed,
        }
    }
}

impl NamespaceConfig {
    /// Fixed-expiry namespace with the given bounds.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            expiration: Expiration::Fixed,
        }
    }

    /// Set the capacity bound.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Extend the TTL on every hit.
    pub fn sliding(mut self) -> Self {
        self.expiration = Expiration::Sliding;
        self
    }

    /// Keep the TTL fixed at insertion.
    pub fn fixed(mut self) -> Self {
        self.expiration = Expiration::Fixed;
        self
    }

    pub fn is_sliding(&self) -> bool {
        self.expiration == Expiration::Sliding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_config_builder() {
        let config = NamespaceConfig::new(10, Duration::from_secs(5))
            .with_max_entries(20)
            .with_ttl(Duration::from_secs(30))
            .sliding();

        assert_eq!(config.max_entries, 20);
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert!(config.is_sliding());
        assert!(!config.fixed().is_sliding());
    }
}
