//! Namespaced in-memory store with TTL expiry and LRU eviction.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::time::Instant;

use crate::namespace::{Expiration, NamespaceConfig};
use crate::stats::{CacheStats, Counters};

/// A cached value plus its timing metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            inserted_at: now,
            expires_at: now + ttl,
            ttl,
        }
    }

    /// An entry whose expiry is at or before `now` is dead.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero when already expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Sweeps expired entries. Implemented by stores the janitor job owns.
pub trait Purge: Send + Sync {
    /// Remove all expired entries, returning how many were dropped.
    fn purge_expired(&self) -> usize;
}

/// One namespace: an insertion-ordered map where the front is least
/// recently used. Touching an entry shifts the entries behind it, so a hit
/// costs time linear in the distance to the back.
#[derive(Debug)]
struct Namespace<V> {
    config: NamespaceConfig,
    entries: Mutex<IndexMap<String, CacheEntry<V>>>,
    counters: Counters,
}

impl<V> Namespace<V> {
    fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(IndexMap::new()),
            counters: Counters::default(),
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, CacheEntry<V>>> {
        // The map holds no invariant a panicking writer could break halfway.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide cache shared by every gateway component.
///
/// Unknown namespaces are created on first use with the store's default
/// policy.
#[derive(Debug)]
pub struct CacheStore<V> {
    namespaces: DashMap<String, Arc<Namespace<V>>>,
    default_config: NamespaceConfig,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new(NamespaceConfig::default())
    }
}

impl CacheStore<()> {
    /// Start a builder. The value type is chosen at `build`.
    pub fn builder() -> CacheStoreBuilder {
        CacheStoreBuilder::default()
    }
}

impl<V> CacheStore<V> {
    /// Create a store whose namespaces all start from `default_config`.
    pub fn new(default_config: NamespaceConfig) -> Self {
        Self {
            namespaces: DashMap::new(),
            default_config,
        }
    }

    /// Register or replace the policy for a namespace, dropping its entries.
    pub fn configure(&self, namespace: &str, config: NamespaceConfig) {
        self.namespaces
            .insert(namespace.to_string(), Arc::new(Namespace::new(config)));
    }

    /// The policy in effect for a namespace.
    pub fn namespace_config(&self, namespace: &str) -> NamespaceConfig {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.config.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn namespace(&self, namespace: &str) -> Arc<Namespace<V>> {
        if let Some(ns) = self.namespaces.get(namespace) {
            return Arc::clone(ns.value());
        }
        let entry = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Namespace::new(self.default_config.clone())));
        Arc::clone(entry.value())
    }

    /// Store a value under the namespace's default TTL.
    pub fn set(&self, namespace: &str, key: impl Into<String>, value: V) {
        let ns = self.namespace(namespace);
        let ttl = ns.config.ttl;
        Self::insert(&ns, key.into(), value, ttl);
    }

    /// Store a value with an explicit TTL.
    pub fn set_with_ttl(&self, namespace: &str, key: impl Into<String>, value: V, ttl: Duration) {
        let ns = self.namespace(namespace);
        Self::insert(&ns, key.into(), value, ttl);
    }

    fn insert(ns: &Namespace<V>, key: String, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = ns.entries();

        // Replacing a key moves it to the most-recent end.
        let entry = CacheEntry::new(value, ttl, now);
        match entries.get_index_of(&key) {
            Some(index) => {
                let last = entries.len() - 1;
                entries.move_index(index, last);
                entries[last] = entry;
            }
            None => {
                entries.insert(key, entry);
            }
        }

        if entries.len() <= ns.config.max_entries {
            return;
        }

        // Dead entries go before live ones.
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let expired = before - entries.len();
        if expired > 0 {
            ns.counters.expired(expired as u64);
        }

        let mut evicted = 0u64;
        while entries.len() > ns.config.max_entries {
            if entries.shift_remove_index(0).is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            ns.counters.evicted(evicted);
            tracing::trace!(
                max_entries = ns.config.max_entries,
                evicted,
                "Evicted least recently used cache entries"
            );
        }
    }

    /// Remove a key. Returns whether a live entry was present.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        let Some(ns) = self.namespaces.get(namespace).map(|ns| Arc::clone(ns.value())) else {
            return false;
        };
        let now = Instant::now();
        let removed = ns.entries().shift_remove(key);
        matches!(removed, Some(entry) if !entry.is_expired_at(now))
    }

    /// Drop every entry in a namespace, keeping its policy and counters.
    pub fn clear_namespace(&self, namespace: &str) {
        if let Some(ns) = self.namespaces.get(namespace) {
            ns.entries().clear();
        }
    }

    /// Drop every entry in every namespace.
    pub fn clear(&self) {
        for ns in self.namespaces.iter() {
            ns.entries().clear();
        }
    }

    /// Remove expired entries from one namespace.
    pub fn purge_namespace(&self, namespace: &str) -> usize {
        match self.namespaces.get(namespace).map(|ns| Arc::clone(ns.value())) {
            Some(ns) => Self::purge(&ns, Instant::now()),
            None => 0,
        }
    }

    fn purge(ns: &Namespace<V>, now: Instant) -> usize {
        let mut entries = ns.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        let purged = before - entries.len();
        if purged > 0 {
            ns.counters.expired(purged as u64);
        }
        purged
    }

    /// Number of entries held in a namespace, live or not yet swept.
    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.entries().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    /// Names of every namespace touched so far.
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|ns| ns.key().clone()).collect();
        names.sort();
        names
    }

    /// Usage counters for one namespace.
    pub fn stats(&self, namespace: &str) -> CacheStats {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.counters.snapshot(ns.entries().len()))
            .unwrap_or_default()
    }

    /// Usage counters summed across all namespaces.
    pub fn total_stats(&self) -> CacheStats {
        self.namespaces
            .iter()
            .map(|ns| ns.counters.snapshot(ns.entries().len()))
            .fold(CacheStats::default(), |acc, s| acc.merge(&s))
    }
}

impl<V: Clone> CacheStore<V> {
    /// Look up a live entry, marking it most recently used.
    ///
    /// Sliding namespaces push the expiry out by a full TTL on every hit.
    pub fn get(&self, namespace: &str, key: &str) -> Option<V> {
        let ns = self.namespace(namespace);
        let now = Instant::now();
        let mut entries = ns.entries();

        let Some(index) = entries.get_index_of(key) else {
            ns.counters.miss();
            return None;
        };

        if entries[index].is_expired_at(now) {
            entries.shift_remove_index(index);
            ns.counters.expired(1);
            ns.counters.miss();
            return None;
        }

        let last = entries.len() - 1;
        entries.move_index(index, last);
        let entry = &mut entries[last];
        if ns.config.expiration == Expiration::Sliding {
            entry.expires_at = now + entry.ttl;
        }
        ns.counters.hit();
        Some(entry.value.clone())
    }

    /// Look up a live entry without touching recency, expiry or counters.
    pub fn peek(&self, namespace: &str, key: &str) -> Option<CacheEntry<V>> {
        let ns = self.namespaces.get(namespace)?;
        let now = Instant::now();
        let entries = ns.entries();
        let entry = entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned();
        entry
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.peek(namespace, key).is_some()
    }
}

impl<V: Send> Purge for CacheStore<V> {
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let handles: Vec<Arc<Namespace<V>>> = self
            .namespaces
            .iter()
            .map(|ns| Arc::clone(ns.value()))
            .collect();
        handles.iter().map(|ns| Self::purge(ns, now)).sum()
    }
}

/// Builder for a [`CacheStore`] with named namespace policies.
#[derive(Debug, Clone, Default)]
pub struct CacheStoreBuilder {
    default_config: NamespaceConfig,
    namespaces: Vec<(String, NamespaceConfig)>,
}

impl CacheStoreBuilder {
    /// Policy for namespaces not registered explicitly.
    pub fn default_config(mut self, config: NamespaceConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn namespace(mut self, name: impl Into<String>, config: NamespaceConfig) -> Self {
        self.namespaces.push((name.into(), config));
        self
    }

    pub fn build<V>(self) -> CacheStore<V> {
        let store = CacheStore::new(self.default_config);
        for (name, config) in self.namespaces {
            store.configure(&name, config);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store(max_entries: usize, ttl_secs: u64) -> CacheStore<u32> {
        CacheStore::builder()
            .namespace(
                "ns",
                NamespaceConfig::new(max_entries, Duration::from_secs(ttl_secs)),
            )
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let store = store(10, 60);
        store.set("ns", "a", 1);

        assert_eq!(store.get("ns", "a"), Some(1));
        assert_eq!(store.get("ns", "missing"), None);

        let stats = store.stats("ns");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let store = store(10, 60);
        store.set("ns", "a", 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(store.get("ns", "a"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("ns", "a"), None);
        assert_eq!(store.stats("ns").expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_ttl_overrides_namespace_default() {
        let store = store(10, 60);
        store.set_with_ttl("ns", "short", 1, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.contains("ns", "short"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_expiry_is_not_extended_by_hits() {
        let store = store(10, 10);
        store.set("ns", "a", 1);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("ns", "a"), Some(1));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("ns", "a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiry_extends_on_hit() {
        let store: CacheStore<u32> = CacheStore::builder()
            .namespace("links", NamespaceConfig::new(10, Duration::from_secs(10)).sliding())
            .build();
        store.set("links", "a", 1);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(8)).await;
            assert_eq!(store.get("links", "a"), Some(1));
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("links", "a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_used() {
        let store = store(2, 60);
        store.set("ns", "a", 1);
        store.set("ns", "b", 2);

        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(store.get("ns", "a"), Some(1));
        store.set("ns", "c", 3);

        assert_eq!(store.get("ns", "a"), Some(1));
        assert_eq!(store.get("ns", "b"), None);
        assert_eq!(store.get("ns", "c"), Some(3));
        assert_eq!(store.stats("ns").evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_refreshes_recency() {
        let store = store(2, 60);
        store.set("ns", "a", 1);
        store.set("ns", "b", 2);
        store.set("ns", "a", 10);
        store.set("ns", "c", 3);

        assert_eq!(store.get("ns", "a"), Some(10));
        assert_eq!(store.get("ns", "b"), None);
        assert_eq!(store.len("ns"), 2);
    }

    #[test]
    fn test_builder_value_type_comes_from_binding() {
        let names: CacheStore<String> = CacheStore::builder().build();
        let counts: Arc<CacheStore<u64>> = Arc::new(CacheStore::builder().build());
        assert!(names.namespaces().is_empty());
        assert_eq!(counts.len("any"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_evicted_before_live_ones() {
        let store = store(2, 60);
        store.set_with_ttl("ns", "old", 1, Duration::from_secs(1));
        store.set("ns", "live", 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        store.set("ns", "new", 3);

        assert_eq!(store.get("ns", "live"), Some(2));
        assert_eq!(store.get("ns", "new"), Some(3));
        assert_eq!(store.stats("ns").evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_replaces_value_and_ttl() {
        let store = store(10, 10);
        store.set("ns", "a", 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        store.set("ns", "a", 2);
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(store.get("ns", "a"), Some(2));
        assert_eq!(store.len("ns"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let store = store(10, 60);
        store.set("ns", "a", 1);
        store.set("ns", "b", 2);

        assert!(store.delete("ns", "a"));
        assert!(!store.delete("ns", "a"));
        assert!(!store.delete("unknown", "a"));

        store.clear_namespace("ns");
        assert!(store.is_empty("ns"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespaces_are_isolated() {
        let store: CacheStore<u32> = CacheStore::default();
        store.set("one", "k", 1);
        store.set("two", "k", 2);

        assert_eq!(store.get("one", "k"), Some(1));
        assert_eq!(store.get("two", "k"), Some(2));
        assert_eq!(store.namespaces(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_namespace_uses_default_config() {
        let store: CacheStore<u32> =
            CacheStore::new(NamespaceConfig::new(1, Duration::from_secs(5)));
        store.set("fresh", "a", 1);
        store.set("fresh", "b", 2);

        assert_eq!(store.len("fresh"), 1);
        assert_eq!(store.namespace_config("fresh").ttl, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_sweeps_all_namespaces() {
        let store: CacheStore<u32> =
            CacheStore::new(NamespaceConfig::new(10, Duration::from_secs(5)));
        store.set("one", "a", 1);
        store.set("two", "b", 2);
        store.set_with_ttl("two", "c", 3, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len("one"), 0);
        assert_eq!(store.len("two"), 1);
        assert_eq!(store.total_stats().expirations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_touch_recency() {
        let store = store(2, 60);
        store.set("ns", "a", 1);
        store.set("ns", "b", 2);

        assert_eq!(store.peek("ns", "a").map(|e| e.value), Some(1));
        store.set("ns", "c", 3);

        assert!(!store.contains("ns", "a"));
        assert_eq!(store.stats("ns").hits, 0);
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..16,
            keys in prop::collection::vec(0u8..64, 0..200),
        ) {
            let store = store(capacity, 3600);
            for key in keys {
                store.set("ns", key.to_string(), u32::from(key));
                prop_assert!(store.len("ns") <= capacity);
            }
        }

        #[test]
        fn prop_most_recent_insert_survives(
            capacity in 1usize..16,
            keys in prop::collection::vec(0u8..64, 1..200),
        ) {
            let store = store(capacity, 3600);
            for key in &keys {
                store.set("ns", key.to_string(), u32::from(*key));
            }
            let last = keys[keys.len() - 1];
            prop_assert_eq!(store.get("ns", &last.to_string()), Some(u32::from(last)));
        }
    }
}
