//! Read-through access with request deduplication.
//!
//! `fetch_once` serves live entries from the [`CacheStore`], and collapses
//! concurrent misses for the same key into a single producer call whose
//! result every waiter receives.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::store::CacheStore;

type PendingKey = (String, String);
type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// An in-flight producer call. The id guards against a settled fetch
/// clearing a newer registration for the same key.
struct PendingFetch<V, E> {
    id: u64,
    future: SharedFetch<V, E>,
}

/// Read-through cache over a shared [`CacheStore`].
///
/// Producer errors are returned to every waiter and never cached, so a
/// failed fetch does not block the key.
pub struct ReadThroughCache<V, E> {
    store: Arc<CacheStore<V>>,
    pending: Arc<DashMap<PendingKey, PendingFetch<V, E>>>,
    next_id: AtomicU64,
}

impl<V, E> ReadThroughCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>) -> Self {
        Self {
            store,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    /// Return the cached value for `key`, or run `producer` exactly once for
    /// all concurrent callers that miss on it.
    ///
    /// On success the value is stored under the namespace's TTL before the
    /// in-flight marker is cleared. On failure only the marker is cleared.
    /// The producer runs on its own task, so it settles even if every caller
    /// stops waiting. Must be called from within a Tokio runtime.
    pub async fn fetch_once<F, Fut>(&self, namespace: &str, key: &str, producer: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.store.get(namespace, key) {
            return Ok(value);
        }

        let pending_key = (namespace.to_string(), key.to_string());
        let future = match self.pending.entry(pending_key.clone()) {
            Entry::Occupied(occupied) => {
                tracing::trace!(namespace, key, "Joining in-flight fetch");
                occupied.get().future.clone()
            }
            Entry::Vacant(vacant) => {
                // A fetch may have settled between the store miss and taking
                // the shard lock.
                if let Some(entry) = self.store.peek(namespace, key) {
                    return Ok(entry.value);
                }

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let future = self.settle(pending_key, id, producer());
                vacant.insert(PendingFetch {
                    id,
                    future: future.clone(),
                });
                // Runs to completion even when every waiter is cancelled.
                tokio::spawn(future.clone());
                tracing::trace!(namespace, key, fetch_id = id, "Starting fetch");
                future
            }
        };

        future.await
    }

    /// Wrap a producer so its completion stores the value and clears the
    /// in-flight marker atomically with respect to new callers.
    fn settle<Fut>(&self, pending_key: PendingKey, id: u64, producer: Fut) -> SharedFetch<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);

        async move {
            let result = producer.await;
            if let Entry::Occupied(occupied) = pending.entry(pending_key) {
                if occupied.get().id == id {
                    let (namespace, key) = occupied.key();
                    if let Ok(value) = &result {
                        store.set(namespace, key.clone(), value.clone());
                    }
                    occupied.remove();
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Drop the cached value and forget any in-flight fetch for `key`.
    ///
    /// Waiters already joined to a forgotten fetch still receive its result,
    /// but that result is not written back.
    pub fn invalidate(&self, namespace: &str, key: &str) {
        self.store.delete(namespace, key);
        self.pending
            .remove(&(namespace.to_string(), key.to_string()));
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_in_flight(&self, namespace: &str, key: &str) -> bool {
        self.pending
            .contains_key(&(namespace.to_string(), key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cache() -> ReadThroughCache<u32, String> {
        let store = CacheStore::builder()
            .namespace("records", NamespaceConfig::new(100, Duration::from_secs(60)))
            .build();
        ReadThroughCache::new(Arc::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_skips_producer() {
        let cache = cache();
        cache.store().set("records", "a", 7);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = cache
            .fetch_once("records", "a", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert_eq!(value, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_stores_result() {
        let cache = cache();
        let value = cache
            .fetch_once("records", "a", || async { Ok(3) })
            .await;

        assert_eq!(value, Ok(3));
        assert_eq!(cache.store().get("records", "a"), Some(3));
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_producer() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .fetch_once("records", "hot", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("task panicked"), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .fetch_once("records", "bad", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<u32, _>("backend down".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(
                handle.await.expect("task panicked"),
                Err("backend down".to_string())
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_in_flight("records", "bad"));
        assert!(!cache.store().contains("records", "bad"));

        // The key is not blocked: the next call runs a fresh producer.
        let value = cache.fetch_once("records", "bad", || async { Ok(9) }).await;
        assert_eq!(value, Ok(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_still_settles() {
        let cache = cache();

        let gave_up = tokio::time::timeout(
            Duration::from_millis(10),
            cache.fetch_once("records", "slow", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(5)
            }),
        )
        .await;
        assert!(gave_up.is_err());
        assert!(cache.is_in_flight("records", "slow"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!cache.is_in_flight("records", "slow"));
        assert_eq!(cache.store().get("records", "slow"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_fetch_independently() {
        let cache = cache();
        let (a, b) = tokio::join!(
            cache.fetch_once("records", "a", || async { Ok(1) }),
            cache.fetch_once("records", "b", || async { Ok(2) }),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetches() {
        let cache = cache();
        cache.fetch_once("records", "a", || async { Ok(1) }).await.ok();

        tokio::time::advance(Duration::from_secs(61)).await;
        let value = cache.fetch_once("records", "a", || async { Ok(2) }).await;
        assert_eq!(value, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forgets_value_and_pending_fetch() {
        let cache = Arc::new(cache());
        cache.store().set("records", "a", 1);
        cache.invalidate("records", "a");
        assert!(!cache.store().contains("records", "a"));

        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .fetch_once("records", "b", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(cache.is_in_flight("records", "b"));

        cache.invalidate("records", "b");
        assert!(!cache.is_in_flight("records", "b"));

        // The forgotten fetch still answers its waiter but does not write back.
        assert_eq!(slow.await.expect("task panicked"), Ok(1));
        assert!(!cache.store().contains("records", "b"));
    }
}
