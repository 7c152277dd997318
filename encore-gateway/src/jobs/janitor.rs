//! Cache Janitor Background Task
//!
//! Expired entries are already invisible to readers; the janitor reclaims
//! their memory on a fixed interval so idle namespaces do not hold dead
//! values until the next insert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use encore_cache::Purge;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::JanitorConfig;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for janitor activity.
#[derive(Debug, Default)]
pub struct JanitorMetrics {
    /// Entries removed since startup
    pub entries_purged: AtomicU64,

    /// Sweep cycles completed
    pub sweeps: AtomicU64,
}

impl JanitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JanitorSnapshot {
        JanitorSnapshot {
            entries_purged: self.entries_purged.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JanitorSnapshot {
    pub entries_purged: u64,
    pub sweeps: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Sweep `stores` every `config.interval` until `shutdown` is cancelled.
///
/// The first sweep runs one full interval after start.
pub async fn janitor_task(
    stores: Vec<Arc<dyn Purge>>,
    config: JanitorConfig,
    shutdown: CancellationToken,
) -> Arc<JanitorMetrics> {
    let metrics = Arc::new(JanitorMetrics::new());

    let mut sweep_interval = interval(config.interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    sweep_interval.tick().await;

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        stores = stores.len(),
        "Cache janitor started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Cache janitor shutting down");
                break;
            }

            _ = sweep_interval.tick() => {
                sweep(&stores, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        entries_purged = snapshot.entries_purged,
        sweeps = snapshot.sweeps,
        "Cache janitor completed"
    );

    metrics
}

fn sweep(stores: &[Arc<dyn Purge>], metrics: &JanitorMetrics) {
    let purged: usize = stores.iter().map(|store| store.purge_expired()).sum();
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    metrics
        .entries_purged
        .fetch_add(purged as u64, Ordering::Relaxed);
    if purged > 0 {
        tracing::debug!(purged, "Expired cache entries swept");
    }
}

/// Spawn the janitor, or a no-op task when disabled.
pub fn spawn_janitor(
    stores: Vec<Arc<dyn Purge>>,
    config: JanitorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<Arc<JanitorMetrics>> {
    if !config.enabled {
        tracing::info!("Cache janitor disabled");
        return tokio::spawn(async { Arc::new(JanitorMetrics::new()) });
    }
    tokio::spawn(janitor_task(stores, config, shutdown))
}
