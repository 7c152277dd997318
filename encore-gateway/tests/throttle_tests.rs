//! Request throttle under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use encore_core::{GatewayError, GatewayResult, ThrottleConfig, TransportError};
use encore_gateway::RequestThrottle;
use tokio::time::Instant;

struct Workload {
    active: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
}

impl Workload {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        })
    }

    async fn work(&self, hold: Duration) -> GatewayResult<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.starts.lock().expect("starts").push(Instant::now());
        tokio::time::sleep(hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_and_gap_hold_under_load() {
    let gap = Duration::from_millis(10);
    let throttle = Arc::new(RequestThrottle::new(
        &ThrottleConfig::default()
            .with_ceiling(3)
            .with_min_start_gap(gap),
    ));
    let workload = Workload::new();

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let throttle = throttle.clone();
            let workload = workload.clone();
            tokio::spawn(async move {
                throttle
                    .admit(workload.work(Duration::from_millis(50)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join").expect("admitted");
    }

    assert_eq!(workload.peak.load(Ordering::SeqCst), 3);
    assert_eq!(throttle.active(), 0);
    assert_eq!(throttle.queued(), 0);

    let mut starts = workload.starts.lock().expect("starts").clone();
    assert_eq!(starts.len(), 12);
    starts.sort();
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= gap);
    }
}

#[tokio::test(start_paused = true)]
async fn test_closed_throttle_rejects_new_work() {
    let throttle = RequestThrottle::new(&ThrottleConfig::default());
    throttle.close();

    let workload = Workload::new();
    let err = throttle
        .admit(workload.work(Duration::ZERO))
        .await
        .expect_err("closed");
    assert_eq!(err, GatewayError::Transport(TransportError::Closed));
    assert_eq!(workload.starts.lock().expect("starts").len(), 0);
}
