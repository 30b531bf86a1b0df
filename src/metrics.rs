use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use data_model::epoch_time_ms;

/// Per-task request counters plus the last-activity timestamp used by the
/// surrounding system to detect a hung task. Observability only; never
/// consulted for correctness.
#[derive(Debug)]
pub struct RemoteTaskMetrics {
    pub status_fetches: AtomicU64,
    pub dynamic_filter_fetches: AtomicU64,
    pub update_rounds: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl Default for RemoteTaskMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTaskMetrics {
    pub fn new() -> Self {
        Self {
            status_fetches: AtomicU64::new(0),
            dynamic_filter_fetches: AtomicU64::new(0),
            update_rounds: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(epoch_time_ms()),
        }
    }

    /// Every request/response cycle touches this, success or failure.
    pub fn touch(&self) {
        self.last_activity_ms.store(epoch_time_ms(), Ordering::Relaxed);
    }

    pub fn record_status_fetch(&self) {
        self.status_fetches.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_dynamic_filter_fetch(&self) {
        self.dynamic_filter_fetches.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_update_round(&self) {
        self.update_rounds.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(epoch_time_ms().saturating_sub(last))
    }
}
