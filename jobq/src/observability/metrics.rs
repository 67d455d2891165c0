use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::RwLock;
use serde::Serialize;

/// Live counters for job outcomes, overall and per queue
#[derive(Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_stalled: AtomicU64,

    per_queue: RwLock<HashMap<String, QueueMetrics>>,
}

/// Outcome counters of a single queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, queue: &str, total: &AtomicU64, field: impl FnOnce(&mut QueueMetrics) -> &mut u64) {
        total.fetch_add(1, Ordering::Relaxed);
        let mut per_queue = self.per_queue.write();
        *field(per_queue.entry(queue.to_string()).or_default()) += 1;
    }

    pub fn increment_jobs_enqueued(&self, queue: &str) {
        self.bump(queue, &self.jobs_enqueued, |m| &mut m.enqueued);
    }

    pub fn increment_jobs_completed(&self, queue: &str) {
        self.bump(queue, &self.jobs_completed, |m| &mut m.completed);
    }

    pub fn increment_jobs_failed(&self, queue: &str) {
        self.bump(queue, &self.jobs_failed, |m| &mut m.failed);
    }

    pub fn increment_jobs_retried(&self, queue: &str) {
        self.bump(queue, &self.jobs_retried, |m| &mut m.retried);
    }

    pub fn increment_jobs_stalled(&self, queue: &str) {
        self.bump(queue, &self.jobs_stalled, |m| &mut m.stalled);
    }

    pub fn jobs_enqueued(&self) -> u64 {
        self.jobs_enqueued.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn jobs_stalled(&self) -> u64 {
        self.jobs_stalled.load(Ordering::Relaxed)
    }

    /// Counters of one queue, if it has seen any traffic
    pub fn queue(&self, queue: &str) -> Option<QueueMetrics> {
        self.per_queue.read().get(queue).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_totals_and_queues() {
        let metrics = LiveMetrics::new();
        metrics.increment_jobs_enqueued("email");
        metrics.increment_jobs_enqueued("notification");
        metrics.increment_jobs_completed("email");

        assert_eq!(metrics.jobs_enqueued(), 2);
        assert_eq!(metrics.jobs_completed(), 1);
        assert_eq!(
            metrics.queue("email"),
            Some(QueueMetrics { enqueued: 1, completed: 1, ..Default::default() })
        );
        assert!(metrics.queue("sms").is_none());
    }
}
