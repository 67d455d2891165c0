use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{
    JobEvent, QueueResult, StalledSweep,
    backend::{QueueBackend, STALLED_LIMIT_REASON},
    observability::ObservabilityLayer,
};

/// Periodically recovers jobs whose lease expired because the slot that
/// claimed them died (crash, lost connection, blocked runtime).
pub struct StalledJobReaper {
    queue: String,
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
    interval: Duration,
    max_stalled: u32,
    keep_failed: Option<usize>,
    wake: Arc<Notify>,
}

impl StalledJobReaper {
    pub(crate) fn new(
        queue: String,
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
        interval: Duration,
        max_stalled: u32,
        keep_failed: Option<usize>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            backend,
            observability,
            interval,
            max_stalled,
            keep_failed,
            wake,
        }
    }

    /// Sweep on start, then every interval until shutdown is signalled
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);

        info!(queue = %self.queue, "Starting stalled job reaper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(sweep) if !sweep.is_empty() => {
                            info!(
                                queue = %self.queue,
                                "Recovered {} stalled jobs, failed {}",
                                sweep.requeued.len(),
                                sweep.failed.len()
                            );
                        }
                        Ok(_) => debug!(queue = %self.queue, "No stalled jobs found"),
                        Err(e) => warn!(queue = %self.queue, "Error during stalled job sweep: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(queue = %self.queue, "Stalled job reaper stopped");
    }

    /// Run one sweep
    pub async fn reap_once(&self) -> QueueResult<StalledSweep> {
        let sweep = self
            .backend
            .requeue_stalled(&self.queue, self.max_stalled, self.keep_failed)
            .await?;

        let now = Utc::now();
        for job_id in sweep.requeued.iter().chain(&sweep.failed) {
            self.observability.emit(JobEvent::Stalled {
                queue: self.queue.clone(),
                job_id: job_id.clone(),
                at: now,
            });
        }
        for job_id in &sweep.failed {
            self.observability.emit(JobEvent::Failed {
                queue: self.queue.clone(),
                job_id: job_id.clone(),
                error: STALLED_LIMIT_REASON.to_string(),
                at: now,
            });
        }

        if !sweep.requeued.is_empty() {
            self.wake.notify_waiters();
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::{Backoff, JobState, NewJob};

    fn reaper(backend: &MemoryBackend, max_stalled: u32) -> StalledJobReaper {
        StalledJobReaper::new(
            "email".to_string(),
            Arc::new(backend.clone()),
            ObservabilityLayer::new(),
            Duration::from_secs(30),
            max_stalled,
            Some(50),
            Arc::new(Notify::new()),
        )
    }

    fn new_job() -> NewJob {
        NewJob {
            payload: serde_json::json!({}),
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff: Backoff::fixed(Duration::ZERO),
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_requeued() {
        let backend = MemoryBackend::new();
        backend.enqueue("email", new_job()).await.unwrap();
        let leased = backend.claim("email", Duration::from_secs(30)).await.unwrap().unwrap();

        // A live lease is left alone
        assert!(reaper(&backend, 1).reap_once().await.unwrap().is_empty());

        backend.force_lease_expiry("email", &leased.record.id);
        let sweep = reaper(&backend, 1).reap_once().await.unwrap();
        assert_eq!(sweep.requeued, vec![leased.record.id.clone()]);

        let again = backend.claim("email", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(again.record.id, leased.record.id);
        assert_eq!(again.record.attempts_made, 2);
        assert_eq!(again.record.stalled_count, 1);
    }

    #[tokio::test]
    async fn test_repeated_stalls_fail_the_job() {
        let backend = MemoryBackend::new();
        let record = backend.enqueue("email", new_job()).await.unwrap();
        let reaper = reaper(&backend, 1);

        for _ in 0..2 {
            backend.claim("email", Duration::from_secs(30)).await.unwrap().unwrap();
            backend.force_lease_expiry("email", &record.id);
            reaper.reap_once().await.unwrap();
        }

        let failed = backend.get("email", &record.id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));
        assert!(failed.finished_on.is_some());
    }
}
