use std::pin::Pin;
use std::sync::Arc;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use super::LiveMetrics;
use crate::JobEvent;

/// Type alias for boxed streams
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Fan-out point for queue events: every event is logged, counted and
/// published to in-process subscribers.
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1024);

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Log, count and publish an event
    pub fn emit(&self, event: JobEvent) {
        let queue = event.queue();

        match &event {
            JobEvent::Waiting { job_id, .. } => {
                debug!(queue, job_id = %job_id, "Job is waiting");
                self.metrics.increment_jobs_enqueued(queue);
            }
            JobEvent::Delayed { job_id, until, .. } => {
                debug!(queue, job_id = %job_id, until = %until, "Job is delayed");
                self.metrics.increment_jobs_enqueued(queue);
            }
            JobEvent::Active { job_id, attempt, .. } => {
                info!(queue, job_id = %job_id, attempt, "Job is now active");
            }
            JobEvent::Progress { job_id, progress, .. } => {
                debug!(queue, job_id = %job_id, progress, "Job progress");
            }
            JobEvent::Retrying { job_id, retry_at, error, .. } => {
                warn!(queue, job_id = %job_id, retry_at = %retry_at, "Job failed, will retry: {}", error);
                self.metrics.increment_jobs_retried(queue);
            }
            JobEvent::Completed { job_id, .. } => {
                info!(queue, job_id = %job_id, "Job completed");
                self.metrics.increment_jobs_completed(queue);
            }
            JobEvent::Failed { job_id, error, .. } => {
                error!(queue, job_id = %job_id, "Job failed: {}", error);
                self.metrics.increment_jobs_failed(queue);
            }
            JobEvent::Stalled { job_id, .. } => {
                warn!(queue, job_id = %job_id, "Job stalled");
                self.metrics.increment_jobs_stalled(queue);
            }
            JobEvent::Removed { job_id, .. } => {
                debug!(queue, job_id = %job_id, "Job removed");
            }
            JobEvent::Paused { .. } => info!(queue, "Queue paused"),
            JobEvent::Resumed { .. } => info!(queue, "Queue resumed"),
            JobEvent::Cleaned { state, count, .. } => {
                info!(queue, state = %state, count, "Queue cleaned");
            }
        }

        let _ = self.event_broadcaster.send(event);
    }

    /// Raw receiver; lagging receivers lose the oldest events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Event stream that skips over lag gaps
    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        Box::pin(
            BroadcastStream::new(self.event_broadcaster.subscribe())
                .filter_map(|event| async move { event.ok() }),
        )
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_emit_logs_counts_and_publishes() {
        let layer = ObservabilityLayer::new();
        let mut events = layer.event_stream();

        layer.emit(JobEvent::Failed {
            queue: "email".to_string(),
            job_id: "9".into(),
            error: "smtp down".to_string(),
            at: Utc::now(),
        });

        let event = events.next().await.unwrap();
        assert_eq!(event.event_name(), "failed");
        assert_eq!(layer.metrics().jobs_failed(), 1);
        assert!(logs_contain("Job failed: smtp down"));
    }
}
