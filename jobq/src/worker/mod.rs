//! Dispatch: slots that claim, run and settle jobs of one queue.

pub mod context;
pub mod processor;
pub mod reaper;

pub use context::JobContext;
pub use processor::Processor;
pub use reaper::StalledJobReaper;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    JobError, JobEvent, JobId, JobRecord, LeasedJob, QueueError, QueueResult,
    backend::QueueBackend,
    observability::ObservabilityLayer,
    registry::QueueOptions,
    types::{self, LeaseToken},
};

/// Everything a slot needs, shared by all slots of one queue
pub(crate) struct Dispatcher {
    queue: String,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<dyn Processor>,
    observability: ObservabilityLayer,
    options: QueueOptions,
    wake: Arc<Notify>,
    in_flight: Mutex<HashMap<JobId, LeaseToken>>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: &str,
        backend: Arc<dyn QueueBackend>,
        processor: Arc<dyn Processor>,
        observability: ObservabilityLayer,
        options: QueueOptions,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            backend,
            processor,
            observability,
            options,
            wake,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn run_slot(self: Arc<Self>, slot: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = %self.queue, slot, "Slot started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.backend.claim(&self.queue, self.options.lock_duration).await {
                Ok(Some(leased)) => self.run_job(leased).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = sleep(self.options.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, slot, "Failed to claim job: {}", e);
                    tokio::select! {
                        _ = sleep(self.options.poll_interval.max(Duration::from_secs(1))) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        debug!(queue = %self.queue, slot, "Slot stopped");
    }

    async fn run_job(&self, leased: LeasedJob) {
        let LeasedJob { record, lease_token, .. } = leased;
        let job_id = record.id.clone();

        self.in_flight.lock().insert(job_id.clone(), lease_token.clone());
        self.observability.emit(JobEvent::Active {
            queue: self.queue.clone(),
            job_id: job_id.clone(),
            attempt: record.attempts_made,
            at: Utc::now(),
        });

        let span = info_span!(
            "job",
            queue = %self.queue,
            job_id = %job_id,
            attempt = record.attempts_made
        );
        async {
            let context = JobContext::new(
                record.clone(),
                lease_token.clone(),
                self.backend.clone(),
                self.observability.clone(),
            );
            let outcome = self.execute(record.payload.clone(), context, &lease_token).await;
            self.settle(&record, &lease_token, outcome).await;
        }
        .instrument(span)
        .await;

        self.in_flight.lock().remove(&job_id);
    }

    /// Run the processor while keeping the lease alive
    async fn execute(
        &self,
        payload: Value,
        context: JobContext,
        token: &LeaseToken,
    ) -> Result<Value, JobError> {
        let job_id = context.id().clone();
        let work = AssertUnwindSafe(self.processor.process(payload, context)).catch_unwind();
        tokio::pin!(work);

        let period = (self.options.lock_duration / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut work => {
                    return match result {
                        Ok(outcome) => outcome,
                        Err(panic) => Err(JobError::retryable(format!(
                            "processor panicked: {}",
                            panic_message(panic.as_ref())
                        ))),
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .backend
                        .extend_lease(&self.queue, &job_id, token, self.options.lock_duration)
                        .await
                    {
                        warn!(queue = %self.queue, job_id = %job_id, "Could not extend lease: {}", e);
                    }
                }
            }
        }
    }

    /// Record the outcome: complete, schedule a retry, or fail for good
    async fn settle(&self, record: &JobRecord, token: &LeaseToken, outcome: Result<Value, JobError>) {
        let job_id = &record.id;
        let settled = match outcome {
            Ok(value) => self.complete(job_id, token, value).await,
            Err(job_error) if job_error.is_retryable() && record.has_attempts_left() => {
                let delay = record.backoff.delay_for(record.attempts_made);
                let retry_at = types::saturating_offset(Utc::now(), delay);
                self.retry(job_id, token, job_error.message(), retry_at).await
            }
            Err(job_error) => self.fail(job_id, token, job_error.message()).await,
        };

        match settled {
            Ok(()) => {}
            Err(QueueError::LeaseLost(_)) | Err(QueueError::JobNotFound(_)) => {
                warn!(
                    queue = %self.queue,
                    job_id = %job_id,
                    "Job was reclaimed or removed while running; its outcome was dropped"
                );
            }
            Err(e) => error!(queue = %self.queue, job_id = %job_id, "Failed to settle job: {}", e),
        }
    }

    async fn complete(&self, job_id: &JobId, token: &LeaseToken, value: Value) -> QueueResult<()> {
        self.backend
            .complete(&self.queue, job_id, token, value, self.options.keep_completed)
            .await?;
        self.observability.emit(JobEvent::Completed {
            queue: self.queue.clone(),
            job_id: job_id.clone(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn retry(
        &self,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.backend
            .fail(&self.queue, job_id, token, error, Some(retry_at), None)
            .await?;
        self.observability.emit(JobEvent::Retrying {
            queue: self.queue.clone(),
            job_id: job_id.clone(),
            retry_at,
            error: error.to_string(),
            at: Utc::now(),
        });
        self.wake.notify_waiters();
        Ok(())
    }

    async fn fail(&self, job_id: &JobId, token: &LeaseToken, error: &str) -> QueueResult<()> {
        self.backend
            .fail(&self.queue, job_id, token, error, None, self.options.keep_failed)
            .await?;
        self.observability.emit(JobEvent::Failed {
            queue: self.queue.clone(),
            job_id: job_id.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The running slots and reaper of one queue
pub(crate) struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

impl WorkerPool {
    pub(crate) fn spawn(dispatcher: Dispatcher, concurrency: usize) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let slots = (0..concurrency)
            .map(|slot| tokio::spawn(dispatcher.clone().run_slot(slot, shutdown_rx.clone())))
            .collect();

        let reaper = StalledJobReaper::new(
            dispatcher.queue.clone(),
            dispatcher.backend.clone(),
            dispatcher.observability.clone(),
            dispatcher.options.stalled_interval,
            dispatcher.options.max_stalled_count,
            dispatcher.options.keep_failed,
            dispatcher.wake.clone(),
        );
        let reaper = tokio::spawn(reaper.start(shutdown_rx));

        info!(queue = %dispatcher.queue, concurrency, "Worker pool started");

        Self {
            dispatcher,
            shutdown_tx,
            slots,
            reaper,
        }
    }

    /// Stop claiming, wait up to `timeout` for running jobs, then abort the
    /// rest and hand their jobs back to `waiting`. Returns how many jobs were
    /// handed back.
    pub(crate) async fn shutdown(mut self, timeout: Duration) -> usize {
        let queue = self.dispatcher.queue.clone();
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.wake.notify_waiters();

        let drained = tokio::time::timeout(timeout, futures::future::join_all(self.slots.iter_mut()))
            .await
            .is_ok();

        self.reaper.abort();
        let _ = (&mut self.reaper).await;

        if drained {
            info!(queue = %queue, "Worker pool drained");
            return 0;
        }

        for slot in &self.slots {
            slot.abort();
        }
        // slots that finished inside the timed-out join were already consumed
        for slot in self.slots.iter_mut() {
            if !slot.is_finished() {
                let _ = slot.await;
            }
        }

        let abandoned: Vec<(JobId, LeaseToken)> = self.dispatcher.in_flight.lock().drain().collect();
        for (job_id, token) in &abandoned {
            match self.dispatcher.backend.release(&queue, job_id, token).await {
                Ok(true) => warn!(queue = %queue, job_id = %job_id, "Released unfinished job back to waiting"),
                Ok(false) => {}
                Err(e) => error!(queue = %queue, job_id = %job_id, "Failed to release job: {}", e),
            }
        }
        abandoned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
