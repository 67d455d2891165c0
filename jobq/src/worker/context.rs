use std::sync::Arc;
use chrono::Utc;

use crate::{
    JobEvent, JobId, JobRecord, QueueError, QueueResult,
    backend::QueueBackend,
    observability::ObservabilityLayer,
    types::LeaseToken,
};

/// Handle a processor gets for the job it is running.
///
/// It carries the lease token of the claim, so writes made through it are
/// accepted only while this slot still owns the job. The token itself never
/// leaves the context.
#[derive(Clone)]
pub struct JobContext {
    record: JobRecord,
    token: LeaseToken,
    backend: Arc<dyn QueueBackend>,
    observability: ObservabilityLayer,
}

impl JobContext {
    pub(crate) fn new(
        record: JobRecord,
        token: LeaseToken,
        backend: Arc<dyn QueueBackend>,
        observability: ObservabilityLayer,
    ) -> Self {
        Self {
            record,
            token,
            backend,
            observability,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    /// 1 on the first delivery, 2 on the first retry, ...
    pub fn attempts_made(&self) -> u32 {
        self.record.attempts_made
    }

    /// The job as it was when this slot claimed it
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Report progress and get the updated snapshot back.
    ///
    /// Values above 100 fail with `ProgressOutOfRange`; a value below the
    /// last one written during this delivery fails with `ProgressRegressed`.
    /// Repeating the current value is accepted. A retried job starts again
    /// at 0.
    pub async fn progress(&self, value: u32) -> QueueResult<JobRecord> {
        let progress = u8::try_from(value)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(QueueError::ProgressOutOfRange { value })?;

        let record = self
            .backend
            .update_progress(&self.record.queue, &self.record.id, &self.token, progress)
            .await?;

        self.observability.emit(JobEvent::Progress {
            queue: record.queue.clone(),
            job_id: record.id.clone(),
            progress: record.progress,
            at: Utc::now(),
        });
        Ok(record)
    }

    /// Whether the job was removed, settled elsewhere or reclaimed by another
    /// slot while running. Cancellation is cooperative: long processors
    /// should poll this.
    pub async fn is_cancelled(&self) -> bool {
        match self
            .backend
            .holds_lease(&self.record.queue, &self.record.id, &self.token)
            .await
        {
            Ok(held) => !held,
            // Unknown is not cancelled
            Err(_) => false,
        }
    }
}
