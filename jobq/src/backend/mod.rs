pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::{
    JobId, JobRecord, LeasedJob, NewJob, QueueResult, QueueStats, StalledSweep, TerminalState,
    types::LeaseToken,
};

/// Reason recorded on a job that kept losing its lease
pub(crate) const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Storage primitives for named queues.
///
/// Every method is atomic with respect to the store, which is what makes
/// concurrent slots (in this process or another one sharing the store) safe.
/// `claim` is the only way a job becomes active; every owner write carries the
/// lease token the claim handed out and is rejected with `LeaseLost` once
/// that lease is gone.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Durably record a new job and assign its id
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord>;

    /// Promote due delayed jobs, then pop the next waiting job (lowest
    /// priority, then enqueue order) and lease it. Paused queues yield `None`.
    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<LeasedJob>>;

    /// Push the lease expiry of an active job forward
    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>>;

    /// Whether `token` is still the lease of an active job. Read only.
    async fn holds_lease(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool>;

    /// Owner-only, non-decreasing progress write
    async fn update_progress(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        progress: u8,
    ) -> QueueResult<JobRecord>;

    /// Settle an active job as completed and trim completed history to `keep`
    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        return_value: Value,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord>;

    /// Settle an active job as failed. With `retry_at` the job goes back to
    /// `delayed` (or `waiting` if already due); without it the failure is
    /// terminal and failed history is trimmed to `keep`.
    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord>;

    /// Hand an active job back to `waiting` without counting a stall
    async fn release(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool>;

    /// Recover active jobs whose lease expired
    async fn requeue_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        keep_failed: Option<usize>,
    ) -> QueueResult<StalledSweep>;

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Delete a job in any state; `false` if it did not exist
    async fn remove(&self, queue: &str, job_id: &JobId) -> QueueResult<bool>;

    async fn pause(&self, queue: &str) -> QueueResult<()>;

    async fn resume(&self, queue: &str) -> QueueResult<()>;

    async fn is_paused(&self, queue: &str) -> QueueResult<bool>;

    /// Delete jobs in `state` finished before `cutoff` (`None`: all of them)
    async fn clean(
        &self,
        queue: &str,
        state: TerminalState,
        cutoff: Option<DateTime<Utc>>,
    ) -> QueueResult<usize>;

    async fn counts(&self, queue: &str) -> QueueResult<QueueStats>;

    /// Round-trip to the store
    async fn ping(&self) -> QueueResult<()>;

    async fn close(&self) -> QueueResult<()>;
}
