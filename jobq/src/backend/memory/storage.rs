use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    JobId, JobRecord, JobState, LeasedJob, NewJob, QueueError, QueueResult, QueueStats,
    StalledSweep, TerminalState,
    backend::{QueueBackend, STALLED_LIMIT_REASON},
    types::{self, LeaseToken},
};

// Time-ordered index, ties broken by enqueue sequence
type TimeIndex = BTreeMap<(DateTime<Utc>, u64), JobId>;

struct StoredJob {
    record: JobRecord,
    seq: u64,
    lease: Option<(LeaseToken, DateTime<Utc>)>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    paused: bool,
    jobs: HashMap<JobId, StoredJob>,
    /// (priority, seq) -> job, lowest first
    wait: BTreeMap<(u32, u64), JobId>,
    delayed: TimeIndex,
    active: HashSet<JobId>,
    completed: TimeIndex,
    failed: TimeIndex,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<_> = self
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, id)| (*key, id.clone()))
            .collect();

        for (key, job_id) in due {
            self.delayed.remove(&key);
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.record.state = JobState::Waiting;
                self.wait.insert((job.record.priority, job.seq), job_id);
            }
        }
    }

    /// Resolve an owner write: the job must exist, be active and carry `token`
    fn owned(&mut self, job_id: &JobId, token: &LeaseToken) -> QueueResult<&mut StoredJob> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))?;

        let holds_lease = matches!(&job.lease, Some((held, _)) if held == token)
            && job.record.state == JobState::Active;
        if holds_lease {
            Ok(job)
        } else {
            Err(QueueError::LeaseLost(job_id.clone()))
        }
    }

    /// Drop the oldest entries of a history index beyond `keep`
    fn trim(&mut self, state: TerminalState, keep: Option<usize>) {
        let Some(keep) = keep else { return };
        let index = match state {
            TerminalState::Completed => &mut self.completed,
            TerminalState::Failed => &mut self.failed,
        };
        while index.len() > keep {
            if let Some((_, job_id)) = index.pop_first() {
                self.jobs.remove(&job_id);
            }
        }
    }

    fn mark_failed(&mut self, job_id: &JobId, reason: &str, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.lease = None;
            job.record.state = JobState::Failed;
            job.record.failed_reason = Some(reason.to_string());
            job.record.finished_on = Some(now);
            self.failed.insert((now, job.seq), job_id.clone());
        }
        self.active.remove(job_id);
    }

    fn requeue(&mut self, job_id: &JobId) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.lease = None;
            job.record.state = JobState::Waiting;
            self.wait.insert((job.record.priority, job.seq), job_id.clone());
        }
        self.active.remove(job_id);
    }

    /// Remove a job from whichever index its state puts it in
    fn unindex(&mut self, job: &StoredJob) {
        let record = &job.record;
        match record.state {
            JobState::Waiting | JobState::Paused => {
                self.wait.remove(&(record.priority, job.seq));
            }
            JobState::Delayed => {
                if let Some(ready_at) = record.ready_at {
                    self.delayed.remove(&(ready_at, job.seq));
                }
            }
            JobState::Active => {
                self.active.remove(&record.id);
            }
            JobState::Completed => {
                if let Some(finished) = record.finished_on {
                    self.completed.remove(&(finished, job.seq));
                }
            }
            JobState::Failed => {
                if let Some(finished) = record.finished_on {
                    self.failed.remove(&(finished, job.seq));
                }
            }
        }
    }
}

/// In-memory backend for tests and single-process development.
///
/// Clones share the same store, so several services built over clones of one
/// `MemoryBackend` behave like worker processes sharing one Redis.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the lease of an active job ran out (test helper)
    pub fn force_lease_expiry(&self, queue: &str, job_id: &JobId) {
        let mut queues = self.queues.lock();
        if let Some(job) = queues
            .get_mut(queue)
            .and_then(|state| state.jobs.get_mut(job_id))
        {
            if let Some((_, until)) = job.lease.as_mut() {
                *until = Utc::now() - chrono::Duration::seconds(1);
            }
        }
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        f(state)
    }
}

fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    types::saturating_offset(now, duration)
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<JobRecord> {
        let now = Utc::now();

        Ok(self.with_queue(queue, |state| {
            state.next_seq += 1;
            let seq = state.next_seq;
            let job_id = JobId::from_seq(seq);
            let record = JobRecord::new(job_id.clone(), queue, job, now);

            match record.ready_at {
                Some(ready_at) => {
                    state.delayed.insert((ready_at, seq), job_id.clone());
                }
                None => {
                    state.wait.insert((record.priority, seq), job_id.clone());
                }
            }

            state.jobs.insert(
                job_id,
                StoredJob {
                    record: record.clone(),
                    seq,
                    lease: None,
                },
            );
            record
        }))
    }

    async fn claim(&self, queue: &str, lease: Duration) -> QueueResult<Option<LeasedJob>> {
        let now = Utc::now();

        Ok(self.with_queue(queue, |state| {
            state.promote_due(now);
            if state.paused {
                return None;
            }

            let (_, job_id) = state.wait.pop_first()?;
            let job = state.jobs.get_mut(&job_id)?;

            let lease_token = LeaseToken::new();
            let lease_until = after(now, lease);

            job.record.state = JobState::Active;
            job.record.attempts_made += 1;
            job.record.progress = 0;
            job.record.processed_on.get_or_insert(now);
            job.lease = Some((lease_token.clone(), lease_until));

            let record = job.record.clone();
            state.active.insert(job_id);

            Some(LeasedJob {
                record,
                lease_token,
                lease_until,
            })
        }))
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        self.with_queue(queue, |state| {
            let job = state.owned(job_id, token)?;
            let until = after(Utc::now(), lease);
            job.lease = Some((token.clone(), until));
            Ok(until)
        })
    }

    async fn holds_lease(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool> {
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .and_then(|state| state.jobs.get(job_id))
            .is_some_and(|job| {
                job.record.state == JobState::Active
                    && matches!(&job.lease, Some((held, _)) if held == token)
            }))
    }

    async fn update_progress(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        progress: u8,
    ) -> QueueResult<JobRecord> {
        if progress > 100 {
            return Err(QueueError::ProgressOutOfRange { value: progress.into() });
        }

        self.with_queue(queue, |state| {
            let job = state.owned(job_id, token)?;
            if progress < job.record.progress {
                return Err(QueueError::ProgressRegressed {
                    job_id: job_id.clone(),
                    current: job.record.progress,
                    value: progress,
                });
            }
            job.record.progress = progress;
            Ok(job.record.clone())
        })
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        return_value: Value,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord> {
        let now = Utc::now();

        self.with_queue(queue, |state| {
            let job = state.owned(job_id, token)?;
            job.lease = None;
            job.record.state = JobState::Completed;
            job.record.finished_on = Some(now);
            job.record.return_value = Some(return_value);
            let record = job.record.clone();
            let seq = job.seq;

            state.active.remove(job_id);
            state.completed.insert((now, seq), job_id.clone());
            state.trim(TerminalState::Completed, keep);
            Ok(record)
        })
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &LeaseToken,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        keep: Option<usize>,
    ) -> QueueResult<JobRecord> {
        let now = Utc::now();

        self.with_queue(queue, |state| {
            state.owned(job_id, token)?;

            match retry_at {
                Some(retry_at) if retry_at > now => {
                    state.active.remove(job_id);
                    if let Some(job) = state.jobs.get_mut(job_id) {
                        job.lease = None;
                        job.record.state = JobState::Delayed;
                        job.record.ready_at = Some(retry_at);
                        state.delayed.insert((retry_at, job.seq), job_id.clone());
                    }
                }
                Some(_) => state.requeue(job_id),
                None => {
                    state.mark_failed(job_id, error, now);
                    let record = state.jobs.get(job_id).map(|job| job.record.clone());
                    state.trim(TerminalState::Failed, keep);
                    return record.ok_or_else(|| QueueError::JobNotFound(job_id.clone()));
                }
            }

            state
                .jobs
                .get(job_id)
                .map(|job| job.record.clone())
                .ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
        })
    }

    async fn release(&self, queue: &str, job_id: &JobId, token: &LeaseToken) -> QueueResult<bool> {
        self.with_queue(queue, |state| match state.owned(job_id, token).map(|_| ()) {
            Ok(()) => {
                state.requeue(job_id);
                Ok(true)
            }
            Err(QueueError::LeaseLost(_)) | Err(QueueError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        })
    }

    async fn requeue_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        keep_failed: Option<usize>,
    ) -> QueueResult<StalledSweep> {
        let now = Utc::now();

        Ok(self.with_queue(queue, |state| {
            let mut expired: Vec<(u64, JobId)> = state
                .active
                .iter()
                .filter_map(|job_id| {
                    let job = state.jobs.get(job_id)?;
                    match job.lease {
                        Some((_, until)) if until <= now => Some((job.seq, job_id.clone())),
                        _ => None,
                    }
                })
                .collect();
            expired.sort();

            let mut sweep = StalledSweep::default();
            for (_, job_id) in expired {
                let stalled_count = match state.jobs.get_mut(&job_id) {
                    Some(job) => {
                        job.record.stalled_count += 1;
                        job.record.stalled_count
                    }
                    None => continue,
                };

                if stalled_count > max_stalled {
                    state.mark_failed(&job_id, STALLED_LIMIT_REASON, now);
                    sweep.failed.push(job_id);
                } else {
                    state.requeue(&job_id);
                    sweep.requeued.push(job_id);
                }
            }

            if !sweep.failed.is_empty() {
                state.trim(TerminalState::Failed, keep_failed);
            }
            sweep
        }))
    }

    async fn get(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .and_then(|state| state.jobs.get(job_id))
            .map(|job| job.record.clone()))
    }

    async fn remove(&self, queue: &str, job_id: &JobId) -> QueueResult<bool> {
        self.with_queue(queue, |state| match state.jobs.remove(job_id) {
            Some(job) => {
                state.unindex(&job);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| state.paused = true);
        Ok(())
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| state.paused = false);
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).map(|state| state.paused).unwrap_or(false))
    }

    async fn clean(
        &self,
        queue: &str,
        state_to_clean: TerminalState,
        cutoff: Option<DateTime<Utc>>,
    ) -> QueueResult<usize> {
        Ok(self.with_queue(queue, |state| {
            let index = match state_to_clean {
                TerminalState::Completed => &mut state.completed,
                TerminalState::Failed => &mut state.failed,
            };

            let victims: Vec<_> = index
                .iter()
                .filter(|((finished, _), _)| cutoff.map_or(true, |cutoff| *finished < cutoff))
                .map(|(key, id)| (*key, id.clone()))
                .collect();

            for (key, _) in &victims {
                index.remove(key);
            }
            for (_, job_id) in &victims {
                state.jobs.remove(job_id);
            }
            victims.len()
        }))
    }

    async fn counts(&self, queue: &str) -> QueueResult<QueueStats> {
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .map(|state| QueueStats {
                waiting: state.wait.len() as u64,
                active: state.active.len() as u64,
                completed: state.completed.len() as u64,
                failed: state.failed.len() as u64,
                delayed: state.delayed.len() as u64,
                paused: state.paused,
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backoff;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn job(priority: u32) -> NewJob {
        NewJob {
            payload: json!({ "n": priority }),
            priority,
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(10)),
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_per_queue() {
        let backend = MemoryBackend::new();
        let a = backend.enqueue("email", job(0)).await.unwrap();
        let b = backend.enqueue("email", job(0)).await.unwrap();
        let other = backend.enqueue("notification", job(0)).await.unwrap();

        assert_eq!(a.id.as_str(), "1");
        assert_eq!(b.id.as_str(), "2");
        assert_eq!(other.id.as_str(), "1");
    }

    #[tokio::test]
    async fn test_claim_sets_dispatch_bookkeeping() {
        let backend = MemoryBackend::new();
        let record = backend.enqueue("email", job(0)).await.unwrap();

        let leased = backend.claim("email", LEASE).await.unwrap().unwrap();
        assert_eq!(leased.record.id, record.id);
        assert_eq!(leased.record.state, JobState::Active);
        assert_eq!(leased.record.attempts_made, 1);
        assert!(leased.record.processed_on.is_some());
        assert!(leased.lease_until > Utc::now());

        // Nothing else to hand out
        assert!(backend.claim("email", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_at_in_the_past_goes_straight_to_waiting() {
        let backend = MemoryBackend::new();
        backend.enqueue("email", job(0)).await.unwrap();
        let leased = backend.claim("email", LEASE).await.unwrap().unwrap();

        let record = backend
            .fail("email", &leased.record.id, &leased.lease_token, "boom", Some(Utc::now()), None)
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert!(record.failed_reason.is_none());
    }

    #[tokio::test]
    async fn test_release_returns_job_without_counting_a_stall() {
        let backend = MemoryBackend::new();
        backend.enqueue("email", job(0)).await.unwrap();
        let leased = backend.claim("email", LEASE).await.unwrap().unwrap();

        assert!(backend.release("email", &leased.record.id, &leased.lease_token).await.unwrap());
        // A second release is a no-op
        assert!(!backend.release("email", &leased.record.id, &leased.lease_token).await.unwrap());

        let record = backend.get("email", &leased.record.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.stalled_count, 0);
    }

    #[tokio::test]
    async fn test_remove_unindexes_every_state() {
        let backend = MemoryBackend::new();
        let waiting = backend.enqueue("email", job(0)).await.unwrap();
        let delayed = backend
            .enqueue("email", NewJob { delay: Duration::from_secs(60), ..job(0) })
            .await
            .unwrap();

        assert!(backend.remove("email", &waiting.id).await.unwrap());
        assert!(backend.remove("email", &delayed.id).await.unwrap());
        assert!(!backend.remove("email", &waiting.id).await.unwrap());

        let stats = backend.counts("email").await.unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn test_counts_of_unknown_queue_are_zero() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.counts("nope").await.unwrap(), QueueStats::default());
        assert!(!backend.is_paused("nope").await.unwrap());
    }
}
