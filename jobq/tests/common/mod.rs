//! Backend conformance checks shared by the memory and Redis suites.
//!
//! Every check takes the queue name to use so suites running against a
//! shared store can isolate themselves.

#![allow(dead_code)]

use std::time::Duration;
use serde_json::{json, Value};

use jobq::{
    Backoff, JobId, JobState, NewJob, QueueBackend, QueueError, TerminalState,
    types::LeaseToken,
};

pub const LEASE: Duration = Duration::from_secs(30);

pub fn job(payload: Value) -> NewJob {
    NewJob {
        payload,
        priority: 0,
        delay: Duration::ZERO,
        max_attempts: 3,
        backoff: Backoff::fixed(Duration::ZERO),
    }
}

pub fn job_with_priority(priority: u32) -> NewJob {
    NewJob {
        priority,
        ..job(json!({ "priority": priority }))
    }
}

/// B1. Ids are assigned in enqueue order and jobs start out waiting
pub async fn ids_are_ordered(backend: &dyn QueueBackend, queue: &str) {
    let first = backend.enqueue(queue, job(json!({ "n": 1 }))).await.unwrap();
    let second = backend.enqueue(queue, job(json!({ "n": 2 }))).await.unwrap();

    let a: u64 = first.id.as_str().parse().unwrap();
    let b: u64 = second.id.as_str().parse().unwrap();
    assert!(b > a);
    assert_eq!(first.state, JobState::Waiting);
    assert_eq!(first.attempts_made, 0);
    assert_eq!(first.progress, 0);

    let stored = backend.get(queue, &first.id).await.unwrap().unwrap();
    assert_eq!(stored.payload, json!({ "n": 1 }));
}

/// B2. Lower priority value first, then enqueue order
pub async fn claim_follows_priority_then_fifo(backend: &dyn QueueBackend, queue: &str) {
    let low = backend.enqueue(queue, job_with_priority(10)).await.unwrap();
    let high_a = backend.enqueue(queue, job_with_priority(1)).await.unwrap();
    let high_b = backend.enqueue(queue, job_with_priority(1)).await.unwrap();
    let none = backend.enqueue(queue, job_with_priority(0)).await.unwrap();

    let mut order = Vec::new();
    while let Some(leased) = backend.claim(queue, LEASE).await.unwrap() {
        order.push(leased.record.id);
    }
    assert_eq!(order, vec![none.id, high_a.id, high_b.id, low.id]);
}

/// B3. Claiming leases the job and records the attempt
pub async fn claim_leases_the_job(backend: &dyn QueueBackend, queue: &str) {
    let record = backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();

    assert_eq!(leased.record.id, record.id);
    assert_eq!(leased.record.state, JobState::Active);
    assert_eq!(leased.record.attempts_made, 1);
    assert!(leased.record.processed_on.is_some());
    assert!(!leased.lease_token.as_str().is_empty());
    assert!(leased.lease_until > chrono::Utc::now());

    // Nothing else to claim
    assert!(backend.claim(queue, LEASE).await.unwrap().is_none());
    assert_eq!(backend.counts(queue).await.unwrap().active, 1);
}

/// B4. A delayed job is never claimed before it is due
pub async fn delayed_job_waits(backend: &dyn QueueBackend, queue: &str) {
    let delayed = NewJob {
        delay: Duration::from_millis(300),
        ..job(json!({}))
    };
    let record = backend.enqueue(queue, delayed).await.unwrap();
    assert_eq!(record.state, JobState::Delayed);
    assert!(record.ready_at.is_some());
    assert_eq!(backend.counts(queue).await.unwrap().delayed, 1);

    assert!(backend.claim(queue, LEASE).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(leased.record.id, record.id);
    assert!(leased.record.processed_on.unwrap() >= record.ready_at.unwrap());
}

/// B5. Owner writes need the current lease token
pub async fn owner_writes_need_the_lease(backend: &dyn QueueBackend, queue: &str) {
    backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
    let id = leased.record.id.clone();
    let stranger = LeaseToken::new();

    let err = backend
        .complete(queue, &id, &stranger, json!(null), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));

    let err = backend.update_progress(queue, &id, &stranger, 10).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
    assert!(backend.holds_lease(queue, &id, &leased.lease_token).await.unwrap());
    assert!(!backend.holds_lease(queue, &id, &stranger).await.unwrap());

    let missing = JobId::from("424242");
    let err = backend
        .complete(queue, &missing, &leased.lease_token, json!(null), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));

    // The rightful owner still settles it
    let done = backend
        .complete(queue, &id, &leased.lease_token, json!({ "ok": true }), None)
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.return_value, Some(json!({ "ok": true })));
    assert!(done.finished_on.is_some());
    assert!(!backend.holds_lease(queue, &id, &leased.lease_token).await.unwrap());

    // A settled job no longer has an owner
    let err = backend
        .fail(queue, &id, &leased.lease_token, "late", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
}

/// B6. Progress only moves forward within one delivery
pub async fn progress_is_monotonic(backend: &dyn QueueBackend, queue: &str) {
    backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
    let (id, token) = (&leased.record.id, &leased.lease_token);

    assert_eq!(backend.update_progress(queue, id, token, 25).await.unwrap().progress, 25);
    assert_eq!(backend.update_progress(queue, id, token, 50).await.unwrap().progress, 50);
    assert_eq!(backend.update_progress(queue, id, token, 50).await.unwrap().progress, 50);

    let err = backend.update_progress(queue, id, token, 40).await.unwrap_err();
    assert!(matches!(err, QueueError::ProgressRegressed { current: 50, value: 40, .. }));

    assert_eq!(backend.get(queue, id).await.unwrap().unwrap().progress, 50);

    // a redelivery starts from zero again
    assert!(backend.release(queue, id, token).await.unwrap());
    let again = backend.claim(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(again.record.progress, 0);
    assert_eq!(
        backend.update_progress(queue, id, &again.lease_token, 25).await.unwrap().progress,
        25
    );
}

/// B7. A retried failure goes back to delayed, a final one is kept as failed
pub async fn failure_paths(backend: &dyn QueueBackend, queue: &str) {
    backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
    let id = leased.record.id.clone();

    let retry_at = chrono::Utc::now() + chrono::Duration::milliseconds(200);
    let retried = backend
        .fail(queue, &id, &leased.lease_token, "smtp down", Some(retry_at), None)
        .await
        .unwrap();
    assert_eq!(retried.state, JobState::Delayed);
    assert!(retried.failed_reason.is_none());
    assert!(backend.claim(queue, LEASE).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let again = backend.claim(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(again.record.id, id);
    assert_eq!(again.record.attempts_made, 2);

    let failed = backend
        .fail(queue, &id, &again.lease_token, "smtp still down", None, None)
        .await
        .unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failed_reason.as_deref(), Some("smtp still down"));
    assert_eq!(failed.attempts_made, 2);
    assert!(failed.finished_on.is_some());
    assert_eq!(backend.counts(queue).await.unwrap().failed, 1);
}

/// B8. A paused queue hands out nothing but still accepts jobs
pub async fn pause_blocks_claims(backend: &dyn QueueBackend, queue: &str) {
    backend.pause(queue).await.unwrap();
    assert!(backend.is_paused(queue).await.unwrap());

    let record = backend.enqueue(queue, job(json!({}))).await.unwrap();
    assert!(backend.claim(queue, LEASE).await.unwrap().is_none());

    let stats = backend.counts(queue).await.unwrap();
    assert!(stats.paused);
    assert_eq!(stats.waiting, 1);

    backend.resume(queue).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(leased.record.id, record.id);
}

/// B9. Finished history is trimmed to the newest `keep` jobs
pub async fn retention_trims_oldest(backend: &dyn QueueBackend, queue: &str) {
    let mut ids = Vec::new();
    for n in 0..4 {
        backend.enqueue(queue, job(json!({ "n": n }))).await.unwrap();
        let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
        backend
            .complete(queue, &leased.record.id, &leased.lease_token, json!(n), Some(2))
            .await
            .unwrap();
        ids.push(leased.record.id);
        // Distinct finish times
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(backend.counts(queue).await.unwrap().completed, 2);
    assert!(backend.get(queue, &ids[0]).await.unwrap().is_none());
    assert!(backend.get(queue, &ids[1]).await.unwrap().is_none());
    assert!(backend.get(queue, &ids[3]).await.unwrap().is_some());
}

/// B10. Clean removes finished jobs older than the cutoff
pub async fn clean_removes_finished(backend: &dyn QueueBackend, queue: &str) {
    for _ in 0..3 {
        backend.enqueue(queue, job(json!({}))).await.unwrap();
        let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();
        backend
            .complete(queue, &leased.record.id, &leased.lease_token, json!(null), None)
            .await
            .unwrap();
    }
    let waiting = backend.enqueue(queue, job(json!({}))).await.unwrap();

    let past = chrono::Utc::now() - chrono::Duration::hours(1);
    assert_eq!(backend.clean(queue, TerminalState::Completed, Some(past)).await.unwrap(), 0);
    assert_eq!(backend.clean(queue, TerminalState::Failed, None).await.unwrap(), 0);
    assert_eq!(backend.clean(queue, TerminalState::Completed, None).await.unwrap(), 3);
    assert_eq!(backend.clean(queue, TerminalState::Completed, None).await.unwrap(), 0);

    // Non-terminal jobs are untouched
    assert!(backend.get(queue, &waiting.id).await.unwrap().is_some());
}

/// B11. Remove deletes a job from whatever state it is in
pub async fn remove_any_state(backend: &dyn QueueBackend, queue: &str) {
    let waiting = backend.enqueue(queue, job(json!({}))).await.unwrap();
    let delayed = backend
        .enqueue(queue, NewJob { delay: Duration::from_secs(60), ..job(json!({})) })
        .await
        .unwrap();

    assert!(backend.remove(queue, &waiting.id).await.unwrap());
    assert!(backend.remove(queue, &delayed.id).await.unwrap());
    assert!(!backend.remove(queue, &delayed.id).await.unwrap());

    let stats = backend.counts(queue).await.unwrap();
    assert_eq!(stats.total(), 0);
    assert!(backend.claim(queue, LEASE).await.unwrap().is_none());
}

/// B12. An expired lease is recovered once, then the job is failed
pub async fn expired_leases_are_recovered(backend: &dyn QueueBackend, queue: &str) {
    let short = Duration::from_millis(50);
    let record = backend.enqueue(queue, job(json!({}))).await.unwrap();

    let first = backend.claim(queue, short).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let sweep = backend.requeue_stalled(queue, 1, None).await.unwrap();
    assert_eq!(sweep.requeued, vec![record.id.clone()]);
    assert!(sweep.failed.is_empty());

    // The old owner is locked out
    let err = backend
        .complete(queue, &record.id, &first.lease_token, json!(null), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));

    let second = backend.claim(queue, short).await.unwrap().unwrap();
    assert_eq!(second.record.attempts_made, 2);
    assert_eq!(second.record.stalled_count, 1);
    assert!(!backend.holds_lease(queue, &record.id, &first.lease_token).await.unwrap());
    assert!(backend.holds_lease(queue, &record.id, &second.lease_token).await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let sweep = backend.requeue_stalled(queue, 1, None).await.unwrap();
    assert_eq!(sweep.failed, vec![record.id.clone()]);

    let failed = backend.get(queue, &record.id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.failed_reason.as_deref(), Some("job stalled more than allowable limit"));
}

/// B13. Extending a lease keeps the reaper away
pub async fn extended_lease_survives_sweep(backend: &dyn QueueBackend, queue: &str) {
    let short = Duration::from_millis(100);
    backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, short).await.unwrap().unwrap();

    let until = backend
        .extend_lease(queue, &leased.record.id, &leased.lease_token, LEASE)
        .await
        .unwrap();
    assert!(until > leased.lease_until);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(backend.requeue_stalled(queue, 1, None).await.unwrap().is_empty());
    assert_eq!(
        backend.get(queue, &leased.record.id).await.unwrap().unwrap().state,
        JobState::Active
    );
}

/// B14. Released jobs go straight back to waiting
pub async fn release_returns_job(backend: &dyn QueueBackend, queue: &str) {
    backend.enqueue(queue, job(json!({}))).await.unwrap();
    let leased = backend.claim(queue, LEASE).await.unwrap().unwrap();

    assert!(backend.release(queue, &leased.record.id, &leased.lease_token).await.unwrap());
    let record = backend.get(queue, &leased.record.id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.stalled_count, 0);

    let again = backend.claim(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(again.record.id, leased.record.id);
}
