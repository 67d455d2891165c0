//! Backend conformance against the in-memory store.

mod common;

use jobq::MemoryBackend;

macro_rules! conformance {
    ($($name:ident),* $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                let backend = MemoryBackend::new();
                common::$name(&backend, "email").await;
            }
        )*
    };
}

conformance!(
    ids_are_ordered,
    claim_follows_priority_then_fifo,
    claim_leases_the_job,
    delayed_job_waits,
    owner_writes_need_the_lease,
    progress_is_monotonic,
    failure_paths,
    pause_blocks_claims,
    retention_trims_oldest,
    clean_removes_finished,
    remove_any_state,
    expired_leases_are_recovered,
    extended_lease_survives_sweep,
    release_returns_job,
);

/// Queues sharing a store do not see each other's jobs
#[tokio::test]
async fn test_queues_are_isolated() {
    use jobq::QueueBackend;
    use serde_json::json;

    let backend = MemoryBackend::new();
    backend.enqueue("email", common::job(json!({}))).await.unwrap();

    assert!(backend.claim("notification", common::LEASE).await.unwrap().is_none());
    assert_eq!(backend.counts("notification").await.unwrap().total(), 0);
    assert_eq!(backend.counts("email").await.unwrap().waiting, 1);
}

/// Clones of one backend share state like processes sharing one store
#[tokio::test]
async fn test_clones_share_state() {
    use jobq::QueueBackend;
    use serde_json::json;

    let producer = MemoryBackend::new();
    let worker = producer.clone();

    let record = producer.enqueue("email", common::job(json!({}))).await.unwrap();
    let leased = worker.claim("email", common::LEASE).await.unwrap().unwrap();
    assert_eq!(leased.record.id, record.id);
    assert!(producer.claim("email", common::LEASE).await.unwrap().is_none());
}
