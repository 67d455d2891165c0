use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

use super::JobContext;
use crate::JobError;

/// Business logic bound to a queue.
///
/// Receives the job payload and an owner-scoped [`JobContext`]; the returned
/// value is stored as the job's result. Delivery is at-least-once, so a
/// processor must tolerate seeing the same job again after a stall.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, payload: Value, job: JobContext) -> Result<Value, JobError>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn process(&self, payload: Value, job: JobContext) -> Result<Value, JobError> {
        (self)(payload, job).await
    }
}
