use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq::{JobContext, JobError, Processor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

/// Payload of a `notification` job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    /// String or numeric user id
    #[serde(default)]
    pub user_id: Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Value,
}

fn default_kind() -> String {
    "info".to_string()
}

impl NotificationJob {
    fn is_complete(&self) -> bool {
        let user = match &self.user_id {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        };
        let present = |field: &Option<String>| field.as_deref().is_some_and(|s| !s.is_empty());
        user && present(&self.title) && present(&self.message)
    }
}

/// A notification as persisted by the sink
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub id: u64,
    pub created_at: DateTime<Utc>,
}

/// Where notifications are persisted
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn store(&self, notification: &NotificationJob) -> Result<StoredNotification>;
}

/// Logs notifications and hands out sequential ids
#[derive(Default)]
pub struct TracingNotificationSink {
    next_id: AtomicU64,
}

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn store(&self, notification: &NotificationJob) -> Result<StoredNotification> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            id,
            user_id = %notification.user_id,
            kind = %notification.kind,
            "Notification stored"
        );
        Ok(StoredNotification {
            id,
            created_at: Utc::now(),
        })
    }
}

pub struct NotificationProcessor<N> {
    sink: Arc<N>,
}

impl<N: NotificationSink> NotificationProcessor<N> {
    pub fn new(sink: Arc<N>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<N: NotificationSink> Processor for NotificationProcessor<N> {
    async fn process(&self, payload: Value, job: JobContext) -> Result<Value, JobError> {
        let notification: NotificationJob = serde_json::from_value(payload)?;

        info!("Processing notification job {} for user: {}", job.id(), notification.user_id);
        job.progress(25).await?;

        if !notification.is_complete() {
            error!("Notification job {} failed: missing required fields", job.id());
            return Err(JobError::permanent(
                "Missing required notification fields: userId, title, message",
            ));
        }

        job.progress(50).await?;

        let stored = self.sink.store(&notification).await.map_err(|e| {
            error!("Notification job {} failed: {}", job.id(), e);
            JobError::retryable(e.to_string())
        })?;

        job.progress(75).await?;
        job.progress(100).await?;

        info!("Notification job {} completed successfully", job.id());
        Ok(json!({
            "success": true,
            "notificationId": stored.id,
            "userId": notification.user_id,
            "createdAt": stored.created_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::{service, settled};
    use jobq::{JobOptions, JobState, ProcessorOptions};

    #[test]
    fn test_payload_defaults() {
        let job: NotificationJob =
            serde_json::from_value(json!({ "userId": 7, "title": "Hi", "message": "Welcome" })).unwrap();
        assert_eq!(job.kind, "info");
        assert!(job.metadata.is_null());
        assert!(job.is_complete());

        let job: NotificationJob =
            serde_json::from_value(json!({ "userId": "", "title": "Hi", "message": "Welcome" })).unwrap();
        assert!(!job.is_complete());
    }

    #[tokio::test]
    async fn test_notification_is_stored() {
        let service = service();
        service
            .register_processor(
                "notification",
                NotificationProcessor::new(Arc::new(TracingNotificationSink::default())),
                ProcessorOptions::default(),
            )
            .unwrap();

        let id = service
            .add_job(
                "notification",
                json!({ "userId": "u-1", "title": "Order shipped", "message": "On its way", "type": "success" }),
                JobOptions::new(),
            )
            .await
            .unwrap();

        let record = settled(&service, "notification", &id).await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.progress, 100);
        let result = record.return_value.unwrap();
        assert_eq!(result["notificationId"], json!(1));
        assert_eq!(result["userId"], json!("u-1"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_user_fails_without_retry() {
        let service = service();
        service
            .register_processor(
                "notification",
                NotificationProcessor::new(Arc::new(TracingNotificationSink::default())),
                ProcessorOptions::default(),
            )
            .unwrap();

        let id = service
            .add_job("notification", json!({ "title": "Hi", "message": "there" }), JobOptions::new())
            .await
            .unwrap();

        let record = settled(&service, "notification", &id).await;
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts_made, 1);

        service.shutdown().await;
    }
}
