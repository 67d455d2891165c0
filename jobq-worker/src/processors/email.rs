use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use jobq::{JobContext, JobError, Processor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

/// Payload of an `email` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

impl EmailJob {
    fn is_complete(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.to) && present(&self.subject) && (present(&self.text) || present(&self.html))
    }
}

/// Outbound mail transport
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    /// Send the message and return the transport's message id
    async fn send(&self, email: &EmailJob) -> Result<String>;
}

/// Logs messages instead of delivering them
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, email: &EmailJob) -> Result<String> {
        let to = email.to.as_deref().unwrap_or_default();
        info!(
            to,
            subject = email.subject.as_deref().unwrap_or_default(),
            attachments = email.attachments.len(),
            "Email sent"
        );
        Ok(format!("{}.{}@jobq-worker", Utc::now().timestamp_millis(), to))
    }
}

pub struct EmailProcessor<M> {
    mailer: Arc<M>,
}

impl<M: Mailer> EmailProcessor<M> {
    pub fn new(mailer: Arc<M>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl<M: Mailer> Processor for EmailProcessor<M> {
    async fn process(&self, payload: Value, job: JobContext) -> Result<Value, JobError> {
        let email: EmailJob = serde_json::from_value(payload)?;
        let to = email.to.clone().unwrap_or_default();

        info!("Processing email job {} for recipient: {}", job.id(), to);
        job.progress(25).await?;

        if !email.is_complete() {
            error!("Email job {} failed: missing required fields", job.id());
            return Err(JobError::permanent(
                "Missing required email fields: to, subject, and text/html",
            ));
        }

        job.progress(50).await?;

        let message_id = self.mailer.send(&email).await.map_err(|e| {
            error!("Email job {} failed: {}", job.id(), e);
            JobError::retryable(e.to_string())
        })?;

        job.progress(100).await?;

        info!("Email job {} completed successfully", job.id());
        Ok(json!({
            "success": true,
            "messageId": message_id,
            "recipient": to,
            "sentAt": Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::{service, settled};
    use jobq::{JobOptions, JobState, ProcessorOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` sends
    struct FlakyMailer {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, _email: &EmailJob) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("connection reset by smtp relay");
            }
            Ok("msg-1".to_string())
        }
    }

    #[tokio::test]
    async fn test_email_is_sent() {
        let service = service();
        service
            .register_processor("email", EmailProcessor::new(Arc::new(TracingMailer)), ProcessorOptions::default())
            .unwrap();

        let id = service
            .add_job(
                "email",
                json!({ "to": "a@example.com", "subject": "Welcome", "text": "Hello" }),
                JobOptions::new(),
            )
            .await
            .unwrap();

        let record = settled(&service, "email", &id).await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.progress, 100);
        let result = record.return_value.unwrap();
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["recipient"], json!("a@example.com"));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_incomplete_email_fails_without_retry() {
        let service = service();
        service
            .register_processor("email", EmailProcessor::new(Arc::new(TracingMailer)), ProcessorOptions::default())
            .unwrap();

        let id = service
            .add_job("email", json!({ "to": "a@example.com", "subject": "No body" }), JobOptions::new())
            .await
            .unwrap();

        let record = settled(&service, "email", &id).await;
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts_made, 1);
        assert_eq!(record.progress, 25);
        assert_eq!(
            record.failed_reason.as_deref(),
            Some("Missing required email fields: to, subject, and text/html")
        );

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_failure_is_retried() {
        let service = service();
        let mailer = Arc::new(FlakyMailer {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        service
            .register_processor("email", EmailProcessor::new(mailer.clone()), ProcessorOptions::default())
            .unwrap();

        let id = service
            .add_job(
                "email",
                json!({ "to": "a@example.com", "subject": "Retry", "html": "<p>hi</p>" }),
                JobOptions::new(),
            )
            .await
            .unwrap();

        let record = settled(&service, "email", &id).await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts_made, 2);
        assert_eq!(record.progress, 100);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 2);

        service.shutdown().await;
    }
}
