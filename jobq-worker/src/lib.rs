//! Worker bootstrap: registers the processors this deployment runs.

pub mod processors;

use std::sync::Arc;
use anyhow::Result;
use jobq::{ProcessorOptions, QueueResult, QueueService};
use tracing::{error, info};

pub use processors::{
    EmailJob, EmailProcessor, Mailer, NotificationJob, NotificationProcessor, NotificationSink,
    StoredNotification, TracingMailer, TracingNotificationSink,
};

/// Connect the service and start every worker pool
pub async fn initialize_workers(service: &QueueService) -> Result<()> {
    info!("Initializing queue workers...");

    if let Err(e) = service.initialize().await {
        error!("Failed to initialize queue workers: {}", e);
        return Err(e.into());
    }

    register_processors(
        service,
        Arc::new(TracingMailer),
        Arc::new(TracingNotificationSink::default()),
    )?;

    info!("Queue workers initialized successfully");
    Ok(())
}

/// Register the `email` and `notification` processors on an initialized service
pub fn register_processors<M, N>(service: &QueueService, mailer: Arc<M>, sink: Arc<N>) -> QueueResult<()>
where
    M: Mailer,
    N: NotificationSink,
{
    service.register_processor(
        "email",
        EmailProcessor::new(mailer),
        ProcessorOptions::with_concurrency(5),
    )?;
    service.register_processor(
        "notification",
        NotificationProcessor::new(sink),
        ProcessorOptions::with_concurrency(10),
    )?;
    Ok(())
}

/// Drain the worker pools and close the store connection
pub async fn shutdown_workers(service: &QueueService) {
    info!("Shutting down queue workers...");
    service.shutdown().await;
    info!("Queue workers shutdown complete");
}
