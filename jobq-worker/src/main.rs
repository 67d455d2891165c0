use anyhow::Result;
use jobq::{QueueService, QueueSettings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    jobq::init_tracing();

    let service = QueueService::new(QueueSettings::from_env()?);
    jobq_worker::initialize_workers(&service).await?;

    tokio::signal::ctrl_c().await?;

    jobq_worker::shutdown_workers(&service).await;
    info!("Worker process exiting");
    Ok(())
}
