//! # jobq: Redis-backed background job queue
//!
//! Named queues with durable jobs, priorities, delays, retries with backoff,
//! progress reporting and stalled-job recovery. State lives in Redis, so any
//! number of processes sharing a store form one queue.
//!
//! - **Leases**: a claimed job carries a lease token; a worker that lost its
//!   lease can no longer write to the job
//! - **At-least-once**: jobs whose worker died are recovered by the reaper
//!   and delivered again, up to a stall limit
//! - **Pluggable store**: `RedisBackend` for production, `MemoryBackend` for
//!   tests, both behind [`QueueBackend`]
//!
//! ## Quick start
//!
//! ```no_run
//! use jobq::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let service = QueueService::new(QueueSettings::from_env()?);
//!     service.initialize().await?;
//!
//!     service.register_processor(
//!         "email",
//!         |payload: serde_json::Value, job: JobContext| async move {
//!             job.progress(50).await?;
//!             Ok::<_, JobError>(json!({ "sent_to": payload["to"] }))
//!         },
//!         ProcessorOptions::with_concurrency(5),
//!     )?;
//!
//!     let id = service
//!         .add_job("email", json!({ "to": "a@example.com" }), JobOptions::new())
//!         .await?;
//!     println!("queued job {}", id);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;
pub mod backend;
pub mod connection;
pub mod registry;
pub mod worker;
pub mod service;
pub mod observability;

pub use config::{QueueSettings, RedisSettings};
pub use error::{JobError, QueueError, QueueResult};
pub use types::{
    Backoff, BackoffKind, ConnectionEvent, JobEvent, JobId, JobOptions, JobRecord, JobState,
    LeasedJob, NewJob, QueueStats, StalledSweep, TerminalState, MAX_PRIORITY,
};
pub use backend::QueueBackend;
pub use backend::memory::MemoryBackend;
pub use connection::Connection;
pub use registry::{QueueHandle, QueueOptions};
pub use worker::{JobContext, Processor};
pub use service::{ProcessorOptions, QueueService};

// Observability exports
pub use observability::{LiveMetrics, ObservabilityLayer};

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything a producer or worker usually needs
pub mod prelude {
    pub use crate::{
        Backoff, JobContext, JobError, JobId, JobOptions, JobRecord, JobState, ProcessorOptions,
        Processor, QueueError, QueueOptions, QueueResult, QueueService, QueueSettings,
        QueueStats, TerminalState,
    };

    pub use async_trait::async_trait;
}
