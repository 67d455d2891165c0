//! The queue service: one store connection, many named queues.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    ConnectionEvent, JobEvent, JobId, JobOptions, JobRecord, JobState, NewJob, QueueError,
    QueueResult, QueueStats, TerminalState, MAX_PRIORITY,
    backend::QueueBackend,
    config::QueueSettings,
    connection::Connection,
    observability::{BoxStream, LiveMetrics, ObservabilityLayer},
    registry::{validate_queue_name, QueueHandle, QueueOptions, QueueRegistry},
    types,
    worker::{Dispatcher, Processor, WorkerPool},
};

/// How a registered processor runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Parallel slots; `None` uses the configured default
    pub concurrency: Option<usize>,
}

impl ProcessorOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
        }
    }
}

/// Entry point for producers and workers.
///
/// Build one per process and share it (it is `Send + Sync`; wrap it in an
/// `Arc`). Every operation fails with `Uninitialized` until `initialize`
/// succeeds and again after `shutdown`.
pub struct QueueService {
    settings: QueueSettings,
    connection: RwLock<Option<Arc<Connection>>>,
    connection_events: broadcast::Sender<ConnectionEvent>,
    registry: QueueRegistry,
    observability: ObservabilityLayer,
}

impl QueueService {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            connection: RwLock::new(None),
            connection_events: broadcast::channel(64).0,
            registry: QueueRegistry::new(),
            observability: ObservabilityLayer::new(),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Connect to Redis. Calling it again while connected does nothing.
    #[cfg(feature = "redis")]
    pub async fn initialize(&self) -> QueueResult<()> {
        if self.is_initialized() {
            debug!("Queue service already initialized");
            return Ok(());
        }

        self.settings.validate()?;
        let connection =
            Connection::connect_with_events(&self.settings.redis, self.connection_events.clone()).await?;
        self.install(connection);
        Ok(())
    }

    /// Initialize on an existing connection, e.g. one wrapping a `MemoryBackend`
    pub fn initialize_with(&self, connection: Connection) -> QueueResult<()> {
        if self.is_initialized() {
            debug!("Queue service already initialized");
            return Ok(());
        }

        self.settings.validate()?;
        self.install(connection.with_events(self.connection_events.clone()));
        Ok(())
    }

    fn install(&self, connection: Connection) {
        let mut slot = self.connection.write();
        if slot.is_none() {
            *slot = Some(Arc::new(connection));
            info!("Queue service initialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.connection.read().is_some()
    }

    fn connection(&self) -> QueueResult<Arc<Connection>> {
        self.connection.read().clone().ok_or(QueueError::Uninitialized)
    }

    fn backend(&self) -> QueueResult<Arc<dyn QueueBackend>> {
        Ok(self.connection()?.backend())
    }

    /// Return the named queue, creating it on first use. Options only apply
    /// when the queue is created; later calls get the existing queue as is.
    pub fn get_or_create_queue(
        &self,
        name: &str,
        options: Option<QueueOptions>,
    ) -> QueueResult<Arc<QueueHandle>> {
        self.connection()?;
        validate_queue_name(name)?;

        self.registry.get_or_create(name, || {
            debug!(queue = name, "Creating queue");
            options.unwrap_or_else(|| QueueOptions::from_settings(&self.settings))
        })
    }

    /// Start `concurrency` slots running `processor` for the queue.
    /// A queue takes one processor; registering another is an error.
    pub fn register_processor<P>(
        &self,
        name: &str,
        processor: P,
        options: ProcessorOptions,
    ) -> QueueResult<()>
    where
        P: Processor,
    {
        let backend = self.backend()?;
        let handle = self.get_or_create_queue(name, None)?;

        let concurrency = options.concurrency.unwrap_or(self.settings.concurrency);
        if concurrency == 0 {
            return Err(QueueError::Validation("concurrency must be at least 1".to_string()));
        }

        handle.attach_pool(|| {
            let dispatcher = Dispatcher::new(
                name,
                backend,
                Arc::new(processor),
                self.observability.clone(),
                handle.options().clone(),
                handle.wake_handle(),
            );
            WorkerPool::spawn(dispatcher, concurrency)
        })?;

        info!(queue = name, concurrency, "Processor registered");
        Ok(())
    }

    /// Enqueue a job and return its id
    #[instrument(skip_all, fields(queue = name))]
    pub async fn add_job(&self, name: &str, payload: Value, options: JobOptions) -> QueueResult<JobId> {
        let backend = self.backend()?;
        let handle = self.get_or_create_queue(name, None)?;
        let job = resolve(&handle, payload, options)?;

        let record = match backend.enqueue(name, job).await {
            Ok(record) => record,
            Err(e) => {
                error!("Failed to add job: {}", e);
                return Err(e);
            }
        };

        let now = Utc::now();
        match (record.state, record.ready_at) {
            (JobState::Delayed, Some(until)) => self.observability.emit(JobEvent::Delayed {
                queue: name.to_string(),
                job_id: record.id.clone(),
                until,
                at: now,
            }),
            _ => {
                self.observability.emit(JobEvent::Waiting {
                    queue: name.to_string(),
                    job_id: record.id.clone(),
                    at: now,
                });
                handle.wake();
            }
        }

        Ok(record.id)
    }

    /// Enqueue a job that becomes eligible after `delay`
    pub async fn add_delayed_job(
        &self,
        name: &str,
        payload: Value,
        delay: Duration,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        self.add_job(name, payload, options.with_delay(delay)).await
    }

    pub async fn get_job(&self, name: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;
        backend.get(name, job_id).await
    }

    /// Current state of a job; a waiting job of a paused queue reports `Paused`
    pub async fn get_job_state(&self, name: &str, job_id: &JobId) -> QueueResult<Option<JobState>> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;

        let Some(record) = backend.get(name, job_id).await? else {
            return Ok(None);
        };
        if record.state == JobState::Waiting && backend.is_paused(name).await? {
            return Ok(Some(JobState::Paused));
        }
        Ok(Some(record.state))
    }

    /// Delete a job in any state. Removing an active job does not interrupt
    /// its processor; the outcome is dropped when it settles.
    #[instrument(skip_all, fields(queue = name, job_id = %job_id))]
    pub async fn remove_job(&self, name: &str, job_id: &JobId) -> QueueResult<bool> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;

        let was_active = matches!(
            backend.get(name, job_id).await?,
            Some(JobRecord { state: JobState::Active, .. })
        );

        let removed = backend.remove(name, job_id).await?;
        if removed {
            if was_active {
                warn!("Removed an active job; its processor keeps running");
            }
            self.observability.emit(JobEvent::Removed {
                queue: name.to_string(),
                job_id: job_id.clone(),
                at: Utc::now(),
            });
        }
        Ok(removed)
    }

    pub async fn get_queue_stats(&self, name: &str) -> QueueResult<QueueStats> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;
        backend.counts(name).await
    }

    /// Stop dispatch for the queue across every process sharing the store.
    /// Running jobs finish; producers can still enqueue.
    pub async fn pause_queue(&self, name: &str) -> QueueResult<()> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;

        backend.pause(name).await?;
        self.observability.emit(JobEvent::Paused {
            queue: name.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    pub async fn resume_queue(&self, name: &str) -> QueueResult<()> {
        let backend = self.backend()?;
        let handle = self.get_or_create_queue(name, None)?;

        backend.resume(name).await?;
        self.observability.emit(JobEvent::Resumed {
            queue: name.to_string(),
            at: Utc::now(),
        });
        handle.wake();
        Ok(())
    }

    /// Delete jobs in `status` that finished more than `grace_period_ms` ago.
    /// A grace period of zero or less deletes all of them.
    #[instrument(skip_all, fields(queue = name, status = %status))]
    pub async fn clean_queue(
        &self,
        name: &str,
        grace_period_ms: i64,
        status: TerminalState,
    ) -> QueueResult<usize> {
        let backend = self.backend()?;
        self.get_or_create_queue(name, None)?;

        let cutoff = (grace_period_ms > 0).then(|| {
            Utc::now()
                .checked_sub_signed(chrono::Duration::milliseconds(grace_period_ms))
                .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
        });

        let count = backend.clean(name, status, cutoff).await?;
        info!("Cleaned {} {} jobs", count, status);
        self.observability.emit(JobEvent::Cleaned {
            queue: name.to_string(),
            state: status,
            count,
            at: Utc::now(),
        });
        Ok(count)
    }

    /// Subscribe to job events of every queue
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.observability.subscribe()
    }

    pub fn event_stream(&self) -> BoxStream<JobEvent> {
        self.observability.event_stream()
    }

    /// Subscribe to store connection events. Subscribing before
    /// `initialize` also sees the first `Connected`.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_events.subscribe()
    }

    pub fn metrics(&self) -> &LiveMetrics {
        self.observability.metrics()
    }

    /// Names of the queues created so far
    pub fn queue_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Stop every worker pool, then close the connection.
    ///
    /// Each pool gets `shutdown_timeout` to finish its running jobs; jobs
    /// still running after that are handed back to `waiting`. Calling it
    /// again does nothing.
    pub async fn shutdown(&self) {
        let Some(connection) = self.connection.write().take() else {
            debug!("Queue service is not running");
            return;
        };

        info!("Shutting down queue service");
        let timeout = self.settings.shutdown_timeout;
        let handles = self.registry.drain();

        let stops = handles.iter().filter_map(|handle| {
            let pool = handle.take_pool()?;
            let queue = handle.name().to_string();
            Some(async move {
                let released = pool.shutdown(timeout).await;
                if released > 0 {
                    warn!(queue = %queue, released, "Queue closed with unfinished jobs");
                } else {
                    info!(queue = %queue, "Queue closed");
                }
            })
        });
        futures::future::join_all(stops).await;

        if let Err(e) = connection.close().await {
            error!("Error closing store connection: {}", e);
        }
        info!("Queue service shut down");
    }
}

/// Validate producer input and fill in the queue's defaults
fn resolve(handle: &QueueHandle, payload: Value, options: JobOptions) -> QueueResult<NewJob> {
    handle.validate_payload(&payload)?;

    if options.priority > MAX_PRIORITY {
        return Err(QueueError::Validation(format!(
            "priority {} exceeds the maximum of {}",
            options.priority, MAX_PRIORITY
        )));
    }

    if types::checked_offset(Utc::now(), options.delay).is_none() {
        return Err(QueueError::Validation(format!(
            "delay of {}ms is out of range",
            options.delay.as_millis()
        )));
    }

    let max_attempts = options.attempts.unwrap_or(handle.options().attempts);
    if max_attempts == 0 {
        return Err(QueueError::Validation("attempts must be at least 1".to_string()));
    }

    Ok(NewJob {
        payload,
        priority: options.priority,
        delay: options.delay,
        max_attempts,
        backoff: options.backoff.unwrap_or(handle.options().backoff),
    })
}
