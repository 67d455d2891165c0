//! Named queues known to a service, with their options and worker pools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;

use crate::{
    Backoff, QueueError, QueueResult,
    config::QueueSettings,
    worker::WorkerPool,
};

/// Defaults applied to every job of one queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Attempts for jobs that do not set their own
    pub attempts: u32,
    /// Backoff for jobs that do not set their own
    pub backoff: Backoff,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
    pub lock_duration: Duration,
    pub stalled_interval: Duration,
    pub max_stalled_count: u32,
    pub poll_interval: Duration,
    /// Top-level payload fields that must be present and non-null
    pub required_fields: Vec<String>,
}

impl QueueOptions {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            attempts: settings.max_attempts,
            backoff: Backoff::exponential(settings.backoff_delay),
            keep_completed: settings.keep_completed,
            keep_failed: settings.keep_failed,
            lock_duration: settings.lock_duration,
            stalled_interval: settings.stalled_interval,
            max_stalled_count: settings.max_stalled_count,
            poll_interval: settings.poll_interval,
            required_fields: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn keep_completed(mut self, keep: Option<usize>) -> Self {
        self.keep_completed = keep;
        self
    }

    pub fn keep_failed(mut self, keep: Option<usize>) -> Self {
        self.keep_failed = keep;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject payloads missing any of these top-level fields
    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn validate(&self) -> QueueResult<()> {
        if self.attempts == 0 {
            return Err(QueueError::Validation("attempts must be at least 1".to_string()));
        }
        if self.lock_duration.is_zero() {
            return Err(QueueError::Validation("lock duration must be positive".to_string()));
        }
        if self.stalled_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(QueueError::Validation(
                "stall sweep and poll intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named queue: its options, the signal that wakes idle slots, and the
/// worker pool once a processor is registered.
pub struct QueueHandle {
    name: String,
    options: QueueOptions,
    wake: Arc<Notify>,
    pool: Mutex<Option<WorkerPool>>,
}

impl QueueHandle {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            wake: Arc::new(Notify::new()),
            pool: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn has_processor(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Check a producer payload against the queue's required fields
    pub fn validate_payload(&self, payload: &Value) -> QueueResult<()> {
        let Some(object) = payload.as_object() else {
            return Err(QueueError::Validation(format!(
                "payload for queue '{}' must be a JSON object",
                self.name
            )));
        };

        let missing: Vec<&str> = self
            .options
            .required_fields
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            return Err(QueueError::Validation(format!(
                "payload for queue '{}' is missing required fields: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Wake every idle slot of this queue
    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Install the worker pool built by `spawn` unless one is already running
    pub(crate) fn attach_pool<F>(&self, spawn: F) -> QueueResult<()>
    where
        F: FnOnce() -> WorkerPool,
    {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Err(QueueError::ProcessorAlreadyRegistered(self.name.clone()));
        }
        *pool = Some(spawn());
        Ok(())
    }

    pub(crate) fn take_pool(&self) -> Option<WorkerPool> {
        self.pool.lock().take()
    }
}

/// Name-keyed set of queues; a queue is created on first use and keeps the
/// options it was created with.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<QueueHandle>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue, creating it with `options` if it does not exist
    pub fn get_or_create<F>(&self, name: &str, options: F) -> QueueResult<Arc<QueueHandle>>
    where
        F: FnOnce() -> QueueOptions,
    {
        if let Some(handle) = self.queues.read().get(name) {
            return Ok(handle.clone());
        }

        let mut queues = self.queues.write();
        if let Some(handle) = queues.get(name) {
            return Ok(handle.clone());
        }

        let options = options();
        options.validate()?;
        let handle = Arc::new(QueueHandle::new(name, options));
        queues.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<Arc<QueueHandle>> {
        self.queues.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove and return every queue
    pub(crate) fn drain(&self) -> Vec<Arc<QueueHandle>> {
        self.queues.write().drain().map(|(_, handle)| handle).collect()
    }
}

/// Queue names become part of store keys
pub(crate) fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.trim().is_empty() {
        return Err(QueueError::Validation("queue name must not be empty".to_string()));
    }
    if name.contains(':') || name.contains(char::is_whitespace) {
        return Err(QueueError::Validation(format!(
            "queue name '{}' must not contain ':' or whitespace",
            name
        )));
    }
    Ok(())
}
