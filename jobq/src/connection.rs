//! The single store connection shared by every queue of a service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{backend::QueueBackend, ConnectionEvent, QueueResult};

#[cfg(feature = "redis")]
use crate::{backend::redis::RedisBackend, config::RedisSettings};

/// Shared handle to the backing store plus its lifecycle events
pub struct Connection {
    backend: Arc<dyn QueueBackend>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: AtomicBool,
}

impl Connection {
    /// Connect to Redis.
    ///
    /// Only malformed settings are an error. An unreachable server is logged
    /// and published as `ConnectionEvent::Error`; the handle is still returned
    /// and operations fail with `Transport` until the server is reachable.
    #[cfg(feature = "redis")]
    pub async fn connect(settings: &RedisSettings) -> QueueResult<Self> {
        let (events, _) = broadcast::channel(64);
        Self::connect_with_events(settings, events).await
    }

    /// Connect, publishing on a channel the caller may already listen to
    #[cfg(feature = "redis")]
    pub async fn connect_with_events(
        settings: &RedisSettings,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> QueueResult<Self> {
        let backend = RedisBackend::new(settings, events.clone())?;

        if let Err(e) = backend.ping().await {
            error!(
                "Redis at {}:{} is not reachable yet: {}",
                settings.host, settings.port, e
            );
        }

        Ok(Self {
            backend: Arc::new(backend),
            events,
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap an already constructed backend, e.g. a shared `MemoryBackend`
    pub fn from_backend(backend: Arc<dyn QueueBackend>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backend,
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish this connection's own events on `events` instead. Events a
    /// Redis backend reports stay on the channel it was connected with.
    pub(crate) fn with_events(mut self, events: broadcast::Sender<ConnectionEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the store connection. Later calls do nothing.
    pub async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.backend.close().await;
        let _ = self.events.send(ConnectionEvent::Disconnected);
        info!("Store connection closed");
        result
    }
}
