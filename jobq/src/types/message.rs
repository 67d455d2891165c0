use serde_json::Value;
use std::time::Duration;

use super::Backoff;

/// Largest accepted priority value; keeps `priority * 2^32 + seq` exact in a
/// double-precision sorted-set score.
pub const MAX_PRIORITY: u32 = 2_097_152;

/// Per-job options supplied by the producer. Unset fields fall back to the
/// queue's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Lower values dispatch first
    pub priority: u32,
    /// Earliest dispatch is `now + delay`
    pub delay: Duration,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the job in `delayed` for this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the maximum number of attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// Fully resolved submission handed to a backend
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub payload: Value,
    pub priority: u32,
    pub delay: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}
