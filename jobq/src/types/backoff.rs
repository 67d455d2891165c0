use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the retry delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,
    /// `delay * 2^(attempts_made - 1)`
    Exponential,
}

/// Retry delay policy applied after a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: super::millis(delay),
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: super::millis(delay),
        }
    }

    /// Delay before the next attempt, given how many attempts have been made
    /// so far (including the one that just failed).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }
}
