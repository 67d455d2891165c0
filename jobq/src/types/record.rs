use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{Backoff, JobId, LeaseToken, NewJob};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for the next claim
    Waiting,
    /// Held until its ready time (initial delay or retry backoff)
    Delayed,
    /// Claimed by a slot holding a lease
    Active,
    Completed,
    Failed,
    /// Waiting in a paused queue; derived, never stored
    Paused,
}

impl JobState {
    /// Check if the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// The two states `clean` can purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    #[default]
    Completed,
    Failed,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Status must be 'completed' or 'failed', got '{}'", s)),
        }
    }
}

impl From<TerminalState> for JobState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Completed => JobState::Completed,
            TerminalState::Failed => JobState::Failed,
        }
    }
}

/// Immutable snapshot of a job as last written to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub priority: u32,
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub state: JobState,
    /// 0..=100, only ever raised by the lease holder. Every claim starts
    /// it again at 0.
    pub progress: u8,
    /// Incremented on every claim
    pub attempts_made: u32,
    /// Times the job was recovered from an expired lease
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes eligible
    pub ready_at: Option<DateTime<Utc>>,
    /// First dispatch
    pub processed_on: Option<DateTime<Utc>>,
    /// Terminal transition
    pub finished_on: Option<DateTime<Utc>>,
    /// Present only once the job has failed for good
    pub failed_reason: Option<String>,
    pub return_value: Option<Value>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, queue: &str, job: NewJob, now: DateTime<Utc>) -> Self {
        let delayed = !job.delay.is_zero();
        let ready_at = delayed.then(|| super::saturating_offset(now, job.delay));

        Self {
            id,
            queue: queue.to_string(),
            payload: job.payload,
            priority: job.priority,
            delay_ms: super::millis(job.delay),
            max_attempts: job.max_attempts,
            backoff: job.backoff,
            state: if delayed { JobState::Delayed } else { JobState::Waiting },
            progress: 0,
            attempts_made: 0,
            stalled_count: 0,
            created_at: now,
            ready_at,
            processed_on: None,
            finished_on: None,
            failed_reason: None,
            return_value: None,
        }
    }

    /// Check if the job is completed or failed
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another failure would still be retried
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// A job claimed by a slot together with its lease
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub record: JobRecord,
    pub lease_token: LeaseToken,
    pub lease_until: DateTime<Utc>,
}
