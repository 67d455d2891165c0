use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, TerminalState};

/// Queue lifecycle events published to in-process subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job is eligible for dispatch
    Waiting {
        queue: String,
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job is held until `until`
    Delayed {
        queue: String,
        job_id: JobId,
        until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job was claimed by a slot
    Active {
        queue: String,
        job_id: JobId,
        attempt: u32,
        at: DateTime<Utc>,
    },

    Progress {
        queue: String,
        job_id: JobId,
        progress: u8,
        at: DateTime<Utc>,
    },

    /// Job failed and will be retried at `retry_at`
    Retrying {
        queue: String,
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    Completed {
        queue: String,
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job failed permanently
    Failed {
        queue: String,
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job lost its lease and was recovered by the reaper
    Stalled {
        queue: String,
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Removed {
        queue: String,
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Paused {
        queue: String,
        at: DateTime<Utc>,
    },

    Resumed {
        queue: String,
        at: DateTime<Utc>,
    },

    Cleaned {
        queue: String,
        state: TerminalState,
        count: usize,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Active { .. } => "active",
            Self::Progress { .. } => "progress",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
            Self::Removed { .. } => "removed",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Cleaned { .. } => "cleaned",
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Waiting { queue, .. }
            | Self::Delayed { queue, .. }
            | Self::Active { queue, .. }
            | Self::Progress { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Stalled { queue, .. }
            | Self::Removed { queue, .. }
            | Self::Paused { queue, .. }
            | Self::Resumed { queue, .. }
            | Self::Cleaned { queue, .. } => queue,
        }
    }

    /// Job the event is about; queue-level events carry none
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Waiting { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. }
            | Self::Removed { job_id, .. } => Some(job_id),
            Self::Paused { .. } | Self::Resumed { .. } | Self::Cleaned { .. } => None,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Waiting { at, .. }
            | Self::Delayed { at, .. }
            | Self::Active { at, .. }
            | Self::Progress { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Stalled { at, .. }
            | Self::Removed { at, .. }
            | Self::Paused { at, .. }
            | Self::Resumed { at, .. }
            | Self::Cleaned { at, .. } => at,
        }
    }
}

/// Store connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected,
    Error(String),
    Disconnected,
}
