use serde::{Deserialize, Serialize};

use super::JobId;

/// Per-state job counts of one queue plus its paused flag.
///
/// Backends read every count from the same instant of the store, but the
/// queue keeps moving once the snapshot is taken: treat it as best-effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

impl QueueStats {
    /// Every job currently held by the queue
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Outcome of one stalled-job sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledSweep {
    /// Jobs put back into `waiting`
    pub requeued: Vec<JobId>,
    /// Jobs that stalled too often and were failed
    pub failed: Vec<JobId>,
}

impl StalledSweep {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}
