pub mod ids;
pub mod backoff;
pub mod message;
pub mod record;
pub mod stats;
pub mod events;

pub use ids::{JobId, LeaseToken};
pub use backoff::{Backoff, BackoffKind};
pub use message::{JobOptions, NewJob, MAX_PRIORITY};
pub use record::{JobRecord, JobState, LeasedJob, TerminalState};
pub use stats::{QueueStats, StalledSweep};
pub use events::{ConnectionEvent, JobEvent};

use std::time::Duration;
use chrono::{DateTime, TimeDelta, Utc};

/// `at + by`, or `None` past the range a timestamp can hold
pub(crate) fn checked_offset(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(by.as_millis()).ok()?;
    at.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

/// `at + by`, clamped to the latest representable instant
pub(crate) fn saturating_offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    checked_offset(at, by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
