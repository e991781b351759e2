//! Scheduled-event port trait.

use chrono::{DateTime, Utc};

use crate::domain::time_slice::SecurityChanges;

pub trait RealTimePort: Send + Sync {
    /// Advances the scheduler to `time`, firing every event now due.
    fn set_time(&self, time: DateTime<Utc>) -> anyhow::Result<()>;

    /// Fires events skipped while no data advanced the clock.
    fn scan_past_events(&self, time: DateTime<Utc>) -> anyhow::Result<()>;

    fn on_securities_changed(&self, changes: &SecurityChanges);
}
