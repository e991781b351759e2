//! Historical data access port trait.

use chrono_tz::Tz;

use crate::domain::error::EngineError;
use crate::domain::history::{HistoryRequest, HistorySlice};

/// History yielded in time order. Owns everything it reads from.
pub type HistoryIter = Box<dyn Iterator<Item = HistorySlice> + Send>;

pub trait HistoryPort: Send + Sync {
    /// Every call starts a fresh forward pass over the requested range.
    fn get_history(
        &self,
        requests: &[HistoryRequest],
        time_zone: Tz,
    ) -> Result<HistoryIter, EngineError>;
}
