//! Results and metrics sink port trait.

use chrono::{DateTime, Utc};

use crate::domain::status::AlgorithmStatus;
use crate::domain::symbol::Symbol;
use crate::domain::time_slice::SecurityChanges;
use crate::ports::alpha_port::AlphaRuntimeStatistics;

pub trait ResultPort: Send + Sync {
    fn sample(&self, time: DateTime<Utc>, force: bool);

    fn process_synchronous_events(&self, force: bool);

    fn set_alpha_runtime_statistics(&self, statistics: &AlphaRuntimeStatistics);

    fn send_status_update(&self, status: AlgorithmStatus, message: Option<&str>);

    fn on_securities_changed(&self, changes: &SecurityChanges);

    fn set_market_price(&self, symbol: &Symbol, price: f64);

    fn debug_message(&self, message: &str);

    fn error_message(&self, message: &str);
}
