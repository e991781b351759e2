//! In-memory results sink: equity samples, status updates and log messages.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::domain::status::AlgorithmStatus;
use crate::domain::symbol::Symbol;
use crate::domain::time_slice::SecurityChanges;
use crate::ports::alpha_port::AlphaRuntimeStatistics;
use crate::ports::portfolio_port::PortfolioPort;
use crate::ports::result_port::ResultPort;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquitySample {
    pub time: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Default)]
struct Recorded {
    samples: Vec<EquitySample>,
    statuses: Vec<(AlgorithmStatus, Option<String>)>,
    debug_messages: Vec<String>,
    error_messages: Vec<String>,
    market_prices: BTreeMap<Symbol, f64>,
    alpha: AlphaRuntimeStatistics,
    securities_changes: usize,
    flushes: usize,
}

/// Records everything the engine reports. Equity samples are taken at most
/// once per `sample_period` unless forced.
pub struct MemoryResultAdapter {
    portfolio: Arc<dyn PortfolioPort>,
    sample_period: Duration,
    recorded: Mutex<Recorded>,
}

impl MemoryResultAdapter {
    pub fn new(portfolio: Arc<dyn PortfolioPort>, sample_period: Duration) -> Self {
        MemoryResultAdapter {
            portfolio,
            sample_period,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn samples(&self) -> Vec<EquitySample> {
        self.recorded.lock().samples.clone()
    }

    pub fn statuses(&self) -> Vec<(AlgorithmStatus, Option<String>)> {
        self.recorded.lock().statuses.clone()
    }

    pub fn debug_messages(&self) -> Vec<String> {
        self.recorded.lock().debug_messages.clone()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.recorded.lock().error_messages.clone()
    }

    pub fn market_price(&self, symbol: &Symbol) -> Option<f64> {
        self.recorded.lock().market_prices.get(symbol).copied()
    }

    pub fn alpha_statistics(&self) -> AlphaRuntimeStatistics {
        self.recorded.lock().alpha
    }

    pub fn securities_changes(&self) -> usize {
        self.recorded.lock().securities_changes
    }

    /// Number of forced flushes.
    pub fn flushes(&self) -> usize {
        self.recorded.lock().flushes
    }
}

impl ResultPort for MemoryResultAdapter {
    fn sample(&self, time: DateTime<Utc>, force: bool) {
        let mut recorded = self.recorded.lock();
        let due = match recorded.samples.last() {
            Some(last) => time - last.time >= self.sample_period,
            None => true,
        };
        if !force && !due {
            return;
        }
        let equity = self.portfolio.total_portfolio_value();
        recorded.samples.push(EquitySample { time, equity });
    }

    fn process_synchronous_events(&self, force: bool) {
        if force {
            self.recorded.lock().flushes += 1;
        }
    }

    fn set_alpha_runtime_statistics(&self, statistics: &AlphaRuntimeStatistics) {
        self.recorded.lock().alpha = *statistics;
    }

    fn send_status_update(&self, status: AlgorithmStatus, message: Option<&str>) {
        match message {
            Some(message) => info!(%status, message, "status update"),
            None => info!(%status, "status update"),
        }
        self.recorded
            .lock()
            .statuses
            .push((status, message.map(str::to_string)));
    }

    fn on_securities_changed(&self, changes: &SecurityChanges) {
        if !changes.is_empty() {
            self.recorded.lock().securities_changes += 1;
        }
    }

    fn set_market_price(&self, symbol: &Symbol, price: f64) {
        self.recorded.lock().market_prices.insert(symbol.clone(), price);
    }

    fn debug_message(&self, message: &str) {
        debug!(message, "algorithm debug");
        self.recorded.lock().debug_messages.push(message.to_string());
    }

    fn error_message(&self, message: &str) {
        error!(message, "algorithm error");
        self.recorded.lock().error_messages.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sim_brokerage::SimulatedBrokerage;
    use chrono::TimeZone;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, 0, 0).unwrap()
    }

    fn results() -> MemoryResultAdapter {
        MemoryResultAdapter::new(Arc::new(SimulatedBrokerage::new(1_000.0)), Duration::hours(2))
    }

    #[test]
    fn samples_respect_period_unless_forced() {
        let results = results();
        results.sample(t(10), false);
        results.sample(t(11), false);
        results.sample(t(12), false);
        results.sample(t(13), true);
        let samples = results.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].time, t(12));
        assert_eq!(samples[2].equity, 1_000.0);
    }

    #[test]
    fn status_updates_are_recorded_in_order() {
        let results = results();
        results.send_status_update(AlgorithmStatus::Stopped, Some("Algorithm Stopped"));
        results.send_status_update(AlgorithmStatus::Completed, None);
        assert_eq!(
            results.statuses(),
            vec![
                (AlgorithmStatus::Stopped, Some("Algorithm Stopped".to_string())),
                (AlgorithmStatus::Completed, None),
            ]
        );
    }
}
