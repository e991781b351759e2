//! In-memory insight tracker.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::domain::symbol::Symbol;
use crate::ports::alpha_port::{AlphaPort, AlphaRuntimeStatistics};

#[derive(Debug, Clone, PartialEq)]
pub struct Insight {
    pub symbol: Symbol,
    pub generated: DateTime<Utc>,
    pub period: Duration,
    /// Score in `[0, 1]` once the insight has closed.
    pub score: Option<f64>,
}

impl Insight {
    pub fn close_time(&self) -> DateTime<Utc> {
        self.generated + self.period
    }
}

#[derive(Debug, Default)]
struct Book {
    open: Vec<Insight>,
    closed: Vec<Insight>,
    generated: u64,
    now: Option<DateTime<Utc>>,
}

/// Closes insights whose period elapsed on each synchronous flush.
#[derive(Debug, Default)]
pub struct MemoryAlphaAdapter {
    book: Mutex<Book>,
}

impl MemoryAlphaAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, insight: Insight) {
        let mut book = self.book.lock();
        book.generated += 1;
        book.open.push(insight);
    }

    /// Clock used to close insights on the next flush.
    pub fn set_time(&self, time: DateTime<Utc>) {
        self.book.lock().now = Some(time);
    }

    /// Scores an open insight; it is kept until its period ends.
    pub fn score(&self, symbol: &Symbol, score: f64) {
        let mut book = self.book.lock();
        for insight in book.open.iter_mut().filter(|i| &i.symbol == symbol) {
            insight.score = Some(score.clamp(0.0, 1.0));
        }
    }
}

impl AlphaPort for MemoryAlphaAdapter {
    fn process_synchronous_events(&self) -> anyhow::Result<()> {
        let mut book = self.book.lock();
        let Some(now) = book.now else {
            return Ok(());
        };
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut book.open)
            .into_iter()
            .partition(|i| i.close_time() <= now);
        book.open = open;
        book.closed.extend(closed);
        Ok(())
    }

    fn runtime_statistics(&self) -> AlphaRuntimeStatistics {
        let book = self.book.lock();
        let scores: Vec<f64> = book.closed.iter().filter_map(|i| i.score).collect();
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        AlphaRuntimeStatistics {
            insights_generated: book.generated,
            insights_closed: book.closed.len() as u64,
            mean_population_score: mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::symbol::SecurityType;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    #[test]
    fn flush_closes_expired_insights() {
        let alpha = MemoryAlphaAdapter::new();
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let spy = Symbol::new("SPY", SecurityType::Equity);
        let qqq = Symbol::new("QQQ", SecurityType::Equity);
        for (symbol, minutes) in [(&spy, 5), (&qqq, 60)] {
            alpha.emit(Insight {
                symbol: symbol.clone(),
                generated: start,
                period: Duration::minutes(minutes),
                score: None,
            });
        }
        alpha.score(&spy, 0.8);
        alpha.set_time(start + Duration::minutes(10));
        alpha.process_synchronous_events().unwrap();

        let stats = alpha.runtime_statistics();
        assert_eq!(stats.insights_generated, 2);
        assert_eq!(stats.insights_closed, 1);
        assert_relative_eq!(stats.mean_population_score, 0.8);
    }
}
