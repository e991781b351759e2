//! Consolidators aggregate finer data into coarser bars.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::market_data::{DataKind, MarketData, TickType, TradeBar};
use super::resolution::round_down;
use super::symbol::Symbol;

pub trait Consolidator: Send {
    fn update(&mut self, data: &MarketData) -> anyhow::Result<()>;

    /// Flushes any working bar whose period has ended by `time`.
    fn scan(&mut self, time: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Bars emitted by a consolidator, shared with the strategy that owns it.
pub type ConsolidatedBars = Arc<Mutex<Vec<TradeBar>>>;

/// Builds fixed-period trade bars from trade bars, quote bars or trade ticks.
pub struct TradeBarConsolidator {
    period: Duration,
    working: Option<TradeBar>,
    output: ConsolidatedBars,
}

impl TradeBarConsolidator {
    pub fn new(period: Duration) -> (Self, ConsolidatedBars) {
        let output: ConsolidatedBars = Arc::new(Mutex::new(Vec::new()));
        let consolidator = TradeBarConsolidator {
            period,
            working: None,
            output: Arc::clone(&output),
        };
        (consolidator, output)
    }

    fn emit(&mut self) {
        if let Some(bar) = self.working.take() {
            self.output.lock().push(bar);
        }
    }
}

impl Consolidator for TradeBarConsolidator {
    fn update(&mut self, data: &MarketData) -> anyhow::Result<()> {
        let (open, high, low, close, volume) = match data {
            MarketData::TradeBar(b) => (b.open, b.high, b.low, b.close, b.volume),
            MarketData::QuoteBar(q) => match q.mid() {
                Some(m) => (m.open, m.high, m.low, m.close, 0.0),
                None => return Ok(()),
            },
            MarketData::Tick(t) if t.tick_type == TickType::Trade => {
                (t.value, t.value, t.value, t.value, t.quantity)
            }
            _ => return Ok(()),
        };

        if let Some(working) = &self.working {
            if data.time() >= working.end_time() {
                self.emit();
            }
        }

        match &mut self.working {
            Some(bar) => {
                bar.high = bar.high.max(high);
                bar.low = bar.low.min(low);
                bar.close = close;
                bar.volume += volume;
            }
            None => {
                let start = round_down(data.time().naive_utc(), self.period).and_utc();
                self.working = Some(TradeBar {
                    symbol: data.symbol().clone(),
                    time: start,
                    period: self.period,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    is_fill_forward: false,
                });
            }
        }
        Ok(())
    }

    fn scan(&mut self, time: DateTime<Utc>) -> anyhow::Result<()> {
        if self.working.as_ref().is_some_and(|bar| time >= bar.end_time()) {
            self.emit();
        }
        Ok(())
    }
}

/// Consolidators registered per subscription, keyed by symbol and data kind.
#[derive(Default)]
pub struct ConsolidatorRegistry {
    entries: BTreeMap<(Symbol, DataKind), Vec<Box<dyn Consolidator>>>,
}

impl ConsolidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        symbol: Symbol,
        kind: DataKind,
        consolidator: Box<dyn Consolidator>,
    ) {
        self.entries.entry((symbol, kind)).or_default().push(consolidator);
    }

    pub fn remove_symbol(&mut self, symbol: &Symbol) {
        self.entries.retain(|(s, _), _| s != symbol);
    }

    pub fn for_subscription(
        &mut self,
        symbol: &Symbol,
        kind: &DataKind,
    ) -> Option<&mut Vec<Box<dyn Consolidator>>> {
        self.entries.get_mut(&(symbol.clone(), kind.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
