//! Everything the loop consumes for one synchronized instant.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::market_data::{
    CustomData, DataKind, Delisting, Dividend, MarketData, OptionChain, QuoteBar, Split,
    SymbolChangedEvent, Tick, TradeBar,
};
use super::security::Security;
use super::subscription::SubscriptionDataConfig;
use super::symbol::Symbol;

/// Data points of one subscription arriving together.
#[derive(Debug, Clone)]
pub struct DataFeedPacket {
    pub config: Arc<SubscriptionDataConfig>,
    pub data: Vec<MarketData>,
}

impl DataFeedPacket {
    pub fn new(config: Arc<SubscriptionDataConfig>, data: Vec<MarketData>) -> Self {
        DataFeedPacket { config, data }
    }
}

/// Public view of the data at one instant, keyed by symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slice {
    pub time: DateTime<Utc>,
    pub trade_bars: BTreeMap<Symbol, TradeBar>,
    pub quote_bars: BTreeMap<Symbol, QuoteBar>,
    pub ticks: BTreeMap<Symbol, Vec<Tick>>,
    pub option_chains: BTreeMap<Symbol, OptionChain>,
    pub dividends: BTreeMap<Symbol, Dividend>,
    pub splits: BTreeMap<Symbol, Split>,
    pub delistings: BTreeMap<Symbol, Delisting>,
    pub symbol_changed_events: BTreeMap<Symbol, SymbolChangedEvent>,
    pub custom: BTreeMap<Symbol, Vec<CustomData>>,
}

impl Slice {
    pub fn empty(time: DateTime<Utc>) -> Self {
        Slice {
            time,
            ..Slice::default()
        }
    }

    pub fn has_data(&self) -> bool {
        !(self.trade_bars.is_empty()
            && self.quote_bars.is_empty()
            && self.ticks.is_empty()
            && self.option_chains.is_empty()
            && self.dividends.is_empty()
            && self.splits.is_empty()
            && self.delistings.is_empty()
            && self.symbol_changed_events.is_empty()
            && self.custom.is_empty())
    }

    pub(crate) fn insert(&mut self, data: &MarketData) {
        let symbol = data.symbol().clone();
        match data {
            MarketData::Tick(t) => self.ticks.entry(symbol).or_default().push(t.clone()),
            MarketData::TradeBar(b) => {
                self.trade_bars.insert(symbol, b.clone());
            }
            MarketData::QuoteBar(q) => {
                self.quote_bars.insert(symbol, q.clone());
            }
            MarketData::OptionChain(c) => {
                self.option_chains.insert(symbol, c.clone());
            }
            MarketData::Dividend(d) => {
                self.dividends.insert(symbol, d.clone());
            }
            MarketData::Split(s) => {
                self.splits.insert(symbol, s.clone());
            }
            MarketData::Delisting(d) => {
                self.delistings.insert(symbol, d.clone());
            }
            MarketData::SymbolChanged(e) => {
                self.symbol_changed_events.insert(symbol, e.clone());
            }
            MarketData::Custom(c) => self.custom.entry(symbol).or_default().push(c.clone()),
        }
    }
}

/// Points of one data kind for one security, applied to its cache in one go.
#[derive(Debug, Clone)]
pub struct SecurityUpdate {
    pub symbol: Symbol,
    pub kind: DataKind,
    pub data: Vec<MarketData>,
    pub is_internal_config: bool,
    pub contains_fill_forward: bool,
}

/// Data a subscription's consolidators must see.
#[derive(Debug, Clone)]
pub struct ConsolidatorUpdate {
    pub config: Arc<SubscriptionDataConfig>,
    pub data: Vec<MarketData>,
}

#[derive(Debug, Clone)]
pub struct AddedSecurity {
    pub universe: String,
    pub security: Security,
}

#[derive(Debug, Clone)]
pub struct RemovedSecurity {
    pub universe: String,
    pub symbol: Symbol,
}

/// Securities entering and leaving universes at one instant.
#[derive(Debug, Clone, Default)]
pub struct SecurityChanges {
    pub added: Vec<AddedSecurity>,
    pub removed: Vec<RemovedSecurity>,
}

impl SecurityChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn added_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.added.iter().map(|a| &a.security.symbol)
    }

    pub fn removed_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.removed.iter().map(|r| &r.symbol)
    }

    pub fn merge(&mut self, other: SecurityChanges) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

/// Synchronized snapshot for one instant. Built once, consumed once.
#[derive(Debug, Clone)]
pub struct TimeSlice {
    pub time: DateTime<Utc>,
    pub data_point_count: usize,
    pub slice: Slice,
    pub securities_update: Vec<SecurityUpdate>,
    /// Internal currency feeds driving conversion rates.
    pub cash_book_update: Vec<SecurityUpdate>,
    /// `None` when no universe changed.
    pub security_changes: Option<SecurityChanges>,
    pub universe_data: BTreeMap<String, Vec<MarketData>>,
    pub consolidator_update: Vec<ConsolidatorUpdate>,
    pub custom_data: Vec<SecurityUpdate>,
    pub is_time_pulse: bool,
}

impl TimeSlice {
    pub fn is_empty(&self) -> bool {
        self.data_point_count == 0 && self.security_changes.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::{DelistingType, SplitType};
    use crate::domain::symbol::SecurityType;
    use chrono::TimeZone;

    #[test]
    fn empty_slice_has_no_data() {
        let slice = Slice::empty(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
        assert!(!slice.has_data());
    }

    #[test]
    fn insert_routes_by_type() {
        let time = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let spy = Symbol::new("SPY", SecurityType::Equity);
        let mut slice = Slice::empty(time);
        slice.insert(&MarketData::Split(Split {
            symbol: spy.clone(),
            time,
            split_factor: 0.5,
            reference_price: 400.0,
            split_type: SplitType::Warning,
        }));
        slice.insert(&MarketData::Delisting(Delisting {
            symbol: spy.clone(),
            time,
            delisting_type: DelistingType::Warning,
            price: 400.0,
        }));
        slice.insert(&MarketData::Tick(Tick::trade(spy.clone(), time, 400.0, 1.0)));
        slice.insert(&MarketData::Tick(Tick::trade(spy.clone(), time, 401.0, 1.0)));
        assert!(slice.has_data());
        assert_eq!(slice.splits.len(), 1);
        assert_eq!(slice.delistings.len(), 1);
        assert_eq!(slice.ticks[&spy].len(), 2);
    }
}
