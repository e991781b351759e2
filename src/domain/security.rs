//! Securities, their price cache, and universe membership.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::exchange_hours::ExchangeHours;
use super::market_data::{DataKind, MarketData, TickType};
use super::subscription::is_default_data_type;
use super::symbol::Symbol;

/// Last known market state of one security.
///
/// Rules:
/// * fill-forward points never touch the cache;
/// * open-interest ticks only set `open_interest`;
/// * when a quote bar and a trade bar share an end time, the quote bar
///   provides OHLC and the last observation, whichever arrives first.
#[derive(Debug, Clone, Default)]
pub struct SecurityCache {
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub open_interest: i64,
    last_data: Option<MarketData>,
    last_quote_bar_update: Option<DateTime<Utc>>,
    last_ohlc_update: Option<DateTime<Utc>>,
    data_by_kind: BTreeMap<DataKind, Vec<MarketData>>,
    last_tick_trades: Vec<MarketData>,
    last_tick_quotes: Vec<MarketData>,
}

impl SecurityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a list of points of one data kind. Non fill-forward points are
    /// stored by kind; only the last point moves prices.
    pub fn add_data_list(
        &mut self,
        data: &[MarketData],
        kind: &DataKind,
        contains_fill_forward: bool,
    ) {
        let Some(last) = data.last() else {
            return;
        };
        let stored: Vec<MarketData> = if contains_fill_forward {
            data.iter().filter(|d| !d.is_fill_forward()).cloned().collect()
        } else {
            data.to_vec()
        };
        if !stored.is_empty() {
            self.store_data(stored, kind);
        } else if *kind == DataKind::OpenInterest {
            self.store_data(data.to_vec(), kind);
        }
        self.add_data_impl(last, false);
    }

    pub fn add_data(&mut self, data: &MarketData) {
        self.add_data_impl(data, true);
    }

    fn add_data_impl(&mut self, data: &MarketData, cache_by_kind: bool) {
        if let MarketData::Tick(tick) = data {
            if tick.tick_type == TickType::OpenInterest {
                if cache_by_kind {
                    self.store_data(vec![data.clone()], &DataKind::OpenInterest);
                }
                self.open_interest = tick.value as i64;
                return;
            }
        }

        if data.is_fill_forward() {
            return;
        }

        if cache_by_kind {
            self.store_data(vec![data.clone()], &data.kind());
        }

        let end_time = data.end_time();
        let is_default = is_default_data_type(data);
        let is_trade_bar = matches!(data, MarketData::TradeBar(_));

        if (self.last_data.is_none()
            || self.last_quote_bar_update != Some(end_time)
            || !is_trade_bar)
            && is_default
        {
            self.last_data = Some(data.clone());
        }

        match data {
            MarketData::Tick(tick) => {
                if tick.value != 0.0 {
                    self.price = tick.value;
                }
                match tick.tick_type {
                    TickType::Trade => {
                        if tick.quantity != 0.0 {
                            self.volume = tick.quantity;
                        }
                    }
                    TickType::Quote => {
                        if tick.bid_price != 0.0 {
                            self.bid_price = tick.bid_price;
                        }
                        if tick.bid_size != 0.0 {
                            self.bid_size = tick.bid_size;
                        }
                        if tick.ask_price != 0.0 {
                            self.ask_price = tick.ask_price;
                        }
                        if tick.ask_size != 0.0 {
                            self.ask_size = tick.ask_size;
                        }
                    }
                    TickType::OpenInterest => {}
                }
            }
            MarketData::TradeBar(bar) => {
                self.update_ohlc(end_time, is_default, bar.open, bar.high, bar.low, bar.close);
                if bar.volume != 0.0 {
                    self.volume = bar.volume;
                }
            }
            MarketData::QuoteBar(bar) => {
                if let Some(mid) = bar.mid() {
                    self.update_ohlc(end_time, is_default, mid.open, mid.high, mid.low, mid.close);
                }
                self.last_quote_bar_update = Some(end_time);
                if let Some(ask) = bar.ask.filter(|a| a.close != 0.0) {
                    self.ask_price = ask.close;
                }
                if let Some(bid) = bar.bid.filter(|b| b.close != 0.0) {
                    self.bid_price = bid.close;
                }
                if bar.last_bid_size != 0.0 {
                    self.bid_size = bar.last_bid_size;
                }
                if bar.last_ask_size != 0.0 {
                    self.ask_size = bar.last_ask_size;
                }
            }
            other if !other.kind().is_auxiliary() => {
                self.price = other.price();
            }
            _ => {}
        }
    }

    fn update_ohlc(
        &mut self,
        end_time: DateTime<Utc>,
        is_default: bool,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) {
        let quote_seen = self.last_quote_bar_update == Some(end_time);
        let ohlc_seen = self.last_ohlc_update == Some(end_time);
        if (!quote_seen || !ohlc_seen) && is_default {
            self.last_ohlc_update = Some(end_time);
            if open != 0.0 {
                self.open = open;
            }
            if high != 0.0 {
                self.high = high;
            }
            if low != 0.0 {
                self.low = low;
            }
            if close != 0.0 {
                self.price = close;
                self.close = close;
            }
        }
    }

    /// Stores points by kind without touching any price field.
    pub fn store_data(&mut self, data: Vec<MarketData>, kind: &DataKind) {
        if *kind == DataKind::Tick {
            if let Some(MarketData::Tick(tick)) = data.last() {
                match tick.tick_type {
                    TickType::Trade => {
                        self.last_tick_trades = data;
                        return;
                    }
                    TickType::Quote => {
                        self.last_tick_quotes = data;
                        return;
                    }
                    TickType::OpenInterest => {}
                }
            }
        }
        self.data_by_kind.insert(kind.clone(), data);
    }

    /// Last primary observation.
    pub fn get_data(&self) -> Option<&MarketData> {
        self.last_data.as_ref()
    }

    /// Most recent stored point of `kind`.
    pub fn get_data_of(&self, kind: &DataKind) -> Option<&MarketData> {
        if *kind == DataKind::Tick {
            return self.last_tick_quotes.last().or_else(|| self.last_tick_trades.last());
        }
        self.data_by_kind.get(kind).and_then(|list| list.last())
    }

    /// Every point of `kind` from the latest time step that produced one.
    pub fn get_all(&self, kind: &DataKind) -> Vec<&MarketData> {
        if *kind == DataKind::Tick {
            return self.last_tick_trades.iter().chain(self.last_tick_quotes.iter()).collect();
        }
        self.data_by_kind
            .get(kind)
            .map(|list| list.iter().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Security {
    pub symbol: Symbol,
    pub cache: SecurityCache,
    pub exchange_hours: ExchangeHours,
    pub is_tradable: bool,
    pub is_delisted: bool,
    /// Added by the engine for its own bookkeeping (currency conversion).
    pub is_internal_feed: bool,
}

impl Security {
    pub fn new(symbol: Symbol, exchange_hours: ExchangeHours) -> Self {
        Security {
            symbol,
            cache: SecurityCache::new(),
            exchange_hours,
            is_tradable: true,
            is_delisted: false,
            is_internal_feed: false,
        }
    }

    pub fn internal(mut self) -> Self {
        self.is_internal_feed = true;
        self
    }

    pub fn price(&self) -> f64 {
        self.cache.price
    }

    pub fn update(&mut self, data: &[MarketData], kind: &DataKind, contains_fill_forward: bool) {
        self.cache.add_data_list(data, kind, contains_fill_forward);
    }
}

/// Every security known to the algorithm, keyed by symbol.
#[derive(Debug, Clone, Default)]
pub struct Securities {
    inner: BTreeMap<Symbol, Security>,
}

impl Securities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `security` unless its symbol is already present.
    pub fn try_add(&mut self, security: Security) -> bool {
        if self.inner.contains_key(&security.symbol) {
            return false;
        }
        self.inner.insert(security.symbol.clone(), security);
        true
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Security> {
        self.inner.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut Security> {
        self.inner.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.inner.contains_key(symbol)
    }

    pub fn remove(&mut self, symbol: &Symbol) -> Option<Security> {
        self.inner.remove(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Security)> {
        self.inner.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Security> {
        self.inner.values()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Membership of symbols in named universes.
#[derive(Debug, Clone, Default)]
pub struct UniverseManager {
    universes: BTreeMap<String, BTreeSet<Symbol>>,
}

impl UniverseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, universe: &str, symbol: Symbol) {
        self.universes.entry(universe.to_string()).or_default().insert(symbol);
    }

    pub fn remove_member(&mut self, universe: &str, symbol: &Symbol) -> bool {
        self.universes
            .get_mut(universe)
            .map(|members| members.remove(symbol))
            .unwrap_or(false)
    }

    pub fn remove_from_all(&mut self, symbol: &Symbol) {
        for members in self.universes.values_mut() {
            members.remove(symbol);
        }
    }

    /// Whether any universe still selects `symbol`.
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.universes.values().any(|members| members.contains(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::{Bar, QuoteBar, Tick, TradeBar};
    use crate::domain::symbol::SecurityType;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn spy() -> Symbol {
        Symbol::new("SPY", SecurityType::Equity)
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
    }

    fn trade_bar(close: f64, fill_forward: bool) -> MarketData {
        MarketData::TradeBar(TradeBar {
            symbol: spy(),
            time: start(),
            period: Duration::minutes(1),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
            is_fill_forward: fill_forward,
        })
    }

    fn quote_bar(mid: f64) -> MarketData {
        MarketData::QuoteBar(QuoteBar {
            symbol: spy(),
            time: start(),
            period: Duration::minutes(1),
            bid: Some(Bar::flat(mid - 0.5)),
            ask: Some(Bar::flat(mid + 0.5)),
            last_bid_size: 5.0,
            last_ask_size: 7.0,
            is_fill_forward: false,
        })
    }

    #[test]
    fn quote_bar_wins_over_later_trade_bar() {
        let mut cache = SecurityCache::new();
        cache.add_data(&quote_bar(100.0));
        cache.add_data(&trade_bar(105.0, false));
        assert_relative_eq!(cache.close, 100.0);
        assert_relative_eq!(cache.volume, 1000.0);
        assert!(matches!(cache.get_data(), Some(MarketData::QuoteBar(_))));
    }

    #[test]
    fn quote_bar_wins_over_earlier_trade_bar() {
        let mut cache = SecurityCache::new();
        cache.add_data(&trade_bar(105.0, false));
        cache.add_data(&quote_bar(100.0));
        assert_relative_eq!(cache.close, 100.0);
        assert_relative_eq!(cache.bid_price, 99.5);
        assert!(matches!(cache.get_data(), Some(MarketData::QuoteBar(_))));
    }

    #[test]
    fn fill_forward_never_overwrites() {
        let mut cache = SecurityCache::new();
        cache.add_data(&trade_bar(100.0, false));
        cache.add_data(&trade_bar(50.0, true));
        assert_relative_eq!(cache.price, 100.0);
    }

    #[test]
    fn open_interest_bypasses_fill_forward_filter() {
        let mut cache = SecurityCache::new();
        let mut tick = Tick::open_interest(spy(), start(), 1500.0);
        tick.is_fill_forward = true;
        cache.add_data(&MarketData::Tick(tick));
        assert_eq!(cache.open_interest, 1500);
        assert_relative_eq!(cache.price, 0.0);
    }

    #[test]
    fn quote_tick_updates_bid_ask_only_when_non_zero() {
        let mut cache = SecurityCache::new();
        cache.add_data(&MarketData::Tick(Tick::quote(spy(), start(), 99.0, 10.0, 101.0, 12.0)));
        cache.add_data(&MarketData::Tick(Tick::quote(spy(), start(), 99.5, 0.0, 0.0, 0.0)));
        assert_relative_eq!(cache.bid_price, 99.5);
        assert_relative_eq!(cache.bid_size, 10.0);
        assert_relative_eq!(cache.ask_price, 101.0);
    }

    #[test]
    fn add_data_list_stores_non_fill_forward_points() {
        let mut cache = SecurityCache::new();
        let list = vec![trade_bar(100.0, false), trade_bar(101.0, true)];
        cache.add_data_list(&list, &DataKind::TradeBar, true);
        assert_eq!(cache.get_all(&DataKind::TradeBar).len(), 1);
        // last point is fill-forward so prices stay untouched
        assert_relative_eq!(cache.price, 0.0);
    }

    #[test]
    fn tick_lists_split_by_tick_type() {
        let mut cache = SecurityCache::new();
        let trades = vec![MarketData::Tick(Tick::trade(spy(), start(), 100.0, 5.0))];
        let quotes = vec![MarketData::Tick(Tick::quote(spy(), start(), 99.0, 1.0, 101.0, 1.0))];
        cache.add_data_list(&trades, &DataKind::Tick, false);
        cache.add_data_list(&quotes, &DataKind::Tick, false);
        assert_eq!(cache.get_all(&DataKind::Tick).len(), 2);
    }

    #[test]
    fn securities_try_add_rejects_duplicates() {
        let mut securities = Securities::new();
        assert!(securities.try_add(Security::new(spy(), ExchangeHours::us_equity())));
        assert!(!securities.try_add(Security::new(spy(), ExchangeHours::us_equity())));
        assert_eq!(securities.len(), 1);
    }

    #[test]
    fn universe_activity_tracks_membership() {
        let mut universes = UniverseManager::new();
        universes.add_member("etf", spy());
        universes.add_member("large-cap", spy());
        assert!(universes.remove_member("etf", &spy()));
        assert!(universes.is_active(&spy()));
        universes.remove_from_all(&spy());
        assert!(!universes.is_active(&spy()));
    }
}
