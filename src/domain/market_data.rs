//! Market and corporate-action data points.
//!
//! All timestamps are UTC. Bars carry their start `time` and a `period`;
//! everything else is instantaneous and ends at `time`.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use super::exchange_hours::ExchangeHours;
use super::symbol::Symbol;

/// Tag naming the declared type of a data point.
///
/// Subscriptions are keyed by this tag, and strategy callbacks are registered
/// against it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    Tick,
    TradeBar,
    QuoteBar,
    OpenInterest,
    Dividend,
    Split,
    Delisting,
    SymbolChangedEvent,
    OptionChain,
    Custom(String),
}

impl DataKind {
    /// Corporate actions and other events that carry no tradable price.
    pub fn is_auxiliary(&self) -> bool {
        matches!(
            self,
            DataKind::Dividend
                | DataKind::Split
                | DataKind::Delisting
                | DataKind::SymbolChangedEvent
        )
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, DataKind::Custom(_))
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Tick => f.write_str("Tick"),
            DataKind::TradeBar => f.write_str("TradeBar"),
            DataKind::QuoteBar => f.write_str("QuoteBar"),
            DataKind::OpenInterest => f.write_str("OpenInterest"),
            DataKind::Dividend => f.write_str("Dividend"),
            DataKind::Split => f.write_str("Split"),
            DataKind::Delisting => f.write_str("Delisting"),
            DataKind::SymbolChangedEvent => f.write_str("SymbolChangedEvent"),
            DataKind::OptionChain => f.write_str("OptionChain"),
            DataKind::Custom(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickType {
    Trade,
    Quote,
    OpenInterest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub tick_type: TickType,
    pub value: f64,
    pub quantity: f64,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub is_fill_forward: bool,
}

impl Tick {
    pub fn trade(symbol: Symbol, time: DateTime<Utc>, price: f64, quantity: f64) -> Self {
        Tick {
            symbol,
            time,
            tick_type: TickType::Trade,
            value: price,
            quantity,
            bid_price: 0.0,
            bid_size: 0.0,
            ask_price: 0.0,
            ask_size: 0.0,
            is_fill_forward: false,
        }
    }

    pub fn quote(
        symbol: Symbol,
        time: DateTime<Utc>,
        bid_price: f64,
        bid_size: f64,
        ask_price: f64,
        ask_size: f64,
    ) -> Self {
        let value = if bid_price != 0.0 && ask_price != 0.0 {
            (bid_price + ask_price) / 2.0
        } else {
            bid_price.max(ask_price)
        };
        Tick {
            symbol,
            time,
            tick_type: TickType::Quote,
            value,
            quantity: 0.0,
            bid_price,
            bid_size,
            ask_price,
            ask_size,
            is_fill_forward: false,
        }
    }

    pub fn open_interest(symbol: Symbol, time: DateTime<Utc>, value: f64) -> Self {
        Tick {
            tick_type: TickType::OpenInterest,
            ..Tick::trade(symbol, time, value, 0.0)
        }
    }
}

/// One side of a quote bar, or the prices of a trade bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn flat(price: f64) -> Self {
        Bar {
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeBar {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub period: Duration,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_fill_forward: bool,
}

impl TradeBar {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.time + self.period
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteBar {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub period: Duration,
    pub bid: Option<Bar>,
    pub ask: Option<Bar>,
    pub last_bid_size: f64,
    pub last_ask_size: f64,
    pub is_fill_forward: bool,
}

impl QuoteBar {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.time + self.period
    }

    /// Mid bar when both sides exist, otherwise whichever side is present.
    pub fn mid(&self) -> Option<Bar> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some(Bar {
                open: (b.open + a.open) / 2.0,
                high: (b.high + a.high) / 2.0,
                low: (b.low + a.low) / 2.0,
                close: (b.close + a.close) / 2.0,
            }),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dividend {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub distribution: f64,
    pub reference_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitType {
    Warning,
    SplitOccurred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub split_factor: f64,
    pub reference_price: f64,
    pub split_type: SplitType,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:?} factor {} @ {}",
            self.symbol, self.split_type, self.split_factor, self.reference_price
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelistingType {
    Warning,
    Delisted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delisting {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub delisting_type: DelistingType,
    pub price: f64,
}

/// Orders are submitted this long before the close so market-on-close is still accepted.
pub fn market_on_close_buffer() -> Duration {
    Duration::minutes(15)
}

impl Delisting {
    /// Time at which a held position is liquidated: the close of the
    /// delisting day minus the market-on-close buffer.
    pub fn liquidation_time(&self, hours: &ExchangeHours) -> DateTime<Utc> {
        let local_date = self.time.with_timezone(&hours.time_zone).date_naive();
        hours.market_close_on(local_date) - market_on_close_buffer()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolChangedEvent {
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub old_symbol: String,
    pub new_symbol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionChain {
    /// Canonical chain symbol.
    pub symbol: Symbol,
    pub time: DateTime<Utc>,
    pub underlying_price: f64,
    pub contracts: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomData {
    pub symbol: Symbol,
    pub type_name: String,
    pub time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub value: f64,
    pub is_fill_forward: bool,
}

/// A single data point of any supported type.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketData {
    Tick(Tick),
    TradeBar(TradeBar),
    QuoteBar(QuoteBar),
    Dividend(Dividend),
    Split(Split),
    Delisting(Delisting),
    SymbolChanged(SymbolChangedEvent),
    OptionChain(OptionChain),
    Custom(CustomData),
}

impl MarketData {
    pub fn symbol(&self) -> &Symbol {
        match self {
            MarketData::Tick(d) => &d.symbol,
            MarketData::TradeBar(d) => &d.symbol,
            MarketData::QuoteBar(d) => &d.symbol,
            MarketData::Dividend(d) => &d.symbol,
            MarketData::Split(d) => &d.symbol,
            MarketData::Delisting(d) => &d.symbol,
            MarketData::SymbolChanged(d) => &d.symbol,
            MarketData::OptionChain(d) => &d.symbol,
            MarketData::Custom(d) => &d.symbol,
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            MarketData::Tick(t) if t.tick_type == TickType::OpenInterest => DataKind::OpenInterest,
            MarketData::Tick(_) => DataKind::Tick,
            MarketData::TradeBar(_) => DataKind::TradeBar,
            MarketData::QuoteBar(_) => DataKind::QuoteBar,
            MarketData::Dividend(_) => DataKind::Dividend,
            MarketData::Split(_) => DataKind::Split,
            MarketData::Delisting(_) => DataKind::Delisting,
            MarketData::SymbolChanged(_) => DataKind::SymbolChangedEvent,
            MarketData::OptionChain(_) => DataKind::OptionChain,
            MarketData::Custom(d) => DataKind::Custom(d.type_name.clone()),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            MarketData::Tick(d) => d.time,
            MarketData::TradeBar(d) => d.time,
            MarketData::QuoteBar(d) => d.time,
            MarketData::Dividend(d) => d.time,
            MarketData::Split(d) => d.time,
            MarketData::Delisting(d) => d.time,
            MarketData::SymbolChanged(d) => d.time,
            MarketData::OptionChain(d) => d.time,
            MarketData::Custom(d) => d.time,
        }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        match self {
            MarketData::TradeBar(d) => d.end_time(),
            MarketData::QuoteBar(d) => d.end_time(),
            MarketData::Custom(d) => d.end_time,
            other => other.time(),
        }
    }

    pub fn is_fill_forward(&self) -> bool {
        match self {
            MarketData::Tick(d) => d.is_fill_forward,
            MarketData::TradeBar(d) => d.is_fill_forward,
            MarketData::QuoteBar(d) => d.is_fill_forward,
            MarketData::Custom(d) => d.is_fill_forward,
            _ => false,
        }
    }

    /// Last traded (or mid) price carried by the data point.
    pub fn price(&self) -> f64 {
        match self {
            MarketData::Tick(d) => d.value,
            MarketData::TradeBar(d) => d.close,
            MarketData::QuoteBar(d) => d.mid().map(|b| b.close).unwrap_or(0.0),
            MarketData::Dividend(d) => d.reference_price,
            MarketData::Split(d) => d.reference_price,
            MarketData::Delisting(d) => d.price,
            MarketData::SymbolChanged(_) => 0.0,
            MarketData::OptionChain(d) => d.underlying_price,
            MarketData::Custom(d) => d.value,
        }
    }
}
