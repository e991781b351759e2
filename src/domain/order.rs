//! Order requests and tickets exchanged with the transaction layer.

use chrono::{DateTime, Utc};
use std::fmt;

use super::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderType {
    Market,
    MarketOnClose,
    Limit { price: f64 },
    OptionExercise,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub quantity: f64,
    pub order_type: OrderType,
    pub time: DateTime<Utc>,
    pub tag: String,
}

impl OrderRequest {
    pub fn market(
        symbol: Symbol,
        quantity: f64,
        time: DateTime<Utc>,
        tag: impl Into<String>,
    ) -> Self {
        OrderRequest {
            symbol,
            quantity,
            order_type: OrderType::Market,
            time,
            tag: tag.into(),
        }
    }

    pub fn market_on_close(
        symbol: Symbol,
        quantity: f64,
        time: DateTime<Utc>,
        tag: impl Into<String>,
    ) -> Self {
        OrderRequest {
            order_type: OrderType::MarketOnClose,
            ..OrderRequest::market(symbol, quantity, time, tag)
        }
    }

    pub fn exercise(
        symbol: Symbol,
        quantity: f64,
        time: DateTime<Utc>,
        tag: impl Into<String>,
    ) -> Self {
        OrderRequest {
            order_type: OrderType::OptionExercise,
            ..OrderRequest::market(symbol, quantity, time, tag)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    Filled,
    Canceled,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTicket {
    pub id: u64,
    pub symbol: Symbol,
    pub quantity: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub fill_price: f64,
    pub tag: String,
}

impl fmt::Display for OrderTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - Quantity: {} @ {}",
            self.symbol, self.quantity, self.fill_price
        )
    }
}
