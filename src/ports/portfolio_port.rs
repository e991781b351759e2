//! Portfolio, margin and cash-book port trait.

use chrono::{DateTime, Utc};

use crate::domain::market_data::{Dividend, Split};
use crate::domain::order::{OrderRequest, OrderTicket};
use crate::domain::subscription::DataNormalizationMode;
use crate::domain::symbol::Symbol;

/// Margin-call orders due now, plus whether a soft warning applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarginCallCheck {
    pub orders: Vec<OrderRequest>,
    pub issue_warning: bool,
}

pub trait PortfolioPort: Send + Sync {
    fn total_portfolio_value(&self) -> f64;

    fn invalidate_total_portfolio_value(&self);

    fn cash(&self) -> f64;

    fn holdings_quantity(&self, symbol: &Symbol) -> f64;

    fn invested_symbols(&self) -> Vec<Symbol>;

    fn update_market_price(&self, symbol: &Symbol, price: f64);

    fn update_conversion_rate(&self, symbol: &Symbol, rate: f64);

    fn margin_call_orders(&self) -> MarginCallCheck;

    fn execute_margin_call(&self, orders: &[OrderRequest]) -> anyhow::Result<Vec<OrderTicket>>;

    fn apply_dividend(
        &self,
        dividend: &Dividend,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()>;

    fn apply_split(
        &self,
        split: &Split,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()>;

    fn scan_for_cash_settlement(&self, time: DateTime<Utc>);
}
