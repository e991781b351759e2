//! In-process simulated brokerage: portfolio, margin and order fills.
//!
//! Implements both [`PortfolioPort`] and [`TransactionPort`] over one book so
//! that fills and cash stay consistent. Orders rest until the next
//! `process_synchronous_events` call and fill at the last known market price.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::domain::market_data::{Dividend, Split};
use crate::domain::order::{OrderRequest, OrderStatus, OrderTicket, OrderType};
use crate::domain::subscription::DataNormalizationMode;
use crate::domain::symbol::Symbol;
use crate::ports::portfolio_port::{MarginCallCheck, PortfolioPort};
use crate::ports::transaction_port::TransactionPort;

/// Brokerage fees: flat fee plus a percentage of traded value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeeModel {
    pub per_trade: f64,
    pub pct: f64,
}

impl FeeModel {
    pub fn commission(&self, trade_value: f64) -> f64 {
        self.per_trade + trade_value.abs() * self.pct / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Holding {
    pub quantity: f64,
    pub average_price: f64,
}

#[derive(Debug)]
struct Book {
    cash: f64,
    unsettled: Vec<(DateTime<Utc>, f64)>,
    holdings: BTreeMap<Symbol, Holding>,
    prices: BTreeMap<Symbol, f64>,
    conversion_rates: BTreeMap<Symbol, f64>,
    open_orders: Vec<(OrderTicket, DateTime<Utc>)>,
    filled: Vec<OrderTicket>,
    next_id: u64,
    total_value: Option<f64>,
}

impl Book {
    fn total_value(&mut self) -> f64 {
        if let Some(value) = self.total_value {
            return value;
        }
        let positions: f64 = self
            .holdings
            .iter()
            .map(|(symbol, h)| {
                h.quantity * self.prices.get(symbol).copied().unwrap_or(h.average_price)
            })
            .sum();
        let unsettled: f64 = self.unsettled.iter().map(|(_, amount)| amount).sum();
        let value = self.cash + unsettled + positions;
        self.total_value = Some(value);
        value
    }

    fn holdings_quantity(&self, symbol: &Symbol) -> f64 {
        self.holdings.get(symbol).map_or(0.0, |h| h.quantity)
    }
}

pub struct SimulatedBrokerage {
    book: Mutex<Book>,
    fees: FeeModel,
    maintenance_margin: f64,
    settlement_delay: Duration,
}

impl SimulatedBrokerage {
    pub fn new(initial_cash: f64) -> Self {
        SimulatedBrokerage {
            book: Mutex::new(Book {
                cash: initial_cash,
                unsettled: Vec::new(),
                holdings: BTreeMap::new(),
                prices: BTreeMap::new(),
                conversion_rates: BTreeMap::new(),
                open_orders: Vec::new(),
                filled: Vec::new(),
                next_id: 1,
                total_value: None,
            }),
            fees: FeeModel::default(),
            maintenance_margin: 0.25,
            settlement_delay: Duration::zero(),
        }
    }

    pub fn with_fees(mut self, fees: FeeModel) -> Self {
        self.fees = fees;
        self
    }

    /// Fraction of gross position value that equity must cover.
    pub fn with_maintenance_margin(mut self, ratio: f64) -> Self {
        self.maintenance_margin = ratio;
        self
    }

    /// Sale proceeds become cash only after `delay`.
    pub fn with_settlement_delay(mut self, delay: Duration) -> Self {
        self.settlement_delay = delay;
        self
    }

    pub fn holding(&self, symbol: &Symbol) -> Option<Holding> {
        self.book.lock().holdings.get(symbol).copied()
    }

    pub fn unsettled_cash(&self) -> f64 {
        self.book.lock().unsettled.iter().map(|(_, amount)| amount).sum()
    }

    pub fn conversion_rate(&self, symbol: &Symbol) -> Option<f64> {
        self.book.lock().conversion_rates.get(symbol).copied()
    }

    pub fn filled_orders(&self) -> Vec<OrderTicket> {
        self.book.lock().filled.clone()
    }

    fn margin_used(&self, book: &Book) -> f64 {
        book.holdings
            .iter()
            .map(|(symbol, h)| {
                let price = book.prices.get(symbol).copied().unwrap_or(h.average_price);
                (h.quantity * price).abs()
            })
            .sum::<f64>()
            * self.maintenance_margin
    }

    fn fill(
        &self,
        book: &mut Book,
        mut ticket: OrderTicket,
        time: DateTime<Utc>,
        price: f64,
    ) -> OrderTicket {
        let value = ticket.quantity * price;
        let commission = self.fees.commission(value);
        let holding = book.holdings.entry(ticket.symbol.clone()).or_default();
        let previous = holding.quantity;
        let quantity = previous + ticket.quantity;
        if quantity == 0.0 {
            holding.average_price = 0.0;
        } else if previous == 0.0 || previous.signum() != quantity.signum() {
            holding.average_price = price;
        } else if previous.signum() == ticket.quantity.signum() {
            holding.average_price = (holding.average_price * previous + value) / quantity;
        }
        holding.quantity = quantity;
        if quantity == 0.0 {
            book.holdings.remove(&ticket.symbol);
        }

        book.cash -= commission;
        if value < 0.0 && self.settlement_delay > Duration::zero() {
            book.unsettled.push((time + self.settlement_delay, -value));
        } else {
            book.cash -= value;
        }
        book.total_value = None;

        ticket.status = OrderStatus::Filled;
        ticket.fill_price = price;
        debug!(
            order = ticket.id,
            symbol = %ticket.symbol,
            quantity = ticket.quantity,
            price,
            commission,
            "order filled"
        );
        book.filled.push(ticket.clone());
        ticket
    }

    fn submit(&self, book: &mut Book, request: OrderRequest) -> OrderTicket {
        let id = book.next_id;
        book.next_id += 1;
        let status = if request.quantity == 0.0 {
            OrderStatus::Invalid
        } else {
            OrderStatus::Submitted
        };
        let ticket = OrderTicket {
            id,
            symbol: request.symbol,
            quantity: request.quantity,
            order_type: request.order_type,
            status,
            fill_price: 0.0,
            tag: request.tag,
        };
        if status == OrderStatus::Submitted {
            book.open_orders.push((ticket.clone(), request.time));
        }
        ticket
    }

    fn fill_price(order_type: OrderType, quantity: f64, market: f64) -> Option<f64> {
        match order_type {
            OrderType::Market | OrderType::MarketOnClose | OrderType::OptionExercise => {
                Some(market)
            }
            OrderType::Limit { price } if quantity > 0.0 && market <= price => Some(market),
            OrderType::Limit { price } if quantity < 0.0 && market >= price => Some(market),
            OrderType::Limit { .. } => None,
        }
    }
}

impl TransactionPort for SimulatedBrokerage {
    fn process_synchronous_events(&self) -> anyhow::Result<()> {
        let mut book = self.book.lock();
        let pending = std::mem::take(&mut book.open_orders);
        for (ticket, time) in pending {
            let fill = book
                .prices
                .get(&ticket.symbol)
                .and_then(|market| Self::fill_price(ticket.order_type, ticket.quantity, *market));
            match fill {
                Some(price) => {
                    self.fill(&mut book, ticket, time, price);
                }
                None => book.open_orders.push((ticket, time)),
            }
        }
        Ok(())
    }

    fn cancel_open_orders(&self, symbol: &Symbol, tag: &str) -> Vec<OrderTicket> {
        let mut book = self.book.lock();
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut book.open_orders)
            .into_iter()
            .partition(|(t, _)| &t.symbol == symbol);
        book.open_orders = kept;
        cancelled
            .into_iter()
            .map(|(mut ticket, _)| {
                ticket.status = OrderStatus::Canceled;
                ticket.tag = tag.to_string();
                trace!(order = ticket.id, symbol = %symbol, tag, "order cancelled");
                ticket
            })
            .collect()
    }

    fn process_request(&self, request: OrderRequest) -> OrderTicket {
        let mut book = self.book.lock();
        self.submit(&mut book, request)
    }

    fn open_orders(&self, symbol: &Symbol) -> Vec<OrderTicket> {
        self.book
            .lock()
            .open_orders
            .iter()
            .filter(|(t, _)| &t.symbol == symbol)
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn apply_split(&self, split: &Split) {
        if split.split_factor == 0.0 {
            return;
        }
        let mut book = self.book.lock();
        for (ticket, _) in book.open_orders.iter_mut().filter(|(t, _)| t.symbol == split.symbol) {
            ticket.quantity = (ticket.quantity / split.split_factor).trunc();
            if let OrderType::Limit { price } = ticket.order_type {
                ticket.order_type = OrderType::Limit {
                    price: price * split.split_factor,
                };
            }
        }
    }
}

impl PortfolioPort for SimulatedBrokerage {
    fn total_portfolio_value(&self) -> f64 {
        self.book.lock().total_value()
    }

    fn invalidate_total_portfolio_value(&self) {
        self.book.lock().total_value = None;
    }

    fn cash(&self) -> f64 {
        self.book.lock().cash
    }

    fn holdings_quantity(&self, symbol: &Symbol) -> f64 {
        self.book.lock().holdings_quantity(symbol)
    }

    fn invested_symbols(&self) -> Vec<Symbol> {
        self.book
            .lock()
            .holdings
            .iter()
            .filter(|(_, h)| h.quantity != 0.0)
            .map(|(s, _)| s.clone())
            .collect()
    }

    fn update_market_price(&self, symbol: &Symbol, price: f64) {
        if price > 0.0 {
            self.book.lock().prices.insert(symbol.clone(), price);
        }
    }

    fn update_conversion_rate(&self, symbol: &Symbol, rate: f64) {
        if rate > 0.0 {
            self.book.lock().conversion_rates.insert(symbol.clone(), rate);
        }
    }

    /// Reduces the largest position until equity covers the maintenance
    /// requirement. Warns once less than 5% of equity is left uncovered.
    fn margin_call_orders(&self) -> MarginCallCheck {
        let mut book = self.book.lock();
        let equity = book.total_value();
        let used = self.margin_used(&book);
        if used <= 0.0 {
            return MarginCallCheck::default();
        }
        if equity >= used {
            return MarginCallCheck {
                orders: Vec::new(),
                issue_warning: equity - used < equity * 0.05,
            };
        }

        let largest = book
            .holdings
            .iter()
            .map(|(s, h)| (s, h.quantity, book.prices.get(s).copied().unwrap_or(h.average_price)))
            .max_by(|a, b| (a.1 * a.2).abs().total_cmp(&(b.1 * b.2).abs()));
        let Some((symbol, quantity, price)) = largest else {
            return MarginCallCheck::default();
        };
        if price <= 0.0 {
            return MarginCallCheck::default();
        }
        let deficit = used - equity;
        let reduce = (deficit / (price * self.maintenance_margin)).ceil().min(quantity.abs());
        MarginCallCheck {
            orders: vec![OrderRequest::market(
                symbol.clone(),
                -reduce * quantity.signum(),
                DateTime::<Utc>::MIN_UTC,
                "Margin Call",
            )],
            issue_warning: false,
        }
    }

    fn execute_margin_call(&self, orders: &[OrderRequest]) -> anyhow::Result<Vec<OrderTicket>> {
        let mut book = self.book.lock();
        let mut tickets = Vec::with_capacity(orders.len());
        for order in orders {
            let price = book
                .prices
                .get(&order.symbol)
                .copied()
                .ok_or_else(|| {
                    anyhow::anyhow!("no market price for margin call on {}", order.symbol)
                })?;
            let ticket = self.submit(&mut book, order.clone());
            book.open_orders.retain(|(t, _)| t.id != ticket.id);
            if ticket.status == OrderStatus::Submitted {
                tickets.push(self.fill(&mut book, ticket, order.time, price));
            }
        }
        Ok(tickets)
    }

    fn apply_dividend(
        &self,
        dividend: &Dividend,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()> {
        // adjusted prices already carry the distribution
        if !live_mode && mode != DataNormalizationMode::Raw {
            return Ok(());
        }
        let mut book = self.book.lock();
        let quantity = book.holdings_quantity(&dividend.symbol);
        book.cash += quantity * dividend.distribution;
        book.total_value = None;
        Ok(())
    }

    fn apply_split(
        &self,
        split: &Split,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()> {
        if !live_mode && mode != DataNormalizationMode::Raw {
            return Ok(());
        }
        if split.split_factor <= 0.0 {
            anyhow::bail!("invalid split factor {} for {}", split.split_factor, split.symbol);
        }
        let mut book = self.book.lock();
        let post_split_price = split.reference_price * split.split_factor;
        if let Some(holding) = book.holdings.get_mut(&split.symbol) {
            let exact = holding.quantity / split.split_factor;
            let whole = exact.trunc();
            holding.quantity = whole;
            holding.average_price *= split.split_factor;
            book.cash += (exact - whole) * post_split_price;
        }
        if let Some(price) = book.prices.get_mut(&split.symbol) {
            *price *= split.split_factor;
        }
        book.total_value = None;
        Ok(())
    }

    fn scan_for_cash_settlement(&self, time: DateTime<Utc>) {
        let mut book = self.book.lock();
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut book.unsettled)
            .into_iter()
            .partition(|(settle, _)| *settle <= time);
        book.unsettled = pending;
        let amount: f64 = due.iter().map(|(_, a)| a).sum();
        if amount != 0.0 {
            book.cash += amount;
            trace!(%time, amount, "cash settled");
        }
    }
}
