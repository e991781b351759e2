//! Order processing port trait.

use crate::domain::market_data::Split;
use crate::domain::order::{OrderRequest, OrderTicket};
use crate::domain::symbol::Symbol;

pub trait TransactionPort: Send + Sync {
    /// Resolves fills that must settle before strategy code observes a slice.
    fn process_synchronous_events(&self) -> anyhow::Result<()>;

    fn cancel_open_orders(&self, symbol: &Symbol, tag: &str) -> Vec<OrderTicket>;

    fn process_request(&self, request: OrderRequest) -> OrderTicket;

    fn open_orders(&self, symbol: &Symbol) -> Vec<OrderTicket>;

    /// Adjusts resting order prices and quantities for a split.
    fn apply_split(&self, split: &Split);
}
