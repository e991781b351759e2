//! Strategy callback surface and the state strategies act on.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::consolidator::{Consolidator, ConsolidatorRegistry};
use super::exchange_hours::ExchangeHours;
use super::history::HistoryRequest;
use super::market_data::{
    CustomData, DataKind, Delisting, Dividend, MarketData, OptionChain, QuoteBar, Split,
    SymbolChangedEvent, Tick, TradeBar,
};
use super::order::{OrderRequest, OrderTicket};
use super::resolution::Resolution;
use super::security::{Securities, Security, UniverseManager};
use super::status::{AlgorithmStatus, RunState};
use super::subscription::{SubscriptionDataConfig, SubscriptionManager};
use super::symbol::Symbol;
use super::time_slice::{SecurityChanges, SecurityUpdate, Slice};
use crate::ports::Collaborators;
use crate::ports::portfolio_port::PortfolioPort;
use crate::ports::transaction_port::TransactionPort;

pub type CallbackResult = anyhow::Result<()>;

/// Universe holding securities added directly by the strategy.
pub const MANUAL_UNIVERSE: &str = "manual";

/// User strategy. Every hook defaults to a no-op.
///
/// Typed data hooks (`on_trade_bars`, `on_dividends`, ...) are only invoked
/// for the kinds listed by [`handled_data`](Algorithm::handled_data).
#[allow(unused_variables)]
pub trait Algorithm {
    fn initialize(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        Ok(())
    }

    fn handled_data(&self) -> Vec<DataKind> {
        Vec::new()
    }

    fn on_data(&mut self, ctx: &mut AlgorithmContext, slice: &Slice) -> CallbackResult {
        Ok(())
    }

    /// Always invoked, even for slices without data.
    fn on_framework_data(&mut self, ctx: &mut AlgorithmContext, slice: &Slice) -> CallbackResult {
        Ok(())
    }

    fn on_trade_bars(
        &mut self,
        ctx: &mut AlgorithmContext,
        bars: &BTreeMap<Symbol, TradeBar>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_quote_bars(
        &mut self,
        ctx: &mut AlgorithmContext,
        bars: &BTreeMap<Symbol, QuoteBar>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_option_chains(
        &mut self,
        ctx: &mut AlgorithmContext,
        chains: &BTreeMap<Symbol, OptionChain>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_ticks(
        &mut self,
        ctx: &mut AlgorithmContext,
        ticks: &BTreeMap<Symbol, Vec<Tick>>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_dividends(
        &mut self,
        ctx: &mut AlgorithmContext,
        dividends: &BTreeMap<Symbol, Dividend>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_splits(
        &mut self,
        ctx: &mut AlgorithmContext,
        splits: &BTreeMap<Symbol, Split>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_delistings(
        &mut self,
        ctx: &mut AlgorithmContext,
        delistings: &BTreeMap<Symbol, Delisting>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_symbol_changed_events(
        &mut self,
        ctx: &mut AlgorithmContext,
        events: &BTreeMap<Symbol, SymbolChangedEvent>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_custom_data(&mut self, ctx: &mut AlgorithmContext, data: &CustomData) -> CallbackResult {
        Ok(())
    }

    fn on_securities_changed(
        &mut self,
        ctx: &mut AlgorithmContext,
        changes: &SecurityChanges,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_framework_securities_changed(
        &mut self,
        ctx: &mut AlgorithmContext,
        changes: &SecurityChanges,
    ) -> CallbackResult {
        Ok(())
    }

    /// May edit the margin-call orders before they are executed.
    fn on_margin_call(
        &mut self,
        ctx: &mut AlgorithmContext,
        requests: &mut Vec<OrderRequest>,
    ) -> CallbackResult {
        Ok(())
    }

    fn on_margin_call_warning(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        Ok(())
    }

    fn on_end_of_time_step(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        Ok(())
    }

    fn on_end_of_algorithm(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        Ok(())
    }
}

type SliceInvoker<A> = fn(&mut A, &mut AlgorithmContext, &Slice) -> CallbackResult;

/// Typed data handlers of one strategy, resolved once before the run.
pub struct DispatchTable<A> {
    handlers: BTreeMap<DataKind, SliceInvoker<A>>,
    custom: BTreeSet<String>,
}

impl<A: Algorithm> DispatchTable<A> {
    pub fn build(algorithm: &A) -> Self {
        let mut handlers: BTreeMap<DataKind, SliceInvoker<A>> = BTreeMap::new();
        let mut custom = BTreeSet::new();
        for kind in algorithm.handled_data() {
            let invoker: SliceInvoker<A> = match &kind {
                DataKind::TradeBar => |a, c, s| non_empty(&s.trade_bars, |d| a.on_trade_bars(c, d)),
                DataKind::QuoteBar => |a, c, s| non_empty(&s.quote_bars, |d| a.on_quote_bars(c, d)),
                DataKind::OptionChain => {
                    |a, c, s| non_empty(&s.option_chains, |d| a.on_option_chains(c, d))
                }
                DataKind::Tick | DataKind::OpenInterest => {
                    |a, c, s| non_empty(&s.ticks, |d| a.on_ticks(c, d))
                }
                DataKind::Dividend => |a, c, s| non_empty(&s.dividends, |d| a.on_dividends(c, d)),
                DataKind::Split => |a, c, s| non_empty(&s.splits, |d| a.on_splits(c, d)),
                DataKind::Delisting => {
                    |a, c, s| non_empty(&s.delistings, |d| a.on_delistings(c, d))
                }
                DataKind::SymbolChangedEvent => |a, c, s| {
                    non_empty(&s.symbol_changed_events, |d| {
                        a.on_symbol_changed_events(c, d)
                    })
                },
                DataKind::Custom(name) => {
                    custom.insert(name.clone());
                    continue;
                }
            };
            let kind = if kind == DataKind::OpenInterest { DataKind::Tick } else { kind };
            handlers.insert(kind, invoker);
        }
        DispatchTable { handlers, custom }
    }

    pub fn handles(&self, kind: &DataKind) -> bool {
        match kind {
            DataKind::Custom(name) => self.custom.contains(name),
            other => self.handlers.contains_key(other),
        }
    }

    /// Invokes the handler for `kind` when one is registered and the slice
    /// carries data of that kind.
    pub fn dispatch(
        &self,
        kind: &DataKind,
        algorithm: &mut A,
        ctx: &mut AlgorithmContext,
        slice: &Slice,
    ) -> CallbackResult {
        match self.handlers.get(kind) {
            Some(invoker) => invoker(algorithm, ctx, slice),
            None => Ok(()),
        }
    }

    /// Sends each custom point of `update` to the custom handler, if its type
    /// is registered and the point really is of that type.
    pub fn dispatch_custom(
        &self,
        update: &SecurityUpdate,
        algorithm: &mut A,
        ctx: &mut AlgorithmContext,
    ) -> CallbackResult {
        if !self.handles(&update.kind) {
            return Ok(());
        }
        for data in &update.data {
            if let MarketData::Custom(custom) = data {
                if data.kind() == update.kind {
                    algorithm.on_custom_data(ctx, custom)?;
                }
            }
        }
        Ok(())
    }
}

fn non_empty<T>(
    map: &BTreeMap<Symbol, T>,
    call: impl FnOnce(&BTreeMap<Symbol, T>) -> CallbackResult,
) -> CallbackResult {
    if map.is_empty() {
        return Ok(());
    }
    call(map)
}

/// Everything strategy code can see and act on.
pub struct AlgorithmContext {
    pub id: String,
    pub securities: Securities,
    pub subscriptions: SubscriptionManager,
    pub universes: UniverseManager,
    pub consolidators: ConsolidatorRegistry,
    time: DateTime<Utc>,
    time_zone: Tz,
    live_mode: bool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    warmup_period: Option<Duration>,
    state: Arc<RunState>,
    ports: Collaborators,
}

impl AlgorithmContext {
    pub fn new(
        id: impl Into<String>,
        ports: Collaborators,
        state: Arc<RunState>,
        time_zone: Tz,
        live_mode: bool,
    ) -> Self {
        AlgorithmContext {
            id: id.into(),
            securities: Securities::new(),
            subscriptions: SubscriptionManager::new(),
            universes: UniverseManager::new(),
            consolidators: ConsolidatorRegistry::new(),
            time: DateTime::<Utc>::MIN_UTC,
            time_zone,
            live_mode,
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
            warmup_period: None,
            state,
            ports,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub(crate) fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = time;
    }

    pub fn local_time(&self) -> NaiveDateTime {
        self.time.with_timezone(&self.time_zone).naive_local()
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    pub fn live_mode(&self) -> bool {
        self.live_mode
    }

    pub fn set_start_date(&mut self, start: DateTime<Utc>) {
        self.start = start;
        if self.time < start {
            self.time = start;
        }
    }

    pub fn set_end_date(&mut self, end: DateTime<Utc>) {
        self.end = end;
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end_date(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn status(&self) -> AlgorithmStatus {
        self.state.status()
    }

    /// Asks the loop to stop softly (`Stopped`, `Deleted` or `Liquidated`).
    pub fn set_status(&self, status: AlgorithmStatus) -> bool {
        self.state.request_status(status)
    }

    pub fn is_warming_up(&self) -> bool {
        self.state.is_warming_up()
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub(crate) fn ports(&self) -> &Collaborators {
        &self.ports
    }

    pub fn portfolio(&self) -> &dyn PortfolioPort {
        self.ports.portfolio.as_ref()
    }

    pub fn transactions(&self) -> &dyn TransactionPort {
        self.ports.transactions.as_ref()
    }

    /// Adds a security with the default subscriptions for its type and
    /// makes it a member of the manual universe.
    pub fn add_security(
        &mut self,
        symbol: Symbol,
        resolution: Resolution,
        exchange_hours: ExchangeHours,
    ) {
        let time_zone = exchange_hours.time_zone;
        self.securities
            .try_add(Security::new(symbol.clone(), exchange_hours));
        self.subscriptions.add_defaults(&symbol, resolution, time_zone);
        self.universes.add_member(MANUAL_UNIVERSE, symbol);
    }

    pub fn add_subscription(
        &mut self,
        config: SubscriptionDataConfig,
    ) -> Arc<SubscriptionDataConfig> {
        self.subscriptions.add(config)
    }

    pub fn register_consolidator(
        &mut self,
        symbol: Symbol,
        kind: DataKind,
        consolidator: Box<dyn Consolidator>,
    ) {
        self.consolidators.register(symbol, kind, consolidator);
    }

    pub fn set_warm_up(&mut self, period: Duration) {
        self.warmup_period = Some(period);
    }

    /// One request per subscription, internal feeds included, covering the
    /// warm-up period before the start date.
    pub fn warmup_history_requests(&self) -> Vec<HistoryRequest> {
        let Some(period) = self.warmup_period else {
            return Vec::new();
        };
        let start = self.start.checked_sub_signed(period).unwrap_or(self.start);
        self.subscriptions
            .subscriptions()
            .map(|c| HistoryRequest::from_config(c, start, self.start))
            .collect()
    }

    pub fn holdings(&self, symbol: &Symbol) -> f64 {
        self.ports.portfolio.holdings_quantity(symbol)
    }

    pub fn is_invested(&self, symbol: &Symbol) -> bool {
        self.holdings(symbol) != 0.0
    }

    pub fn submit(&self, request: OrderRequest) -> OrderTicket {
        debug!(
            symbol = %request.symbol,
            quantity = request.quantity,
            tag = %request.tag,
            "order submitted"
        );
        self.ports.transactions.process_request(request)
    }

    pub fn market_order(&self, symbol: &Symbol, quantity: f64, tag: &str) -> OrderTicket {
        self.submit(OrderRequest::market(symbol.clone(), quantity, self.time, tag))
    }

    /// Cancels open orders and flattens every position, or only `symbol`'s.
    pub fn liquidate(&self, symbol: Option<&Symbol>, tag: &str) -> Vec<OrderTicket> {
        let targets: Vec<Symbol> = match symbol {
            Some(s) => vec![s.clone()],
            None => self.ports.portfolio.invested_symbols(),
        };
        let mut tickets = Vec::new();
        for target in targets {
            self.ports.transactions.cancel_open_orders(&target, tag);
            let quantity = self.holdings(&target);
            if quantity != 0.0 {
                tickets.push(self.market_order(&target, -quantity, tag));
            }
        }
        tickets
    }

    pub fn debug(&self, message: &str) {
        debug!(algorithm = %self.id, "{message}");
        self.ports.results.debug_message(message);
    }

    pub fn error(&self, message: &str) {
        self.ports.results.error_message(message);
    }
}
