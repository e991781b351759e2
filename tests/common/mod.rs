#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use slicetrader::adapters::memory_alpha_adapter::MemoryAlphaAdapter;
use slicetrader::adapters::memory_result_adapter::MemoryResultAdapter;
use slicetrader::adapters::scheduled_event_adapter::ScheduledEventAdapter;
use slicetrader::adapters::sim_brokerage::SimulatedBrokerage;
use slicetrader::domain::algorithm::{Algorithm, AlgorithmContext, CallbackResult};
use slicetrader::domain::error::EngineError;
use slicetrader::domain::exchange_hours::ExchangeHours;
use slicetrader::domain::history::{HistoryRequest, HistorySlice};
use slicetrader::domain::market_data::{
    DataKind, Delisting, DelistingType, Dividend, MarketData, Split, SplitType, TradeBar,
};
use slicetrader::domain::order::{OrderRequest, OrderTicket};
use slicetrader::domain::resolution::Resolution;
use slicetrader::domain::status::RunState;
use slicetrader::domain::subscription::{DataNormalizationMode, SubscriptionDataConfig};
use slicetrader::domain::symbol::{SecurityType, Symbol};
use slicetrader::domain::time_limit::{
    AlgorithmTimeLimitManager, ManualTimeProvider, NullTokenBucket, TimeMonitor, TimeProvider,
};
use slicetrader::domain::time_slice::{DataFeedPacket, SecurityChanges, Slice, TimeSlice};
use slicetrader::domain::time_slice_factory;
use slicetrader::ports::history_port::{HistoryIter, HistoryPort};
use slicetrader::ports::portfolio_port::{MarginCallCheck, PortfolioPort};
use slicetrader::ports::Collaborators;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn spy() -> Symbol {
    Symbol::new("SPY", SecurityType::Equity)
}

pub fn trade_bar(symbol: &Symbol, end: DateTime<Utc>, close: f64) -> TradeBar {
    TradeBar {
        symbol: symbol.clone(),
        time: end - Duration::minutes(1),
        period: Duration::minutes(1),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000.0,
        is_fill_forward: false,
    }
}

pub fn bar_config(symbol: &Symbol) -> Arc<SubscriptionDataConfig> {
    Arc::new(SubscriptionDataConfig::new(
        symbol.clone(),
        DataKind::TradeBar,
        Resolution::Minute,
        chrono_tz::America::New_York,
    ))
}

/// A time slice holding one minute bar per `(symbol, close)`.
pub fn bar_slice(time: DateTime<Utc>, bars: &[(&Symbol, f64)]) -> TimeSlice {
    let packets = bars
        .iter()
        .map(|(symbol, close)| {
            let bar = MarketData::TradeBar(trade_bar(symbol, time, *close));
            DataFeedPacket::new(bar_config(symbol), vec![bar])
        })
        .collect();
    time_slice_factory::create(time, packets, None, BTreeMap::new()).unwrap()
}

/// A time slice carrying auxiliary data for `symbol` plus its bar.
pub fn aux_slice(
    time: DateTime<Utc>,
    symbol: &Symbol,
    close: f64,
    aux: Vec<MarketData>,
) -> TimeSlice {
    let mut data = vec![MarketData::TradeBar(trade_bar(symbol, time, close))];
    data.extend(aux);
    let packets = vec![DataFeedPacket::new(bar_config(symbol), data)];
    time_slice_factory::create(time, packets, None, BTreeMap::new()).unwrap()
}

pub fn split(
    symbol: &Symbol,
    time: DateTime<Utc>,
    factor: f64,
    split_type: SplitType,
) -> MarketData {
    MarketData::Split(Split {
        symbol: symbol.clone(),
        time,
        split_factor: factor,
        reference_price: 100.0,
        split_type,
    })
}

pub fn dividend(symbol: &Symbol, time: DateTime<Utc>, distribution: f64) -> MarketData {
    MarketData::Dividend(Dividend {
        symbol: symbol.clone(),
        time,
        distribution,
        reference_price: 100.0,
    })
}

pub fn delisting(
    symbol: &Symbol,
    time: DateTime<Utc>,
    delisting_type: DelistingType,
) -> MarketData {
    MarketData::Delisting(Delisting {
        symbol: symbol.clone(),
        time,
        delisting_type,
        price: 100.0,
    })
}

/// History port serving canned slices regardless of the request.
#[derive(Default)]
pub struct MockHistoryPort {
    pub slices: Vec<HistorySlice>,
    pub requests: Mutex<Vec<HistoryRequest>>,
}

impl MockHistoryPort {
    pub fn with_slices(slices: Vec<HistorySlice>) -> Self {
        MockHistoryPort {
            slices,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl HistoryPort for MockHistoryPort {
    fn get_history(
        &self,
        requests: &[HistoryRequest],
        _time_zone: chrono_tz::Tz,
    ) -> Result<HistoryIter, EngineError> {
        self.requests.lock().extend_from_slice(requests);
        Ok(Box::new(self.slices.clone().into_iter()))
    }
}

/// Portfolio delegating to a simulated brokerage, with injectable faults.
pub struct FaultyPortfolio {
    pub inner: Arc<SimulatedBrokerage>,
    pub fail_splits: bool,
    pub margin_orders: Mutex<Vec<OrderRequest>>,
    pub margin_checks: AtomicUsize,
}

impl FaultyPortfolio {
    pub fn new(inner: Arc<SimulatedBrokerage>) -> Self {
        FaultyPortfolio {
            inner,
            fail_splits: false,
            margin_orders: Mutex::new(Vec::new()),
            margin_checks: AtomicUsize::new(0),
        }
    }

    pub fn margin_check_count(&self) -> usize {
        self.margin_checks.load(Ordering::SeqCst)
    }
}

impl PortfolioPort for FaultyPortfolio {
    fn total_portfolio_value(&self) -> f64 {
        self.inner.total_portfolio_value()
    }

    fn invalidate_total_portfolio_value(&self) {
        self.inner.invalidate_total_portfolio_value()
    }

    fn cash(&self) -> f64 {
        self.inner.cash()
    }

    fn holdings_quantity(&self, symbol: &Symbol) -> f64 {
        self.inner.holdings_quantity(symbol)
    }

    fn invested_symbols(&self) -> Vec<Symbol> {
        self.inner.invested_symbols()
    }

    fn update_market_price(&self, symbol: &Symbol, price: f64) {
        self.inner.update_market_price(symbol, price)
    }

    fn update_conversion_rate(&self, symbol: &Symbol, rate: f64) {
        self.inner.update_conversion_rate(symbol, rate)
    }

    fn margin_call_orders(&self) -> MarginCallCheck {
        self.margin_checks.fetch_add(1, Ordering::SeqCst);
        let orders = std::mem::take(&mut *self.margin_orders.lock());
        if orders.is_empty() {
            return self.inner.margin_call_orders();
        }
        MarginCallCheck {
            orders,
            issue_warning: false,
        }
    }

    fn execute_margin_call(&self, orders: &[OrderRequest]) -> anyhow::Result<Vec<OrderTicket>> {
        self.inner.execute_margin_call(orders)
    }

    fn apply_dividend(
        &self,
        dividend: &Dividend,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()> {
        self.inner.apply_dividend(dividend, live_mode, mode)
    }

    fn apply_split(
        &self,
        split: &Split,
        live_mode: bool,
        mode: DataNormalizationMode,
    ) -> anyhow::Result<()> {
        if self.fail_splits {
            anyhow::bail!("split book unavailable for {}", split.symbol);
        }
        self.inner.apply_split(split, live_mode, mode)
    }

    fn scan_for_cash_settlement(&self, time: DateTime<Utc>) {
        self.inner.scan_for_cash_settlement(time)
    }
}

/// Every collaborator of one test run, wired to in-memory adapters.
pub struct Harness {
    pub brokerage: Arc<SimulatedBrokerage>,
    pub portfolio: Arc<FaultyPortfolio>,
    pub results: Arc<MemoryResultAdapter>,
    pub realtime: Arc<ScheduledEventAdapter>,
    pub history: Arc<MockHistoryPort>,
    pub state: Arc<RunState>,
    pub clock: Arc<ManualTimeProvider>,
    pub time_limit: Arc<AlgorithmTimeLimitManager>,
}

pub struct HarnessBuilder {
    cash: f64,
    fail_splits: bool,
    history: Vec<HistorySlice>,
    time_loop_maximum: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        HarnessBuilder {
            cash: 100_000.0,
            fail_splits: false,
            history: Vec::new(),
            time_loop_maximum: Duration::minutes(20),
        }
    }

    pub fn cash(mut self, cash: f64) -> Self {
        self.cash = cash;
        self
    }

    pub fn failing_splits(mut self) -> Self {
        self.fail_splits = true;
        self
    }

    pub fn history(mut self, slices: Vec<HistorySlice>) -> Self {
        self.history = slices;
        self
    }

    pub fn time_loop_maximum(mut self, maximum: Duration) -> Self {
        self.time_loop_maximum = maximum;
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualTimeProvider::new(utc(2024, 3, 4, 12, 0)));
        let time_provider: Arc<dyn TimeProvider> = clock.clone();
        let time_limit = Arc::new(AlgorithmTimeLimitManager::new(
            Arc::new(NullTokenBucket),
            self.time_loop_maximum,
            Arc::clone(&time_provider),
        ));
        let brokerage = Arc::new(SimulatedBrokerage::new(self.cash));
        let mut portfolio = FaultyPortfolio::new(Arc::clone(&brokerage));
        portfolio.fail_splits = self.fail_splits;
        let portfolio = Arc::new(portfolio);
        let results = Arc::new(MemoryResultAdapter::new(portfolio.clone(), Duration::days(1)));
        let realtime = Arc::new(ScheduledEventAdapter::new(
            time_limit.clone(),
            time_provider,
            TimeMonitor::manual(),
        ));
        Harness {
            brokerage,
            portfolio,
            results,
            realtime,
            history: Arc::new(MockHistoryPort::with_slices(self.history)),
            state: Arc::new(RunState::new()),
            clock,
            time_limit,
        }
    }
}

impl Harness {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            history: self.history.clone(),
            transactions: self.brokerage.clone(),
            portfolio: self.portfolio.clone(),
            realtime: self.realtime.clone(),
            results: self.results.clone(),
            alpha: Arc::new(MemoryAlphaAdapter::new()),
        }
    }

    /// A context with `symbols` added as New York equities at minute resolution.
    pub fn context(&self, symbols: &[Symbol], live_mode: bool) -> AlgorithmContext {
        let mut ctx = AlgorithmContext::new(
            "test",
            self.collaborators(),
            Arc::clone(&self.state),
            chrono_tz::America::New_York,
            live_mode,
        );
        for symbol in symbols {
            ctx.add_security(symbol.clone(), Resolution::Minute, ExchangeHours::us_equity());
        }
        ctx
    }
}

pub type BarHook =
    Box<dyn FnMut(&mut AlgorithmContext, &BTreeMap<Symbol, TradeBar>) -> CallbackResult>;

/// Strategy recording the callbacks it receives in order.
#[derive(Default)]
pub struct ScriptedAlgorithm {
    pub calls: Vec<String>,
    pub on_bars: Option<BarHook>,
    pub fail_on_data_at: Option<DateTime<Utc>>,
    pub stop_after: Option<usize>,
    pub margin_calls: usize,
    pub margin_warnings: usize,
    pub slice_times: Vec<DateTime<Utc>>,
    pub warming_up_at: Vec<bool>,
}

impl ScriptedAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.iter().any(|c| c == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.calls.iter().position(|c| c == name)
    }
}

impl Algorithm for ScriptedAlgorithm {
    fn handled_data(&self) -> Vec<DataKind> {
        vec![DataKind::TradeBar, DataKind::Dividend, DataKind::Split, DataKind::Delisting]
    }

    fn on_data(&mut self, ctx: &mut AlgorithmContext, slice: &Slice) -> CallbackResult {
        self.calls.push("on_data".into());
        self.slice_times.push(slice.time);
        self.warming_up_at.push(ctx.is_warming_up());
        if self.fail_on_data_at == Some(slice.time) {
            anyhow::bail!("strategy blew up");
        }
        if let Some(limit) = self.stop_after {
            if self.slice_times.len() >= limit {
                ctx.set_status(slicetrader::domain::status::AlgorithmStatus::Stopped);
            }
        }
        Ok(())
    }

    fn on_trade_bars(
        &mut self,
        ctx: &mut AlgorithmContext,
        bars: &BTreeMap<Symbol, TradeBar>,
    ) -> CallbackResult {
        self.calls.push("on_trade_bars".into());
        match self.on_bars.as_mut() {
            Some(hook) => hook(ctx, bars),
            None => Ok(()),
        }
    }

    fn on_dividends(
        &mut self,
        _ctx: &mut AlgorithmContext,
        _dividends: &BTreeMap<Symbol, Dividend>,
    ) -> CallbackResult {
        self.calls.push("on_dividends".into());
        Ok(())
    }

    fn on_splits(
        &mut self,
        _ctx: &mut AlgorithmContext,
        _splits: &BTreeMap<Symbol, Split>,
    ) -> CallbackResult {
        self.calls.push("on_splits".into());
        Ok(())
    }

    fn on_delistings(
        &mut self,
        _ctx: &mut AlgorithmContext,
        _delistings: &BTreeMap<Symbol, Delisting>,
    ) -> CallbackResult {
        self.calls.push("on_delistings".into());
        Ok(())
    }

    fn on_securities_changed(
        &mut self,
        _ctx: &mut AlgorithmContext,
        _changes: &SecurityChanges,
    ) -> CallbackResult {
        self.calls.push("on_securities_changed".into());
        Ok(())
    }

    fn on_margin_call(
        &mut self,
        _ctx: &mut AlgorithmContext,
        _requests: &mut Vec<OrderRequest>,
    ) -> CallbackResult {
        self.margin_calls += 1;
        self.calls.push("on_margin_call".into());
        Ok(())
    }

    fn on_margin_call_warning(&mut self, _ctx: &mut AlgorithmContext) -> CallbackResult {
        self.margin_warnings += 1;
        Ok(())
    }

    fn on_end_of_time_step(&mut self, _ctx: &mut AlgorithmContext) -> CallbackResult {
        self.calls.push("on_end_of_time_step".into());
        Ok(())
    }

    fn on_end_of_algorithm(&mut self, _ctx: &mut AlgorithmContext) -> CallbackResult {
        self.calls.push("on_end_of_algorithm".into());
        Ok(())
    }
}
