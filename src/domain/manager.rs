//! The algorithm loop: one iteration per time slice, in a fixed step order.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::algorithm::{Algorithm, AlgorithmContext, DispatchTable};
use super::error::EngineError;
use super::market_data::{
    market_on_close_buffer, DataKind, Delisting, DelistingType, Split, SplitType,
};
use super::order::OrderRequest;
use super::phase::Phase;
use super::resolution::round_down_in_time_zone;
use super::status::{AlgorithmStatus, RunState};
use super::subscription::DataNormalizationMode;
use super::symbol::Symbol;
use super::time_limit::{AlgorithmTimeLimitManager, IsolatorLimitResultProvider, TimeProvider};
use super::time_slice::TimeSlice;

/// How a call to [`AlgorithmManager::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The stream ended or a soft stop was requested; finalization ran.
    Completed,
    /// The cancellation token tripped. Nothing was finalized.
    Cancelled,
    /// A fatal error was recorded on the run state. Nothing was finalized.
    Failed,
}

/// Marker for a step that recorded a fatal error and must end the run.
#[derive(Debug)]
struct Abort;

enum Flow {
    Continue,
    Break,
}

/// Runs `step`; on failure stores the error as the run-time error, flips the
/// status to `RuntimeError` and logs it against `phase`.
fn guarded<T>(
    state: &RunState,
    phase: Phase,
    step: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, Abort> {
    step().map_err(|source| {
        error!(phase = %phase, error = %format!("{source:#}"), "runtime error");
        state.fail(EngineError::callback(phase, source));
        Abort
    })
}

pub struct AlgorithmManager {
    state: Arc<RunState>,
    time_limit: Arc<AlgorithmTimeLimitManager>,
    time_provider: Arc<dyn TimeProvider>,
    live_mode: bool,
    margin_call_frequency: Duration,
    settlement_scan_frequency: Duration,
    next_margin_call_time: DateTime<Utc>,
    next_settlement_scan_time: DateTime<Utc>,
    delistings: Vec<Delisting>,
    split_warnings: Vec<Split>,
    data_points: u64,
}

impl AlgorithmManager {
    pub fn new(
        state: Arc<RunState>,
        time_limit: Arc<AlgorithmTimeLimitManager>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        AlgorithmManager {
            state,
            time_limit,
            time_provider,
            live_mode: false,
            margin_call_frequency: Duration::minutes(5),
            settlement_scan_frequency: Duration::minutes(30),
            next_margin_call_time: DateTime::<Utc>::MIN_UTC,
            next_settlement_scan_time: DateTime::<Utc>::MIN_UTC,
            delistings: Vec::new(),
            split_warnings: Vec::new(),
            data_points: 0,
        }
    }

    pub fn with_margin_call_frequency(mut self, frequency: Duration) -> Self {
        self.margin_call_frequency = frequency;
        self
    }

    pub fn with_settlement_scan_frequency(mut self, frequency: Duration) -> Self {
        self.settlement_scan_frequency = frequency;
        self
    }

    /// Data points consumed so far.
    pub fn data_points(&self) -> u64 {
        self.data_points
    }

    pub fn state(&self) -> AlgorithmStatus {
        self.state.status()
    }

    pub fn quit_state(&self) -> bool {
        self.state() == AlgorithmStatus::Deleted
    }

    pub fn time_limit(&self) -> &Arc<AlgorithmTimeLimitManager> {
        &self.time_limit
    }

    /// Delistings waiting for their liquidation time.
    pub fn pending_delistings(&self) -> &[Delisting] {
        &self.delistings
    }

    pub fn pending_split_warnings(&self) -> &[Split] {
        &self.split_warnings
    }

    /// Consumes `stream` until it ends, a soft stop is requested, `cancel`
    /// trips or a step fails.
    ///
    /// After a `Failed` outcome the error is on the run state; callers must
    /// check it as well as [`state`](Self::state).
    pub fn run<A, S>(
        &mut self,
        algorithm: &mut A,
        ctx: &mut AlgorithmContext,
        stream: S,
        cancel: &CancellationToken,
    ) -> RunOutcome
    where
        A: Algorithm,
        S: IntoIterator<Item = TimeSlice>,
    {
        self.live_mode = ctx.live_mode();
        let table = DispatchTable::build(algorithm);
        let mut time = ctx.time();

        info!(
            algorithm = %ctx.id,
            start = %ctx.start_date(),
            end = %ctx.end_date(),
            live = self.live_mode,
            "begin data stream"
        );

        for time_slice in stream {
            self.time_limit.start_new_time_step();

            let status = self.state.status();
            if status != AlgorithmStatus::Running {
                warn!(%status, time = %time_slice.time, "algorithm state changed");
                break;
            }

            if cancel.is_cancelled() {
                error!(time = %time_slice.time, "cancellation requested");
                return RunOutcome::Cancelled;
            }

            time = time_slice.time;
            self.data_points += time_slice.data_point_count as u64;

            match self.process_slice(algorithm, ctx, &table, &time_slice) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Break) => break,
                Err(Abort) => return RunOutcome::Failed,
            }

            let limit = self.time_limit.is_within_limit();
            if !limit.is_within_custom_limits() {
                error!(
                    phase = %Phase::EndOfTimeStep,
                    elapsed_ms = limit.current_time_step_elapsed.num_milliseconds(),
                    "{}",
                    limit.error_message
                );
                self.state.fail(EngineError::TimeLimitExceeded(limit.error_message));
                return RunOutcome::Failed;
            }
        }

        if self.state.has_run_time_error() {
            error!(
                error = %self.state.run_time_error_message().unwrap_or_default(),
                "data stream failed"
            );
            return RunOutcome::Failed;
        }

        self.finalize(algorithm, ctx, time)
    }

    fn process_slice<A: Algorithm>(
        &mut self,
        algorithm: &mut A,
        ctx: &mut AlgorithmContext,
        table: &DispatchTable<A>,
        time_slice: &TimeSlice,
    ) -> Result<Flow, Abort> {
        let state = Arc::clone(&self.state);
        let time = time_slice.time;
        let slice = &time_slice.slice;
        let ports = ctx.ports().clone();

        // sampled before anything else so data-free days still get a point
        ports.results.sample(time, false);

        if !self.live_mode {
            if ports.portfolio.total_portfolio_value() <= 0.0 {
                let message = "Portfolio value is less than or equal to zero, stopping algorithm.";
                error!(phase = %Phase::SolvencyGuard, time = %time, "{message}");
                ports.results.debug_message(message);
                return Ok(Flow::Break);
            }
            guarded(&state, Phase::ScanPastEvents, || ports.realtime.scan_past_events(time))?;
        }

        ctx.set_time(time);
        if time_slice.is_time_pulse {
            return Ok(Flow::Continue);
        }

        if !slice.symbol_changed_events.is_empty() {
            guarded(&state, Phase::SymbolChanges, || {
                table.dispatch(&DataKind::SymbolChangedEvent, algorithm, ctx, slice)
            })?;
            for symbol in slice.symbol_changed_events.keys() {
                ports
                    .transactions
                    .cancel_open_orders(symbol, "Open order cancelled on symbol changed event");
            }
        }

        if let Some(changes) = &time_slice.security_changes {
            for added in &changes.added {
                let symbol = added.security.symbol.clone();
                ctx.securities.try_add(added.security.clone());
                if let Some(security) = ctx.securities.get_mut(&symbol) {
                    security.is_tradable = true;
                }
                ctx.universes.add_member(&added.universe, symbol);
            }
            for removed in &changes.removed {
                ctx.universes.remove_member(&removed.universe, &removed.symbol);
                if !ctx.universes.is_active(&removed.symbol) {
                    if let Some(security) = ctx.securities.get_mut(&removed.symbol) {
                        security.is_tradable = false;
                    }
                }
            }
            ports.realtime.on_securities_changed(changes);
            ports.results.on_securities_changed(changes);
        }

        for update in &time_slice.securities_update {
            let Some(security) = ctx.securities.get_mut(&update.symbol) else {
                trace!(symbol = %update.symbol, "update for unknown security dropped");
                continue;
            };
            security.update(&update.data, &update.kind, update.contains_fill_forward);
            let price = security.price();
            ports.portfolio.update_market_price(&update.symbol, price);
            if !update.is_internal_config {
                ports.results.set_market_price(&update.symbol, price);
            }
        }

        for data in time_slice.universe_data.values().flatten() {
            if let Some(security) = ctx.securities.get_mut(data.symbol()) {
                security.cache.store_data(vec![data.clone()], &data.kind());
            }
        }

        for update in &time_slice.cash_book_update {
            if let Some(security) = ctx.securities.get(&update.symbol) {
                ports.portfolio.update_conversion_rate(&update.symbol, security.price());
            }
        }
        ports.portfolio.invalidate_total_portfolio_value();

        guarded(&state, Phase::ScheduledEvents, || ports.realtime.set_time(time))?;

        guarded(&state, Phase::PreUserOrderProcessing, || {
            ports.transactions.process_synchronous_events()
        })?;

        self.process_delisted_symbols(ctx);

        guarded(&state, Phase::SplitLiquidation, || self.process_split_symbols(ctx))?;

        if state.status() == AlgorithmStatus::Stopped {
            info!("algorithm quit requested");
            return Ok(Flow::Break);
        }
        if state.has_run_time_error() {
            state.transition(AlgorithmStatus::RuntimeError);
            error!(
                phase = %Phase::ExternalStatus,
                time = %time,
                error = %state.run_time_error_message().unwrap_or_default(),
                "algorithm encountered a runtime error"
            );
            return Err(Abort);
        }

        let now = self.time_provider.now();
        if time >= self.next_margin_call_time
            || (self.live_mode && self.next_margin_call_time > now)
        {
            let check = ports.portfolio.margin_call_orders();
            if !check.orders.is_empty() {
                let mut orders = check.orders;
                guarded(&state, Phase::MarginCall, || algorithm.on_margin_call(ctx, &mut orders))?;
                let tickets = guarded(&state, Phase::MarginCallExecution, || {
                    ports.portfolio.execute_margin_call(&orders)
                })?;
                for ticket in tickets {
                    ctx.error(&format!("Executed MarginCallOrder: {ticket}"));
                }
            } else if check.issue_warning {
                guarded(&state, Phase::MarginCallWarning, || {
                    algorithm.on_margin_call_warning(ctx)
                })?;
            }
            self.next_margin_call_time = time + self.margin_call_frequency;
        }

        if time >= self.next_settlement_scan_time
            || (self.live_mode && self.next_settlement_scan_time > now)
        {
            ports.portfolio.scan_for_cash_settlement(time);
            self.next_settlement_scan_time = time + self.settlement_scan_frequency;
        }

        if let Some(changes) = &time_slice.security_changes {
            guarded(&state, Phase::SecuritiesChanged, || {
                algorithm.on_securities_changed(ctx, changes)?;
                algorithm.on_framework_securities_changed(ctx, changes)
            })?;
        }

        for dividend in slice.dividends.values() {
            debug!(
                time = %time,
                symbol = %dividend.symbol,
                distribution = dividend.distribution,
                "applying dividend"
            );
            let mode = normalization_mode(ctx, &dividend.symbol);
            self.trace_live(ctx, &dividend.symbol, "pre-dividend");
            guarded(&state, Phase::DividendApplication, || {
                ports.portfolio.apply_dividend(dividend, self.live_mode, mode)
            })?;
            self.trace_live(ctx, &dividend.symbol, "post-dividend");
        }

        for split in slice.splits.values() {
            if split.split_type != SplitType::SplitOccurred {
                continue;
            }
            debug!(time = %time, symbol = %split.symbol, "applying split");
            let mode = normalization_mode(ctx, &split.symbol);
            self.trace_live(ctx, &split.symbol, "pre-split");
            guarded(&state, Phase::SplitApplication, || {
                ports.portfolio.apply_split(split, self.live_mode, mode)
            })?;
            self.trace_live(ctx, &split.symbol, "post-split");
            if self.live_mode || mode == DataNormalizationMode::Raw {
                ports.transactions.apply_split(split);
            }
        }

        if !time_slice.consolidator_update.is_empty() {
            guarded(&state, Phase::Consolidators, || {
                for update in &time_slice.consolidator_update {
                    let config = &update.config;
                    let Some(consolidators) =
                        ctx.consolidators.for_subscription(&config.symbol, &config.kind)
                    else {
                        continue;
                    };
                    for consolidator in consolidators.iter_mut() {
                        for data in &update.data {
                            if config.end_time_is_in_native_resolution(data.end_time()) {
                                consolidator.update(data)?;
                            }
                        }
                        consolidator.scan(time)?;
                    }
                }
                Ok(())
            })?;
        }

        for update in &time_slice.custom_data {
            guarded(&state, Phase::CustomData, || table.dispatch_custom(update, algorithm, ctx))?;
        }

        guarded(&state, Phase::CorporateActionEvents, || {
            for kind in [DataKind::Dividend, DataKind::Split, DataKind::Delisting] {
                table.dispatch(&kind, algorithm, ctx, slice)?;
            }
            Ok(())
        })?;

        self.handle_delisted_symbols(ctx, &slice.delistings);
        self.handle_split_symbols(ctx, &slice.splits);

        guarded(&state, Phase::PriceData, || {
            for kind in [
                DataKind::TradeBar,
                DataKind::QuoteBar,
                DataKind::OptionChain,
                DataKind::Tick,
            ] {
                table.dispatch(&kind, algorithm, ctx, slice)?;
            }
            Ok(())
        })?;

        guarded(&state, Phase::Slice, || {
            if slice.has_data() {
                algorithm.on_data(ctx, slice)?;
            }
            algorithm.on_framework_data(ctx, slice)
        })?;

        guarded(&state, Phase::PostUserOrderProcessing, || {
            ports.transactions.process_synchronous_events()
        })?;

        guarded(&state, Phase::AlphaProcessing, || ports.alpha.process_synchronous_events())?;
        ports.results.set_alpha_runtime_statistics(&ports.alpha.runtime_statistics());

        ports.results.process_synchronous_events(false);

        guarded(&state, Phase::EndOfTimeStep, || algorithm.on_end_of_time_step(ctx))?;

        Ok(Flow::Continue)
    }

    fn finalize<A: Algorithm>(
        &mut self,
        algorithm: &mut A,
        ctx: &mut AlgorithmContext,
        time: DateTime<Utc>,
    ) -> RunOutcome {
        let state = Arc::clone(&self.state);
        let ports = ctx.ports().clone();
        self.time_limit.stop_enforcing_time_limit();

        info!("firing on end of algorithm");
        if guarded(&state, Phase::EndOfAlgorithm, || algorithm.on_end_of_algorithm(ctx)).is_err() {
            return RunOutcome::Failed;
        }

        if let Err(e) = ports.alpha.process_synchronous_events() {
            warn!(
                phase = %Phase::Finalization,
                error = %format!("{e:#}"),
                "final alpha processing failed"
            );
        }
        ports.results.set_alpha_runtime_statistics(&ports.alpha.runtime_statistics());
        ports.results.process_synchronous_events(true);

        match state.status() {
            AlgorithmStatus::Liquidated if self.live_mode => {
                info!("liquidating algorithm holdings");
                ctx.liquidate(None, "Liquidated");
                ports.results.debug_message("Algorithm Liquidated");
                ports.results.send_status_update(AlgorithmStatus::Liquidated, None);
            }
            AlgorithmStatus::Stopped => {
                info!("stopping algorithm");
                ports.results.debug_message("Algorithm Stopped");
                ports.results.send_status_update(AlgorithmStatus::Stopped, None);
            }
            AlgorithmStatus::Deleted => {
                info!("deleting algorithm");
                ports
                    .results
                    .debug_message(&format!("Algorithm Id:({}) Deleted by request.", ctx.id));
                ports.results.send_status_update(AlgorithmStatus::Deleted, None);
            }
            _ => {}
        }

        ports.results.send_status_update(AlgorithmStatus::Completed, None);
        state.transition(AlgorithmStatus::Completed);
        ports.results.sample(time, true);
        RunOutcome::Completed
    }

    fn trace_live(&self, ctx: &AlgorithmContext, symbol: &Symbol, stage: &str) {
        if !self.live_mode {
            return;
        }
        if let Some(security) = ctx.securities.get(symbol) {
            info!(
                time = %ctx.time(),
                symbol = %symbol,
                price = security.price(),
                holdings = ctx.holdings(symbol),
                cash = ctx.portfolio().cash(),
                "{stage}"
            );
        }
    }

    /// Liquidates (or exercises) held positions whose delisting liquidation
    /// time has arrived. A security that is the underlying of another pending,
    /// still invested delisting waits for that one to go first.
    fn process_delisted_symbols(&mut self, ctx: &mut AlgorithmContext) {
        let time = ctx.time();
        for i in (0..self.delistings.len()).rev() {
            let symbol = self.delistings[i].symbol.clone();
            let Some(security) = ctx.securities.get(&symbol) else {
                continue;
            };
            let quantity = ctx.holdings(&symbol);
            if quantity == 0.0 {
                continue;
            }
            if time < self.delistings[i].liquidation_time(&security.exchange_hours) {
                continue;
            }
            if self
                .delistings
                .iter()
                .any(|d| d.symbol.underlying() == Some(&symbol) && ctx.is_invested(&d.symbol))
            {
                continue;
            }

            let request = if symbol.security_type.is_option() {
                OrderRequest::exercise(symbol.clone(), -quantity, time, "Option Expired")
            } else {
                OrderRequest::market(symbol.clone(), -quantity, time, "Liquidate from delisting")
            };
            self.delistings.remove(i);
            ctx.submit(request);
            if let Some(security) = ctx.securities.get_mut(&symbol) {
                security.is_tradable = false;
            }
        }
    }

    /// Liquidates option positions on a splitting underlying with a
    /// market-on-close order once the latest submission time is reached.
    fn process_split_symbols(&mut self, ctx: &mut AlgorithmContext) -> anyhow::Result<()> {
        let time = ctx.time();
        for i in (0..self.split_warnings.len()).rev() {
            let symbol = self.split_warnings[i].symbol.clone();
            let Some(security) = ctx.securities.get(&symbol) else {
                self.split_warnings.remove(i);
                continue;
            };

            if !security.is_tradable && !ctx.universes.is_active(&symbol) {
                debug!(time = %time, symbol = %symbol, "removing split warning");
                self.split_warnings.remove(i);
                continue;
            }

            let hours = security.exchange_hours.clone();
            let resolution = ctx.subscriptions.highest_resolution(&symbol).ok_or_else(|| {
                anyhow::anyhow!(
                    "no subscriptions found for {symbol}, is tradable: {}, active: {}",
                    security.is_tradable,
                    ctx.universes.is_active(&symbol)
                )
            })?;
            let next_close = hours.next_market_close(time);
            let cutoff = round_down_in_time_zone(
                next_close - market_on_close_buffer(),
                resolution.to_duration(),
                hours.time_zone,
            );
            if time < cutoff {
                continue;
            }

            let derivatives: Vec<Symbol> = ctx
                .securities
                .iter()
                .map(|(s, _)| s)
                .filter(|s| {
                    s.security_type.is_option()
                        && s.underlying() == Some(&symbol)
                        && !symbol.is_canonical()
                        && ctx.is_invested(s)
                })
                .cloned()
                .collect();

            let today = hours.local_time(time).date();
            for option in derivatives {
                if self
                    .delistings
                    .iter()
                    .any(|d| d.symbol == option && hours.local_time(d.time).date() == today)
                {
                    continue;
                }
                ctx.transactions().cancel_open_orders(
                    &option,
                    "Canceled due to impending split. \
                     Separate MarketOnClose order submitted to liquidate position.",
                );
                let quantity = ctx.holdings(&option);
                ctx.submit(OrderRequest::market_on_close(
                    option.clone(),
                    -quantity,
                    time,
                    "Liquidated due to impending split. Option splits are not currently supported.",
                ));
                if let Some(contract) = ctx.securities.get_mut(&option) {
                    contract.is_tradable = false;
                }
                ctx.debug(&format!(
                    "MarketOnClose order submitted for option contract '{option}' \
                     due to impending {} split event. \
                     Option splits are not currently supported.",
                    symbol.value
                ));
            }
            self.split_warnings.remove(i);
        }
        Ok(())
    }

    /// Records delisting warnings and retires securities on the delisted event.
    fn handle_delisted_symbols(
        &mut self,
        ctx: &mut AlgorithmContext,
        delistings: &BTreeMap<Symbol, Delisting>,
    ) {
        for delisting in delistings.values() {
            trace!(
                kind = ?delisting.delisting_type,
                symbol = %delisting.symbol,
                time = %ctx.time(),
                delisting_time = %delisting.time,
                "delisting"
            );
            // live trading leaves exercise, liquidation and cancels to the brokerage
            if self.live_mode {
                continue;
            }
            match delisting.delisting_type {
                DelistingType::Warning => {
                    if !self.delistings.iter().any(|d| d.symbol == delisting.symbol) {
                        self.delistings.push(delisting.clone());
                    }
                }
                DelistingType::Delisted => {
                    if let Some(security) = ctx.securities.get_mut(&delisting.symbol) {
                        security.is_tradable = false;
                        security.is_delisted = true;
                    }
                    ctx.universes.remove_from_all(&delisting.symbol);
                    let cancelled =
                        ctx.transactions().cancel_open_orders(&delisting.symbol, "Delisted");
                    for ticket in cancelled {
                        trace!(
                            order = ticket.id,
                            symbol = %ticket.symbol,
                            "cancelled on delisting"
                        );
                    }
                }
            }
        }
    }

    fn handle_split_symbols(&mut self, ctx: &AlgorithmContext, splits: &BTreeMap<Symbol, Split>) {
        for split in splits.values() {
            if split.split_type != SplitType::Warning {
                trace!(
                    time = %ctx.time(),
                    split = %split,
                    reference_price = split.reference_price,
                    "split occurred"
                );
                continue;
            }
            trace!(time = %ctx.time(), split = %split, "split warning");
            if !self
                .split_warnings
                .iter()
                .any(|w| w.symbol == split.symbol && w.split_type == SplitType::Warning)
            {
                self.split_warnings.push(split.clone());
            }
        }
    }
}

fn normalization_mode(ctx: &AlgorithmContext, symbol: &Symbol) -> DataNormalizationMode {
    ctx.subscriptions
        .for_symbol(symbol)
        .next()
        .map_or(DataNormalizationMode::Adjusted, |c| c.normalization_mode)
}
