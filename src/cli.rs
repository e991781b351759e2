//! CLI definition and dispatch.

use chrono::Duration;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_alpha_adapter::MemoryAlphaAdapter;
use crate::adapters::memory_result_adapter::MemoryResultAdapter;
use crate::adapters::scheduled_event_adapter::ScheduledEventAdapter;
use crate::adapters::sim_brokerage::SimulatedBrokerage;
use crate::domain::algorithm::{Algorithm, AlgorithmContext, CallbackResult};
use crate::domain::config::EngineConfig;
use crate::domain::error::EngineError;
use crate::domain::exchange_hours::ExchangeHours;
use crate::domain::manager::{AlgorithmManager, RunOutcome};
use crate::domain::market_data::{DataKind, TradeBar};
use crate::domain::phase::Phase;
use crate::domain::resolution::Resolution;
use crate::domain::status::{AlgorithmStatus, RunState};
use crate::domain::symbol::{SecurityType, Symbol};
use crate::domain::synchronizer::{AlgorithmStream, Producer, Synchronizer};
use crate::domain::time_limit::{RealTimeProvider, TimeMonitor, TimeProvider};
use crate::ports::Collaborators;

#[derive(Parser, Debug)]
#[command(name = "slicetrader", about = "Event-driven trading engine")]
pub struct Cli {
    /// Log filter, e.g. `debug` or `slicetrader=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a buy-and-hold backtest over CSV bars
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate an engine configuration
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List symbols available in the data directory
    ListSymbols {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Installs the stderr subscriber. `level` wins over `RUST_LOG`, which wins
/// over the `info` default.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run { config } => run_backtest(&config),
        Command::Validate { config } => run_validate(&config),
        Command::ListSymbols { config } => run_list_symbols(&config),
    }
}

pub fn load_config(path: &PathBuf) -> Result<EngineConfig, ExitCode> {
    FileConfigAdapter::from_file(path)
        .and_then(|adapter| EngineConfig::from_port(&adapter))
        .map_err(|e| {
            eprintln!("error: {e}");
            ExitCode::from(&e)
        })
}

fn run_backtest(config_path: &PathBuf) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    match execute(&config) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

fn run_validate(config_path: &PathBuf) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    eprintln!("Configuration is valid:");
    eprintln!("  Algorithm:    {}", config.algorithm.id);
    eprintln!(
        "  Period:       {} to {} ({})",
        config.algorithm.start, config.algorithm.end, config.algorithm.time_zone
    );
    eprintln!("  Symbols:      {}", config.data.symbols.join(", "));
    eprintln!("  Resolution:   {}", config.data.resolution);
    eprintln!("  Live mode:    {}", config.live_mode);
    ExitCode::SUCCESS
}

fn run_list_symbols(config_path: &PathBuf) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    match CsvAdapter::new(config.data.directory.clone()).list_symbols() {
        Ok(symbols) => {
            for symbol in &symbols {
                println!("{symbol}");
            }
            eprintln!("{} symbols in {}", symbols.len(), config.data.directory.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// What a finished run reports back to the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub status: AlgorithmStatus,
    pub data_points: u64,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub cash: f64,
    pub fills: usize,
    pub samples: usize,
    pub holdings: BTreeMap<Symbol, f64>,
}

impl RunSummary {
    pub fn total_return(&self) -> f64 {
        if self.initial_equity == 0.0 {
            return 0.0;
        }
        self.final_equity / self.initial_equity - 1.0
    }
}

fn print_summary(summary: &RunSummary) {
    eprintln!("\n=== Run Summary ===");
    eprintln!("Status:           {}", summary.status);
    eprintln!("Data Points:      {}", summary.data_points);
    eprintln!("Initial Equity:   {:.2}", summary.initial_equity);
    eprintln!("Final Equity:     {:.2}", summary.final_equity);
    eprintln!("Total Return:     {:.2}%", summary.total_return() * 100.0);
    eprintln!("Cash:             {:.2}", summary.cash);
    eprintln!("Fills:            {}", summary.fills);
    eprintln!("Equity Samples:   {}", summary.samples);
    for (symbol, quantity) in &summary.holdings {
        eprintln!("  {symbol}: {quantity}");
    }
}

/// Runs [`BuyAndHold`] over the configured CSV data and returns the summary.
///
/// A run that ends on a fatal error returns that error.
pub fn execute(config: &EngineConfig) -> Result<RunSummary, EngineError> {
    let time_provider: Arc<dyn TimeProvider> = Arc::new(RealTimeProvider);
    let time_limit = Arc::new(config.time_limit_manager(Arc::clone(&time_provider)));
    let state = Arc::new(RunState::new());

    let brokerage = Arc::new(SimulatedBrokerage::new(config.algorithm.initial_cash));
    let history = Arc::new(CsvAdapter::new(config.data.directory.clone()));
    let results = Arc::new(MemoryResultAdapter::new(brokerage.clone(), Duration::days(1)));
    let realtime = Arc::new(ScheduledEventAdapter::new(
        time_limit.clone(),
        Arc::clone(&time_provider),
        TimeMonitor::spawn(std::time::Duration::from_secs(1)),
    ));
    let ports = Collaborators {
        history: history.clone(),
        transactions: brokerage.clone(),
        portfolio: brokerage.clone(),
        realtime,
        results: results.clone(),
        alpha: Arc::new(MemoryAlphaAdapter::new()),
    };

    let mut ctx = AlgorithmContext::new(
        config.algorithm.id.clone(),
        ports,
        Arc::clone(&state),
        config.algorithm.time_zone,
        config.live_mode,
    );
    ctx.set_start_date(config.algorithm.start);
    ctx.set_end_date(config.algorithm.end);
    if let Some(warmup) = config.algorithm.warmup {
        ctx.set_warm_up(warmup);
    }

    let symbols = config
        .data
        .symbols
        .iter()
        .map(|s| Symbol::new(s.as_str(), config.data.security_type))
        .collect();
    let mut strategy = BuyAndHold::new(symbols, config.data.resolution);
    strategy
        .initialize(&mut ctx)
        .map_err(|e| EngineError::callback(Phase::Initialize, e))?;

    let mut producers: Vec<Producer> = Vec::new();
    for subscription in ctx.subscriptions.subscriptions() {
        if subscription.is_internal_feed || subscription.kind != DataKind::TradeBar {
            continue;
        }
        producers.push(history.producer(
            Arc::clone(subscription),
            config.algorithm.start,
            config.algorithm.end,
        )?);
    }
    let mut synchronizer = Synchronizer::new(producers);
    if let Some(pulse) = config.time_pulse {
        synchronizer = synchronizer.with_time_pulse(pulse);
    }

    let cancel = CancellationToken::new();
    let live = synchronizer.stream_data(config.stream_buffer, cancel.clone(), Arc::clone(&state));
    let stream = AlgorithmStream::new(&ctx, live, Arc::clone(&time_provider));

    let mut manager = AlgorithmManager::new(Arc::clone(&state), time_limit, time_provider)
        .with_margin_call_frequency(config.margin_call_frequency)
        .with_settlement_scan_frequency(config.settlement_scan_frequency);
    let outcome = manager.run(&mut strategy, &mut ctx, stream, &cancel);
    cancel.cancel();

    if outcome == RunOutcome::Failed {
        if let Some(error) = state.take_run_time_error() {
            return Err(error);
        }
    }
    info!(?outcome, data_points = manager.data_points(), "run finished");

    let holdings = brokerage_holdings(&brokerage, &ctx);
    Ok(RunSummary {
        outcome,
        status: manager.state(),
        data_points: manager.data_points(),
        initial_equity: config.algorithm.initial_cash,
        final_equity: ctx.portfolio().total_portfolio_value(),
        cash: ctx.portfolio().cash(),
        fills: brokerage.filled_orders().len(),
        samples: results.samples().len(),
        holdings,
    })
}

fn brokerage_holdings(
    brokerage: &SimulatedBrokerage,
    ctx: &AlgorithmContext,
) -> BTreeMap<Symbol, f64> {
    ctx.portfolio()
        .invested_symbols()
        .into_iter()
        .filter_map(|s| brokerage.holding(&s).map(|h| (s, h.quantity)))
        .collect()
}

/// Splits the portfolio equally across its symbols on the first bar of each
/// and holds until the end. Liquidates everything on the last day when
/// `liquidate_at_end` is set.
pub struct BuyAndHold {
    symbols: Vec<Symbol>,
    resolution: Resolution,
    liquidate_at_end: bool,
}

impl BuyAndHold {
    pub fn new(symbols: Vec<Symbol>, resolution: Resolution) -> Self {
        BuyAndHold {
            symbols,
            resolution,
            liquidate_at_end: false,
        }
    }

    pub fn liquidating_at_end(mut self) -> Self {
        self.liquidate_at_end = true;
        self
    }

    fn exchange_hours(symbol: &Symbol, ctx: &AlgorithmContext) -> ExchangeHours {
        match symbol.security_type {
            SecurityType::Equity => ExchangeHours::us_equity(),
            _ => ExchangeHours::always_open(ctx.time_zone()),
        }
    }
}

impl Algorithm for BuyAndHold {
    fn initialize(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        if self.symbols.is_empty() {
            anyhow::bail!("buy and hold needs at least one symbol");
        }
        for symbol in &self.symbols {
            let hours = Self::exchange_hours(symbol, ctx);
            ctx.add_security(symbol.clone(), self.resolution, hours);
        }
        Ok(())
    }

    fn handled_data(&self) -> Vec<DataKind> {
        vec![DataKind::TradeBar]
    }

    fn on_trade_bars(
        &mut self,
        ctx: &mut AlgorithmContext,
        bars: &BTreeMap<Symbol, TradeBar>,
    ) -> CallbackResult {
        if ctx.is_warming_up() {
            return Ok(());
        }
        let budget = ctx.portfolio().total_portfolio_value() / self.symbols.len() as f64;
        for (symbol, bar) in bars {
            if bar.close <= 0.0
                || ctx.is_invested(symbol)
                || !ctx.transactions().open_orders(symbol).is_empty()
            {
                continue;
            }
            let quantity = (budget / bar.close).floor();
            if quantity < 1.0 {
                warn!(
                    symbol = %symbol,
                    budget,
                    close = bar.close,
                    "budget too small for one share"
                );
                continue;
            }
            ctx.market_order(symbol, quantity, "buy and hold");
            ctx.debug(&format!("Purchased {quantity} {symbol} at {:.2}", bar.close));
        }
        Ok(())
    }

    fn on_end_of_algorithm(&mut self, ctx: &mut AlgorithmContext) -> CallbackResult {
        if self.liquidate_at_end {
            ctx.liquidate(None, "end of algorithm");
            ctx.transactions().process_synchronous_events()?;
        }
        Ok(())
    }
}
