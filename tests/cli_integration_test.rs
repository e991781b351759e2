//! CLI integration tests for the run orchestration.
//!
//! Tests cover:
//! - Config loading from INI files on disk
//! - Full buy-and-hold runs over CSV bars in a temp directory
//! - Warm-up from CSV history ahead of the live bars
//! - Error paths: missing data files, invalid config
//! - End-of-run liquidation through the in-memory harness

mod common;

use approx::assert_relative_eq;
use common::*;
use slicetrader::cli::{self, BuyAndHold};
use slicetrader::domain::algorithm::Algorithm;
use slicetrader::domain::error::EngineError;
use slicetrader::domain::manager::{AlgorithmManager, RunOutcome};
use slicetrader::domain::resolution::Resolution;
use slicetrader::domain::status::AlgorithmStatus;
use slicetrader::ports::portfolio_port::PortfolioPort;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Daily SPY bars for the first trading week of 2024, New York dates.
fn write_spy_csv(dir: &Path) {
    let content = "time,open,high,low,close,volume\n\
        2024-01-02,100.0,101.0,99.0,100.0,1000\n\
        2024-01-03,100.0,102.0,99.0,101.0,1000\n\
        2024-01-04,101.0,103.0,100.0,102.0,1000\n\
        2024-01-05,102.0,105.0,101.0,104.0,1000\n";
    std::fs::write(dir.join("SPY.csv"), content).unwrap();
}

fn ini(dir: &Path, extra: &str) -> String {
    format!(
        "[algorithm]
id = weekly
start = 2024-01-02
end = 2024-01-10
time_zone = America/New_York
initial_cash = 10000
{extra}
[data]
directory = {}
symbols = SPY
resolution = daily
",
        dir.display()
    )
}

mod config_loading {
    use super::*;

    #[test]
    fn load_config_reads_ini_from_disk() {
        let dir = TempDir::new().unwrap();
        let file = write_temp_ini(&ini(dir.path(), ""));
        let config = cli::load_config(&file.path().to_path_buf()).unwrap();

        assert_eq!(config.algorithm.id, "weekly");
        assert_eq!(config.algorithm.time_zone, chrono_tz::America::New_York);
        assert_eq!(config.algorithm.start, utc(2024, 1, 2, 5, 0));
        assert_eq!(config.data.symbols, vec!["SPY"]);
        assert_eq!(config.data.resolution, Resolution::Daily);
        assert_eq!(config.data.directory, dir.path().to_path_buf());
    }

    #[test]
    fn load_config_missing_file_fails() {
        let result = cli::load_config(&PathBuf::from("/nonexistent/slicetrader.ini"));
        assert!(result.is_err());
    }

    #[test]
    fn load_config_rejects_reversed_dates() {
        let dir = TempDir::new().unwrap();
        let content = ini(dir.path(), "").replace("end = 2024-01-10", "end = 2023-12-01");
        let file = write_temp_ini(&content);
        assert!(cli::load_config(&file.path().to_path_buf()).is_err());
    }
}

mod backtest_runs {
    use super::*;

    fn config_for(dir: &TempDir, extra: &str) -> slicetrader::domain::config::EngineConfig {
        let file = write_temp_ini(&ini(dir.path(), extra));
        cli::load_config(&file.path().to_path_buf()).unwrap()
    }

    #[test]
    fn buy_and_hold_over_csv_bars() {
        let dir = TempDir::new().unwrap();
        write_spy_csv(dir.path());
        let summary = cli::execute(&config_for(&dir, "")).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.status, AlgorithmStatus::Completed);
        assert_eq!(summary.data_points, 4);
        assert_eq!(summary.fills, 1);
        // 100 shares at the first close of 100
        assert_eq!(summary.holdings.values().copied().collect::<Vec<_>>(), vec![100.0]);
        assert_relative_eq!(summary.cash, 0.0);
        assert_relative_eq!(summary.final_equity, 10_400.0);
        assert_relative_eq!(summary.total_return(), 0.04, epsilon = 1e-12);
        // one per daily bar plus the forced final sample
        assert_eq!(summary.samples, 5);
    }

    #[test]
    fn warm_up_bars_are_not_traded() {
        let dir = TempDir::new().unwrap();
        write_spy_csv(dir.path());
        let mut config = config_for(&dir, "warmup_days = 2");
        config.algorithm.start = utc(2024, 1, 4, 5, 0);
        let summary = cli::execute(&config).unwrap();

        assert_eq!(summary.data_points, 4);
        assert_eq!(summary.fills, 1);
        // bought at 102 once warm-up ended
        assert_eq!(summary.holdings.values().copied().collect::<Vec<_>>(), vec![98.0]);
        assert_relative_eq!(summary.final_equity, 10_000.0 - 98.0 * 102.0 + 98.0 * 104.0);
    }

    #[test]
    fn missing_csv_is_a_data_error() {
        let dir = TempDir::new().unwrap();
        let result = cli::execute(&config_for(&dir, ""));
        assert!(matches!(result, Err(EngineError::Data { .. })));
    }

    #[test]
    fn time_pulses_do_not_add_data_points() {
        let dir = TempDir::new().unwrap();
        write_spy_csv(dir.path());
        let mut config = config_for(&dir, "");
        config.time_pulse = Some(chrono::Duration::hours(6));
        let summary = cli::execute(&config).unwrap();
        assert_eq!(summary.data_points, 4);
        assert_eq!(summary.fills, 1);
    }
}

mod strategy {
    use super::*;

    #[test]
    fn liquidating_at_end_flattens_positions() {
        let h = HarnessBuilder::new().cash(10_000.0).build();
        h.state.set_finished_warming_up();
        let mut ctx = h.context(&[], false);
        let mut strategy = BuyAndHold::new(vec![spy()], Resolution::Minute).liquidating_at_end();
        strategy.initialize(&mut ctx).unwrap();

        let start = utc(2024, 3, 4, 14, 31);
        let slices = vec![
            bar_slice(start, &[(&spy(), 50.0)]),
            bar_slice(start + chrono::Duration::minutes(1), &[(&spy(), 55.0)]),
        ];
        let mut manager = AlgorithmManager::new(
            Arc::clone(&h.state),
            Arc::clone(&h.time_limit),
            h.clock.clone(),
        );
        let outcome = manager.run(&mut strategy, &mut ctx, slices, &CancellationToken::new());

        assert_eq!(outcome, RunOutcome::Completed);
        let fills = h.brokerage.filled_orders();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].quantity, 200.0);
        assert_eq!(fills[1].quantity, -200.0);
        assert_eq!(fills[1].tag, "end of algorithm");
        assert_eq!(h.brokerage.holdings_quantity(&spy()), 0.0);
        assert_relative_eq!(h.brokerage.cash(), 11_000.0);
    }

    #[test]
    fn empty_symbol_list_fails_initialize() {
        let h = HarnessBuilder::new().build();
        let mut ctx = h.context(&[], false);
        let mut strategy = BuyAndHold::new(Vec::new(), Resolution::Daily);
        assert!(strategy.initialize(&mut ctx).is_err());
    }
}
