//! Typed engine configuration read through a [`ConfigPort`].

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::config_validation::{
    parse_date, parse_resolution, parse_security_type, parse_symbols, parse_time_zone,
    validate_algorithm_config, validate_data_config, validate_engine_config,
};
use crate::domain::error::EngineError;
use crate::domain::resolution::Resolution;
use crate::domain::symbol::SecurityType;
use crate::domain::time_limit::{
    AlgorithmTimeLimitManager, LeakyBucket, NullTokenBucket, TimeProvider, TokenBucket,
};
use crate::ports::config_port::ConfigPort;

/// Additional-time bucket for long running work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingConfig {
    pub capacity: u64,
    pub refill_amount: u64,
    pub time_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmConfig {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub time_zone: Tz,
    pub initial_cash: f64,
    pub warmup: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataConfig {
    pub directory: PathBuf,
    pub symbols: Vec<String>,
    pub resolution: Resolution,
    pub security_type: SecurityType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub live_mode: bool,
    pub time_loop_maximum: Duration,
    pub margin_call_frequency: Duration,
    pub settlement_scan_frequency: Duration,
    pub time_pulse: Option<Duration>,
    pub stream_buffer: usize,
    /// `None` means extra time is always granted.
    pub training: Option<TrainingConfig>,
    pub algorithm: AlgorithmConfig,
    pub data: DataConfig,
}

impl EngineConfig {
    /// Validates every section, then reads it.
    pub fn from_port(config: &dyn ConfigPort) -> Result<Self, EngineError> {
        validate_engine_config(config)?;
        validate_algorithm_config(config)?;
        validate_data_config(config)?;

        let minutes =
            |key: &str, default: i64| Duration::minutes(config.get_int("engine", key, default));

        let time_pulse = config
            .get_string("engine", "time_pulse_minutes")
            .map(|_| minutes("time_pulse_minutes", 0));

        let training = config.get_string("training", "capacity").map(|_| TrainingConfig {
            capacity: config.get_int("training", "capacity", 0) as u64,
            refill_amount: config.get_int("training", "refill_amount", 0) as u64,
            time_interval: Duration::minutes(config.get_int(
                "training",
                "time_interval_minutes",
                0,
            )),
        });

        let time_zone = parse_time_zone(config.get_string("algorithm", "time_zone").as_deref())?;
        let warmup_days = config.get_int("algorithm", "warmup_days", 0);
        let algorithm = AlgorithmConfig {
            id: config
                .get_string("algorithm", "id")
                .unwrap_or_else(|| "backtest".to_string()),
            start: parse_date(
                config.get_string("algorithm", "start").as_deref(),
                "start",
                time_zone,
            )?,
            end: parse_date(config.get_string("algorithm", "end").as_deref(), "end", time_zone)?,
            time_zone,
            initial_cash: config.get_double("algorithm", "initial_cash", 100_000.0),
            warmup: (warmup_days > 0).then(|| Duration::days(warmup_days)),
        };

        let data = DataConfig {
            directory: PathBuf::from(
                config.get_string("data", "directory").unwrap_or_default().trim(),
            ),
            symbols: parse_symbols(config.get_string("data", "symbols").as_deref())?,
            resolution: parse_resolution(config.get_string("data", "resolution").as_deref())?,
            security_type: parse_security_type(
                config.get_string("data", "security_type").as_deref(),
            )?,
        };

        Ok(EngineConfig {
            live_mode: config.get_bool("engine", "live_mode", false),
            time_loop_maximum: minutes("time_loop_maximum_minutes", 20),
            margin_call_frequency: minutes("margin_call_frequency_minutes", 5),
            settlement_scan_frequency: minutes("settlement_scan_frequency_minutes", 30),
            time_pulse,
            stream_buffer: config.get_int("engine", "stream_buffer", 64) as usize,
            training,
            algorithm,
            data,
        })
    }

    /// Builds the per-iteration watchdog described by this configuration.
    pub fn time_limit_manager(
        &self,
        time_provider: Arc<dyn TimeProvider>,
    ) -> AlgorithmTimeLimitManager {
        let bucket: Arc<dyn TokenBucket> = match self.training {
            Some(t) => Arc::new(LeakyBucket::new(
                t.capacity,
                t.refill_amount,
                t.time_interval,
                Arc::clone(&time_provider),
            )),
            None => Arc::new(NullTokenBucket),
        };
        AlgorithmTimeLimitManager::new(bucket, self.time_loop_maximum, time_provider)
    }
}
