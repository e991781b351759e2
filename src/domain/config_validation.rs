//! Configuration validation.
//!
//! Validates every engine config field before a run starts.

use crate::domain::error::EngineError;
use crate::domain::resolution::Resolution;
use crate::domain::symbol::SecurityType;
use crate::ports::config_port::ConfigPort;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

pub fn validate_engine_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    validate_positive_minutes(config, "engine", "time_loop_maximum_minutes", 20)?;
    validate_positive_minutes(config, "engine", "margin_call_frequency_minutes", 5)?;
    validate_positive_minutes(config, "engine", "settlement_scan_frequency_minutes", 30)?;
    validate_time_pulse(config)?;
    validate_stream_buffer(config)?;
    validate_training(config)?;
    Ok(())
}

pub fn validate_algorithm_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    let time_zone = parse_time_zone(config.get_string("algorithm", "time_zone").as_deref())?;
    validate_dates(config, time_zone)?;
    validate_initial_cash(config)?;
    validate_warmup(config)?;
    Ok(())
}

pub fn validate_data_config(config: &dyn ConfigPort) -> Result<(), EngineError> {
    validate_directory(config)?;
    parse_symbols(config.get_string("data", "symbols").as_deref())?;
    parse_resolution(config.get_string("data", "resolution").as_deref())?;
    parse_security_type(config.get_string("data", "security_type").as_deref())?;
    Ok(())
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> EngineError {
    EngineError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn missing(section: &str, key: &str) -> EngineError {
    EngineError::ConfigMissing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn validate_positive_minutes(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<(), EngineError> {
    let value = config.get_int(section, key, default);
    if value <= 0 {
        return Err(invalid(section, key, format!("{key} must be positive")));
    }
    Ok(())
}

fn validate_time_pulse(config: &dyn ConfigPort) -> Result<(), EngineError> {
    if config.get_string("engine", "time_pulse_minutes").is_none() {
        return Ok(());
    }
    validate_positive_minutes(config, "engine", "time_pulse_minutes", 0)
}

fn validate_stream_buffer(config: &dyn ConfigPort) -> Result<(), EngineError> {
    let value = config.get_int("engine", "stream_buffer", 64);
    if value < 1 {
        return Err(invalid("engine", "stream_buffer", "stream_buffer must be at least 1"));
    }
    Ok(())
}

/// The training bucket is optional, but once any of its keys is present all
/// three must be.
fn validate_training(config: &dyn ConfigPort) -> Result<(), EngineError> {
    let keys = ["capacity", "refill_amount", "time_interval_minutes"];
    let present: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| config.get_string("training", k).is_some())
        .collect();
    if present.is_empty() {
        return Ok(());
    }
    for key in keys {
        if !present.contains(&key) {
            return Err(missing("training", key));
        }
        if config.get_int("training", key, 0) <= 0 {
            return Err(invalid("training", key, format!("{key} must be positive")));
        }
    }
    Ok(())
}

fn validate_dates(config: &dyn ConfigPort, time_zone: Tz) -> Result<(), EngineError> {
    let start = parse_date(config.get_string("algorithm", "start").as_deref(), "start", time_zone)?;
    let end = parse_date(config.get_string("algorithm", "end").as_deref(), "end", time_zone)?;
    if start >= end {
        return Err(invalid("algorithm", "start", "start must be before end"));
    }
    Ok(())
}

fn validate_initial_cash(config: &dyn ConfigPort) -> Result<(), EngineError> {
    let value = config.get_double("algorithm", "initial_cash", 100_000.0);
    if value <= 0.0 {
        return Err(invalid("algorithm", "initial_cash", "initial_cash must be positive"));
    }
    Ok(())
}

fn validate_warmup(config: &dyn ConfigPort) -> Result<(), EngineError> {
    if config.get_int("algorithm", "warmup_days", 0) < 0 {
        return Err(invalid("algorithm", "warmup_days", "warmup_days must be non-negative"));
    }
    Ok(())
}

fn validate_directory(config: &dyn ConfigPort) -> Result<(), EngineError> {
    match config.get_string("data", "directory") {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(missing("data", "directory")),
    }
}

/// Parses a `YYYY-MM-DD` date as local midnight in `time_zone`.
pub fn parse_date(
    value: Option<&str>,
    field: &str,
    time_zone: Tz,
) -> Result<DateTime<Utc>, EngineError> {
    let value = value.ok_or_else(|| missing("algorithm", field))?;
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| {
            invalid("algorithm", field, format!("invalid {field} format, expected YYYY-MM-DD"))
        })?;
    date.and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(time_zone).earliest())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            invalid("algorithm", field, format!("{field} does not exist in {time_zone}"))
        })
}

/// IANA zone name, UTC when absent.
pub fn parse_time_zone(value: Option<&str>) -> Result<Tz, EngineError> {
    match value {
        None => Ok(Tz::UTC),
        Some(s) => s
            .trim()
            .parse::<Tz>()
            .map_err(|_| invalid("algorithm", "time_zone", format!("unknown time zone '{s}'"))),
    }
}

pub fn parse_symbols(value: Option<&str>) -> Result<Vec<String>, EngineError> {
    let symbols: Vec<String> = value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(missing("data", "symbols"));
    }
    Ok(symbols)
}

/// Minute when absent.
pub fn parse_resolution(value: Option<&str>) -> Result<Resolution, EngineError> {
    match value {
        None => Ok(Resolution::Minute),
        Some(s) => Resolution::parse(s)
            .ok_or_else(|| invalid("data", "resolution", format!("unknown resolution '{s}'"))),
    }
}

/// Equity when absent.
pub fn parse_security_type(value: Option<&str>) -> Result<SecurityType, EngineError> {
    match value {
        None => Ok(SecurityType::Equity),
        Some(s) => SecurityType::parse(s).ok_or_else(|| {
            invalid("data", "security_type", format!("unknown security type '{s}'"))
        }),
    }
}
