//! CSV bar files as history and as synchronizer producers.
//!
//! One file per symbol, `<SYMBOL>.csv`, with the header
//! `time,open,high,low,close,volume`. `time` is the bar start in exchange
//! local time, either `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::error::EngineError;
use crate::domain::history::{HistoryRequest, HistorySlice};
use crate::domain::market_data::{DataKind, MarketData, TradeBar};
use crate::domain::resolution::Resolution;
use crate::domain::subscription::SubscriptionDataConfig;
use crate::domain::symbol::Symbol;
use crate::domain::synchronizer::{FeedEvent, Producer};
use crate::domain::time_slice::DataFeedPacket;
use crate::ports::history_port::{HistoryIter, HistoryPort};

pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &Symbol) -> PathBuf {
        self.base_path.join(format!("{}.csv", symbol.value))
    }

    /// Bars of `symbol` ending in `(start, end]`, sorted by time.
    pub fn read_bars(
        &self,
        symbol: &Symbol,
        resolution: Resolution,
        time_zone: Tz,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TradeBar>, EngineError> {
        if resolution == Resolution::Tick {
            return Err(EngineError::Data {
                reason: format!("tick resolution is not available from csv files ({symbol})"),
            });
        }
        let path = self.csv_path(symbol);
        let content = fs::read_to_string(&path).map_err(|e| EngineError::Data {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        let period = resolution.to_duration();
        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let mut bars = Vec::new();

        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| EngineError::Data {
                reason: format!("CSV parse error in {}: {}", path.display(), e),
            })?;
            let row = line + 2;

            let time_str = record.get(0).ok_or_else(|| EngineError::Data {
                reason: format!("missing time column on line {row}"),
            })?;
            let time = parse_local_time(time_str, time_zone).ok_or_else(|| EngineError::Data {
                reason: format!("invalid time '{time_str}' on line {row}"),
            })?;

            let bar = TradeBar {
                symbol: symbol.clone(),
                time,
                period,
                open: number(&record, 1, "open", row)?,
                high: number(&record, 2, "high", row)?,
                low: number(&record, 3, "low", row)?,
                close: number(&record, 4, "close", row)?,
                volume: number(&record, 5, "volume", row)?,
                is_fill_forward: false,
            };
            if bar.end_time() <= start || bar.end_time() > end {
                continue;
            }
            bars.push(bar);
        }

        bars.sort_by_key(|b| b.time);
        debug!(symbol = %symbol, bars = bars.len(), path = %path.display(), "loaded csv bars");
        Ok(bars)
    }

    /// A producer emitting each bar of `config` at its end time.
    pub fn producer(
        &self,
        config: Arc<SubscriptionDataConfig>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Producer, EngineError> {
        let bars = self.read_bars(
            &config.symbol,
            config.resolution,
            config.exchange_time_zone,
            start,
            end,
        )?;
        Ok(Box::new(bars.into_iter().map(move |bar| {
            FeedEvent::data(
                bar.end_time(),
                DataFeedPacket::new(Arc::clone(&config), vec![MarketData::TradeBar(bar)]),
            )
        })))
    }

    pub fn list_symbols(&self) -> Result<Vec<String>, EngineError> {
        let entries = fs::read_dir(&self.base_path)?;
        let mut symbols = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(stem) = name.to_string_lossy().strip_suffix(".csv") {
                symbols.push(stem.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

fn number(
    record: &csv::StringRecord,
    index: usize,
    name: &str,
    row: usize,
) -> Result<f64, EngineError> {
    record
        .get(index)
        .ok_or_else(|| EngineError::Data {
            reason: format!("missing {name} column on line {row}"),
        })?
        .trim()
        .parse()
        .map_err(|e| EngineError::Data {
            reason: format!("invalid {name} value on line {row}: {e}"),
        })
}

fn parse_local_time(value: &str, time_zone: Tz) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let local = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    local
        .and_local_timezone(time_zone)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}

impl HistoryPort for CsvAdapter {
    fn get_history(
        &self,
        requests: &[HistoryRequest],
        time_zone: Tz,
    ) -> Result<HistoryIter, EngineError> {
        let mut by_time: BTreeMap<DateTime<Utc>, Vec<MarketData>> = BTreeMap::new();
        for request in requests {
            if request.kind != DataKind::TradeBar {
                trace!(
                    symbol = %request.symbol,
                    kind = %request.kind,
                    "csv history only serves trade bars"
                );
                continue;
            }
            let bars = self.read_bars(
                &request.symbol,
                request.resolution,
                request.exchange_time_zone,
                request.start,
                request.end,
            )?;
            for bar in bars {
                by_time.entry(bar.end_time()).or_default().push(MarketData::TradeBar(bar));
            }
        }
        debug!(requests = requests.len(), slices = by_time.len(), %time_zone, "csv history ready");
        Ok(Box::new(
            by_time.into_iter().map(|(time, data)| HistorySlice { time, data }),
        ))
    }
}
