//! Builds a [`TimeSlice`] from the packets synchronized at one instant.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::error::EngineError;
use super::history::HistorySlice;
use super::market_data::{DataKind, MarketData};
use super::subscription::SubscriptionManager;
use super::symbol::{SecurityType, Symbol};
use super::time_slice::{
    ConsolidatorUpdate, DataFeedPacket, SecurityChanges, SecurityUpdate, Slice, TimeSlice,
};

/// Application order of a subscription's updates within one security.
/// Quote data goes after trade data so that it is the last word on the cache.
fn kind_rank(kind: &DataKind) -> u8 {
    match kind {
        DataKind::Tick | DataKind::OpenInterest | DataKind::TradeBar => 0,
        DataKind::QuoteBar => 1,
        DataKind::OptionChain => 2,
        DataKind::Custom(_) => 3,
        _ => 4,
    }
}

fn accepts(config_kind: &DataKind, data: &MarketData) -> bool {
    let kind = data.kind();
    kind == *config_kind || kind.is_auxiliary()
}

/// Creates the time slice for `time`.
///
/// Fails with [`EngineError::ConfigurationMismatch`] when a packet carries a
/// non-auxiliary data point of a type its subscription does not declare.
pub fn create(
    time: DateTime<Utc>,
    mut packets: Vec<DataFeedPacket>,
    security_changes: Option<SecurityChanges>,
    universe_data: BTreeMap<String, Vec<MarketData>>,
) -> Result<TimeSlice, EngineError> {
    packets.sort_by(|a, b| {
        (&a.config.symbol, kind_rank(&a.config.kind))
            .cmp(&(&b.config.symbol, kind_rank(&b.config.kind)))
    });

    let mut slice = Slice::empty(time);
    let mut data_point_count = 0;
    let mut securities_update = Vec::new();
    let mut cash_book_update = Vec::new();
    let mut consolidator_update = Vec::new();
    let mut custom_data = Vec::new();

    for packet in packets {
        if packet.data.is_empty() {
            continue;
        }
        if let Some(bad) = packet.data.iter().find(|d| !accepts(&packet.config.kind, d)) {
            return Err(EngineError::ConfigurationMismatch {
                symbol: bad.symbol().clone(),
                kind: bad.kind(),
            });
        }

        data_point_count += packet.data.len();
        let config = packet.config;
        let market: Vec<MarketData> = packet
            .data
            .iter()
            .filter(|d| !d.kind().is_auxiliary())
            .cloned()
            .collect();

        if !market.is_empty() {
            let update = SecurityUpdate {
                symbol: config.symbol.clone(),
                kind: config.kind.clone(),
                contains_fill_forward: market.iter().any(MarketData::is_fill_forward),
                is_internal_config: config.is_internal_feed,
                data: market,
            };

            if config.is_internal_feed {
                if matches!(
                    config.symbol.security_type,
                    SecurityType::Forex | SecurityType::Crypto | SecurityType::Cfd
                ) {
                    cash_book_update.push(update.clone());
                }
                securities_update.push(update);
                continue;
            }

            consolidator_update.push(ConsolidatorUpdate {
                config: config.clone(),
                data: update.data.clone(),
            });
            if config.is_custom_data() {
                custom_data.push(update.clone());
            }
            securities_update.push(update);
        } else if config.is_internal_feed {
            continue;
        }

        for data in &packet.data {
            slice.insert(data);
        }
    }

    Ok(TimeSlice {
        time,
        data_point_count,
        slice,
        securities_update,
        cash_book_update,
        security_changes: security_changes.filter(|c| !c.is_empty()),
        universe_data,
        consolidator_update,
        custom_data,
        is_time_pulse: false,
    })
}

/// A data-free slice that only advances the clock.
pub fn create_time_pulse(time: DateTime<Utc>) -> TimeSlice {
    TimeSlice {
        time,
        data_point_count: 0,
        slice: Slice::empty(time),
        securities_update: Vec::new(),
        cash_book_update: Vec::new(),
        security_changes: None,
        universe_data: BTreeMap::new(),
        consolidator_update: Vec::new(),
        custom_data: Vec::new(),
        is_time_pulse: true,
    }
}

/// Splits a history slice into per-subscription packets. Each symbol's points
/// are paired with its first subscription of the matching kind, internal
/// feeds included.
pub fn pair_history_slice(
    subscriptions: &SubscriptionManager,
    history: &HistorySlice,
) -> Result<Vec<DataFeedPacket>, EngineError> {
    let mut grouped: BTreeMap<(Symbol, DataKind), Vec<MarketData>> = BTreeMap::new();
    for data in &history.data {
        grouped
            .entry((data.symbol().clone(), data.kind()))
            .or_default()
            .push(data.clone());
    }

    grouped
        .into_iter()
        .map(|((symbol, kind), data)| {
            subscriptions
                .find(&symbol, &kind)
                .map(|config| DataFeedPacket::new(config, data))
                .ok_or(EngineError::ConfigurationMismatch { symbol, kind })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market_data::{Bar, Dividend, QuoteBar, TradeBar};
    use crate::domain::resolution::Resolution;
    use crate::domain::subscription::SubscriptionDataConfig;
    use crate::domain::symbol::SecurityType;
    use chrono::{Duration, TimeZone};
    use chrono_tz::America::New_York;
    use std::sync::Arc;

    fn spy() -> Symbol {
        Symbol::new("SPY", SecurityType::Equity)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
    }

    fn config(kind: DataKind) -> Arc<SubscriptionDataConfig> {
        Arc::new(SubscriptionDataConfig::new(spy(), kind, Resolution::Minute, New_York))
    }

    fn trade() -> MarketData {
        MarketData::TradeBar(TradeBar {
            symbol: spy(),
            time: t0(),
            period: Duration::minutes(1),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            is_fill_forward: false,
        })
    }

    fn quote() -> MarketData {
        MarketData::QuoteBar(QuoteBar {
            symbol: spy(),
            time: t0(),
            period: Duration::minutes(1),
            bid: Some(Bar::flat(0.9)),
            ask: Some(Bar::flat(1.1)),
            last_bid_size: 1.0,
            last_ask_size: 1.0,
            is_fill_forward: false,
        })
    }

    #[test]
    fn quote_update_ordered_after_trade_regardless_of_arrival() {
        let packets = vec![
            DataFeedPacket::new(config(DataKind::QuoteBar), vec![quote()]),
            DataFeedPacket::new(config(DataKind::TradeBar), vec![trade()]),
        ];
        let slice = create(t0(), packets, None, BTreeMap::new()).unwrap();
        let kinds: Vec<_> = slice.securities_update.iter().map(|u| u.kind.clone()).collect();
        assert_eq!(kinds, vec![DataKind::TradeBar, DataKind::QuoteBar]);
        assert_eq!(slice.data_point_count, 2);
        assert!(slice.slice.trade_bars.contains_key(&spy()));
        assert!(slice.slice.quote_bars.contains_key(&spy()));
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let packets = vec![DataFeedPacket::new(config(DataKind::TradeBar), vec![quote()])];
        let err = create(t0(), packets, None, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationMismatch { kind: DataKind::QuoteBar, .. }));
    }

    #[test]
    fn auxiliary_data_rides_any_subscription() {
        let dividend = MarketData::Dividend(Dividend {
            symbol: spy(),
            time: t0(),
            distribution: 1.2,
            reference_price: 500.0,
        });
        let packets = vec![DataFeedPacket::new(config(DataKind::TradeBar), vec![dividend])];
        let slice = create(t0(), packets, None, BTreeMap::new()).unwrap();
        assert!(slice.securities_update.is_empty());
        assert_eq!(slice.slice.dividends.len(), 1);
    }

    #[test]
    fn internal_feed_stays_out_of_public_slice() {
        let eurusd = Symbol::new("EURUSD", SecurityType::Forex);
        let cfg = Arc::new(
            SubscriptionDataConfig::new(
                eurusd.clone(),
                DataKind::QuoteBar,
                Resolution::Minute,
                New_York,
            )
            .internal(),
        );
        let mut q = quote();
        if let MarketData::QuoteBar(bar) = &mut q {
            bar.symbol = eurusd;
        }
        let slice =
            create(t0(), vec![DataFeedPacket::new(cfg, vec![q])], None, BTreeMap::new()).unwrap();
        assert!(!slice.slice.has_data());
        assert_eq!(slice.cash_book_update.len(), 1);
        assert!(slice.securities_update[0].is_internal_config);
        assert!(slice.consolidator_update.is_empty());
    }

    #[test]
    fn empty_changes_become_none() {
        let slice =
            create(t0(), Vec::new(), Some(SecurityChanges::default()), BTreeMap::new()).unwrap();
        assert!(slice.security_changes.is_none());
    }

    #[test]
    fn history_pairing_requires_subscription() {
        let mut subscriptions = SubscriptionManager::new();
        subscriptions.add(SubscriptionDataConfig::new(
            spy(),
            DataKind::TradeBar,
            Resolution::Minute,
            New_York,
        ));
        let history = HistorySlice {
            time: t0(),
            data: vec![trade(), quote()],
        };
        let err = pair_history_slice(&subscriptions, &history).unwrap_err();
        assert_eq!(
            err.to_string(),
            "a data subscription for type 'QuoteBar' was not found for SPY"
        );

        let history = HistorySlice {
            time: t0(),
            data: vec![trade()],
        };
        let packets = pair_history_slice(&subscriptions, &history).unwrap();
        assert_eq!(packets.len(), 1);
    }
}
