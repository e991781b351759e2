//! Historical data requests used for warm-up.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::trace;

use super::market_data::{DataKind, MarketData};
use super::resolution::Resolution;
use super::security::Securities;
use super::subscription::{SubscriptionDataConfig, SubscriptionManager};
use super::symbol::Symbol;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub symbol: Symbol,
    pub kind: DataKind,
    pub resolution: Resolution,
    pub fill_forward_resolution: Option<Resolution>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exchange_time_zone: Tz,
}

impl HistoryRequest {
    pub fn from_config(
        config: &SubscriptionDataConfig,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        HistoryRequest {
            symbol: config.symbol.clone(),
            kind: config.kind.clone(),
            resolution: config.resolution,
            fill_forward_resolution: config.fill_forward.then_some(config.resolution),
            start,
            end,
            exchange_time_zone: config.exchange_time_zone,
        }
    }
}

/// All historical points sharing one timestamp, across symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySlice {
    pub time: DateTime<Utc>,
    pub data: Vec<MarketData>,
}

/// Rewrites warm-up requests before they are sent to the history provider.
///
/// Requests for internal feeds finer than the finest user subscription are
/// raised to that resolution. Every fill-forward resolution is then set to
/// the finest one requested, not the coarsest, so that no feed fills forward
/// on a slower clock than its peers.
pub fn prepare_warmup_requests(
    requests: &mut [HistoryRequest],
    securities: &Securities,
    subscriptions: &SubscriptionManager,
) {
    let min_resolution = subscriptions
        .subscriptions()
        .filter(|c| !c.is_internal_feed)
        .map(|c| c.resolution)
        .min()
        .unwrap_or(Resolution::Second);

    for request in requests.iter_mut() {
        let internal = securities
            .get(&request.symbol)
            .is_some_and(|s| s.is_internal_feed);
        if internal && request.resolution < min_resolution {
            request.resolution = min_resolution;
            request.fill_forward_resolution =
                request.fill_forward_resolution.map(|_| min_resolution);
        }
    }

    if let Some(fill_forward) = requests.iter().filter_map(|r| r.fill_forward_resolution).min() {
        for request in requests.iter_mut().filter(|r| r.fill_forward_resolution.is_some()) {
            request.fill_forward_resolution = Some(fill_forward);
        }
    }

    for request in requests.iter() {
        trace!(
            symbol = %request.symbol,
            start = %request.start,
            end = %request.end,
            resolution = %request.resolution,
            "warm-up history request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange_hours::ExchangeHours;
    use crate::domain::security::Security;
    use crate::domain::symbol::SecurityType;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn request(symbol: &Symbol, resolution: Resolution, ff: Option<Resolution>) -> HistoryRequest {
        HistoryRequest {
            symbol: symbol.clone(),
            kind: DataKind::TradeBar,
            resolution,
            fill_forward_resolution: ff,
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
            exchange_time_zone: New_York,
        }
    }

    #[test]
    fn internal_feed_raised_to_finest_user_resolution() {
        let spy = Symbol::new("SPY", SecurityType::Equity);
        let eurusd = Symbol::new("EURUSD", SecurityType::Forex);
        let mut securities = Securities::new();
        securities.try_add(Security::new(spy.clone(), ExchangeHours::us_equity()));
        securities.try_add(Security::new(eurusd.clone(), ExchangeHours::default()).internal());

        let mut subscriptions = SubscriptionManager::new();
        subscriptions.add(SubscriptionDataConfig::new(
            spy.clone(),
            DataKind::TradeBar,
            Resolution::Hour,
            New_York,
        ));
        subscriptions.add(
            SubscriptionDataConfig::new(
                eurusd.clone(),
                DataKind::QuoteBar,
                Resolution::Minute,
                New_York,
            )
            .internal(),
        );

        let mut requests = vec![
            request(&spy, Resolution::Hour, Some(Resolution::Hour)),
            request(&eurusd, Resolution::Minute, Some(Resolution::Minute)),
        ];
        prepare_warmup_requests(&mut requests, &securities, &subscriptions);

        assert_eq!(requests[1].resolution, Resolution::Hour);
        assert_eq!(requests[1].fill_forward_resolution, Some(Resolution::Hour));
    }

    #[test]
    fn fill_forward_resolutions_aligned() {
        let spy = Symbol::new("SPY", SecurityType::Equity);
        let qqq = Symbol::new("QQQ", SecurityType::Equity);
        let aapl = Symbol::new("AAPL", SecurityType::Equity);
        let mut requests = vec![
            request(&spy, Resolution::Daily, Some(Resolution::Daily)),
            request(&qqq, Resolution::Minute, Some(Resolution::Minute)),
            request(&aapl, Resolution::Daily, None),
        ];
        prepare_warmup_requests(&mut requests, &Securities::new(), &SubscriptionManager::new());
        assert_eq!(requests[0].fill_forward_resolution, Some(Resolution::Minute));
        assert_eq!(requests[1].fill_forward_resolution, Some(Resolution::Minute));
        assert_eq!(requests[2].fill_forward_resolution, None);
    }
}
