//! Data subscriptions and their lookup table.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use super::market_data::{DataKind, MarketData};
use super::resolution::{round_down_in_time_zone, Resolution};
use super::symbol::{SecurityType, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataNormalizationMode {
    /// Prices as traded; splits must be applied to resting orders.
    Raw,
    Adjusted,
}

/// Describes one data feed: which symbol, which data type, at what
/// resolution and in which exchange time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDataConfig {
    pub symbol: Symbol,
    pub kind: DataKind,
    pub resolution: Resolution,
    pub increment: Duration,
    pub exchange_time_zone: Tz,
    pub fill_forward: bool,
    /// Feeds added by the engine itself (e.g. currency conversion), never
    /// surfaced to strategy callbacks.
    pub is_internal_feed: bool,
    pub normalization_mode: DataNormalizationMode,
}

impl SubscriptionDataConfig {
    pub fn new(
        symbol: Symbol,
        kind: DataKind,
        resolution: Resolution,
        exchange_time_zone: Tz,
    ) -> Self {
        SubscriptionDataConfig {
            symbol,
            kind,
            resolution,
            increment: resolution.to_duration(),
            exchange_time_zone,
            fill_forward: true,
            is_internal_feed: false,
            normalization_mode: DataNormalizationMode::Adjusted,
        }
    }

    pub fn internal(mut self) -> Self {
        self.is_internal_feed = true;
        self
    }

    pub fn with_fill_forward(mut self, fill_forward: bool) -> Self {
        self.fill_forward = fill_forward;
        self
    }

    pub fn with_normalization(mut self, mode: DataNormalizationMode) -> Self {
        self.normalization_mode = mode;
        self
    }

    pub fn is_custom_data(&self) -> bool {
        self.kind.is_custom()
    }

    /// True when `end_time` sits exactly on a bar boundary of this
    /// subscription's own resolution. Fill-forward echoes of coarser data and
    /// intermediate points of finer data fail the check.
    pub fn end_time_is_in_native_resolution(&self, end_time: DateTime<Utc>) -> bool {
        match self.resolution {
            Resolution::Tick => true,
            // time zones never shift seconds or minutes
            Resolution::Second | Resolution::Minute => {
                let step = self.increment.num_seconds().max(1);
                end_time.timestamp_subsec_nanos() == 0 && end_time.timestamp().rem_euclid(step) == 0
            }
            Resolution::Hour | Resolution::Daily => {
                round_down_in_time_zone(end_time, self.increment, self.exchange_time_zone)
                    == end_time
            }
        }
    }
}

/// Data types subscribed by default for a security type at a resolution.
pub fn default_data_types(security_type: SecurityType, resolution: Resolution) -> Vec<DataKind> {
    if resolution == Resolution::Tick {
        return vec![DataKind::Tick];
    }
    match security_type {
        SecurityType::Base | SecurityType::Index => vec![DataKind::TradeBar],
        SecurityType::Forex | SecurityType::Cfd => vec![DataKind::QuoteBar],
        SecurityType::Equity | SecurityType::Crypto => vec![DataKind::TradeBar, DataKind::QuoteBar],
        SecurityType::Future | SecurityType::Option | SecurityType::FutureOption => {
            vec![DataKind::QuoteBar, DataKind::TradeBar]
        }
    }
}

/// Whether a data point is one of the price-carrying types the security cache
/// treats as its primary observation.
pub fn is_default_data_type(data: &MarketData) -> bool {
    matches!(
        data,
        MarketData::Tick(_)
            | MarketData::TradeBar(_)
            | MarketData::QuoteBar(_)
            | MarketData::Custom(_)
    )
}

/// Registry of every active subscription, internal feeds included.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionManager {
    configs: Vec<Arc<SubscriptionDataConfig>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `config`, returning the existing entry when an identical
    /// subscription is already present.
    pub fn add(&mut self, config: SubscriptionDataConfig) -> Arc<SubscriptionDataConfig> {
        if let Some(existing) = self.configs.iter().find(|c| ***c == config) {
            return Arc::clone(existing);
        }
        let config = Arc::new(config);
        self.configs.push(Arc::clone(&config));
        config
    }

    /// Subscribes the default data types for `symbol`.
    pub fn add_defaults(
        &mut self,
        symbol: &Symbol,
        resolution: Resolution,
        time_zone: Tz,
    ) -> Vec<Arc<SubscriptionDataConfig>> {
        default_data_types(symbol.security_type, resolution)
            .into_iter()
            .map(|kind| {
                self.add(SubscriptionDataConfig::new(symbol.clone(), kind, resolution, time_zone))
            })
            .collect()
    }

    pub fn remove_symbol(&mut self, symbol: &Symbol) {
        self.configs.retain(|c| &c.symbol != symbol);
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Arc<SubscriptionDataConfig>> {
        self.configs.iter()
    }

    pub fn for_symbol<'a>(
        &'a self,
        symbol: &'a Symbol,
    ) -> impl Iterator<Item = &'a Arc<SubscriptionDataConfig>> + 'a {
        self.configs.iter().filter(move |c| &c.symbol == symbol)
    }

    /// First subscription, in registration order, for `symbol` with data type `kind`.
    pub fn find(&self, symbol: &Symbol, kind: &DataKind) -> Option<Arc<SubscriptionDataConfig>> {
        self.for_symbol(symbol)
            .find(|c| &c.kind == kind)
            .map(Arc::clone)
    }

    /// Finest resolution among the subscriptions of `symbol`.
    pub fn highest_resolution(&self, symbol: &Symbol) -> Option<Resolution> {
        self.for_symbol(symbol).map(|c| c.resolution).min()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }
}
