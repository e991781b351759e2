//! Engine core: data model, slice construction, synchronization and the
//! algorithm loop.

pub mod symbol;
pub mod resolution;
pub mod market_data;
pub mod subscription;
pub mod exchange_hours;
pub mod security;
pub mod consolidator;
pub mod time_slice;
pub mod time_slice_factory;
pub mod history;
pub mod synchronizer;
pub mod time_limit;
pub mod status;
pub mod order;
pub mod algorithm;
pub mod phase;
pub mod manager;
pub mod config;
pub mod config_validation;
pub mod error;
