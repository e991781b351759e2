//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod file_config_adapter;
pub mod memory_alpha_adapter;
pub mod memory_result_adapter;
pub mod scheduled_event_adapter;
pub mod sim_brokerage;
