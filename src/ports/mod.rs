//! Capabilities the engine consumes from its collaborators.

pub mod alpha_port;
pub mod config_port;
pub mod history_port;
pub mod portfolio_port;
pub mod realtime_port;
pub mod result_port;
pub mod transaction_port;

use std::sync::Arc;

use alpha_port::AlphaPort;
use history_port::HistoryPort;
use portfolio_port::PortfolioPort;
use realtime_port::RealTimePort;
use result_port::ResultPort;
use transaction_port::TransactionPort;

/// Handles to every collaborator of one run.
#[derive(Clone)]
pub struct Collaborators {
    pub history: Arc<dyn HistoryPort>,
    pub transactions: Arc<dyn TransactionPort>,
    pub portfolio: Arc<dyn PortfolioPort>,
    pub realtime: Arc<dyn RealTimePort>,
    pub results: Arc<dyn ResultPort>,
    pub alpha: Arc<dyn AlphaPort>,
}
