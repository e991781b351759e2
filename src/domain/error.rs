//! Engine error taxonomy.

use crate::domain::market_data::DataKind;
use crate::domain::phase::Phase;
use crate::domain::symbol::Symbol;

/// Top-level error type for slicetrader.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a data subscription for type '{kind}' was not found for {symbol}")]
    ConfigurationMismatch { symbol: Symbol, kind: DataKind },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("runtime error in {phase}: {source:#}")]
    Callback {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to build time slice: {0}")]
    SliceConstruction(Box<EngineError>),

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error("{0}")]
    TimeLimitExceeded(String),

    #[error("unable to grant {requested} additional minutes, the time budget is exhausted")]
    InsufficientTime { requested: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn callback(phase: Phase, source: anyhow::Error) -> Self {
        EngineError::Callback { phase, source }
    }

    /// The loop phase a run-time error originated from, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineError::Callback { phase, .. } => Some(*phase),
            EngineError::SliceConstruction(_) => Some(Phase::SliceConstruction),
            _ => None,
        }
    }
}

impl From<&EngineError> for std::process::ExitCode {
    fn from(err: &EngineError) -> Self {
        let code: u8 = match err {
            EngineError::Io(_) => 1,
            EngineError::ConfigParse { .. }
            | EngineError::ConfigMissing { .. }
            | EngineError::ConfigInvalid { .. } => 2,
            EngineError::ConfigurationMismatch { .. }
            | EngineError::SliceConstruction(_)
            | EngineError::Data { .. } => 3,
            EngineError::Callback { .. } => 4,
            EngineError::TimeLimitExceeded(_) | EngineError::InsufficientTime { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}
