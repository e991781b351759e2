//! Named phases of one loop iteration, used to tag fatal errors and logs.

use std::fmt;

/// A phase of the per-slice loop body, or of the run's prologue/epilogue.
///
/// Every user-code invocation site and every engine step that can fail is
/// tagged with one of these so that a post-mortem log names exactly where
/// the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    HistoryReplay,
    SliceConstruction,
    StartTimeStep,
    StatusCheck,
    Cancellation,
    Sample,
    SolvencyGuard,
    ScanPastEvents,
    SetTime,
    SymbolChanges,
    UniverseChanges,
    SecurityUpdate,
    UniverseData,
    CashConversion,
    ScheduledEvents,
    PreUserOrderProcessing,
    DelistingLiquidation,
    SplitLiquidation,
    ExternalStatus,
    MarginCall,
    MarginCallExecution,
    MarginCallWarning,
    CashSettlement,
    SecuritiesChanged,
    DividendApplication,
    SplitApplication,
    Consolidators,
    CustomData,
    CorporateActionEvents,
    CorporateActionBookkeeping,
    PriceData,
    Slice,
    PostUserOrderProcessing,
    AlphaProcessing,
    ResultProcessing,
    EndOfTimeStep,
    EndOfAlgorithm,
    Finalization,
}

impl Phase {
    /// Step number within the loop body, `None` outside of it.
    pub fn step(self) -> Option<u8> {
        let step = match self {
            Phase::Initialize
            | Phase::HistoryReplay
            | Phase::SliceConstruction
            | Phase::EndOfAlgorithm
            | Phase::Finalization => return None,
            Phase::StartTimeStep => 1,
            Phase::StatusCheck => 2,
            Phase::Cancellation => 3,
            Phase::Sample => 4,
            Phase::SolvencyGuard => 5,
            Phase::ScanPastEvents => 6,
            Phase::SetTime => 7,
            Phase::SymbolChanges => 8,
            Phase::UniverseChanges => 9,
            Phase::SecurityUpdate => 10,
            Phase::UniverseData => 11,
            Phase::CashConversion => 12,
            Phase::ScheduledEvents => 13,
            Phase::PreUserOrderProcessing => 14,
            Phase::DelistingLiquidation => 15,
            Phase::SplitLiquidation => 16,
            Phase::ExternalStatus => 17,
            Phase::MarginCall | Phase::MarginCallExecution | Phase::MarginCallWarning => 18,
            Phase::CashSettlement => 19,
            Phase::SecuritiesChanged => 20,
            Phase::DividendApplication | Phase::SplitApplication => 21,
            Phase::Consolidators => 22,
            Phase::CustomData => 23,
            Phase::CorporateActionEvents => 24,
            Phase::CorporateActionBookkeeping => 25,
            Phase::PriceData => 26,
            Phase::Slice => 27,
            Phase::PostUserOrderProcessing => 28,
            Phase::AlphaProcessing => 29,
            Phase::ResultProcessing => 30,
            Phase::EndOfTimeStep => 31,
        };
        Some(step)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Initialize => "Initialize",
            Phase::HistoryReplay => "warm-up history replay",
            Phase::SliceConstruction => "time slice construction",
            Phase::StartTimeStep => "start time step",
            Phase::StatusCheck => "status check",
            Phase::Cancellation => "cancellation check",
            Phase::Sample => "equity sample",
            Phase::SolvencyGuard => "solvency guard",
            Phase::ScanPastEvents => "scan past scheduled events",
            Phase::SetTime => "set algorithm time",
            Phase::SymbolChanges => "symbol changed events",
            Phase::UniverseChanges => "universe security changes",
            Phase::SecurityUpdate => "security cache update",
            Phase::UniverseData => "universe data storage",
            Phase::CashConversion => "currency conversion update",
            Phase::ScheduledEvents => "scheduled events",
            Phase::PreUserOrderProcessing => "order processing before user code",
            Phase::DelistingLiquidation => "delisting liquidation",
            Phase::SplitLiquidation => "split option liquidation",
            Phase::ExternalStatus => "external status check",
            Phase::MarginCall => "OnMarginCall",
            Phase::MarginCallExecution => "ExecuteMarginCall",
            Phase::MarginCallWarning => "OnMarginCallWarning",
            Phase::CashSettlement => "cash settlement scan",
            Phase::SecuritiesChanged => "OnSecuritiesChanged",
            Phase::DividendApplication => "dividend application",
            Phase::SplitApplication => "split application",
            Phase::Consolidators => "consolidator update",
            Phase::CustomData => "custom data",
            Phase::CorporateActionEvents => "dividends/splits/delistings",
            Phase::CorporateActionBookkeeping => "delisting/split bookkeeping",
            Phase::PriceData => "price data",
            Phase::Slice => "slice",
            Phase::PostUserOrderProcessing => "order processing after user code",
            Phase::AlphaProcessing => "alpha processing",
            Phase::ResultProcessing => "result processing",
            Phase::EndOfTimeStep => "OnEndOfTimeStep",
            Phase::EndOfAlgorithm => "OnEndOfAlgorithm",
            Phase::Finalization => "finalization",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step() {
            Some(step) => write!(f, "step {step} ({})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_step_number() {
        assert_eq!(
            Phase::SplitApplication.to_string(),
            "step 21 (split application)"
        );
        assert_eq!(Phase::MarginCallExecution.to_string(), "step 18 (ExecuteMarginCall)");
    }

    #[test]
    fn epilogue_phases_have_no_step() {
        assert_eq!(Phase::EndOfAlgorithm.step(), None);
        assert_eq!(Phase::EndOfAlgorithm.to_string(), "OnEndOfAlgorithm");
    }
}
