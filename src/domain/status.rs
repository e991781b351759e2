//! Algorithm run status shared between the loop and its observers.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AlgorithmStatus {
    Running = 0,
    Stopped = 1,
    Deleted = 2,
    Liquidated = 3,
    RuntimeError = 4,
    Completed = 5,
    History = 6,
}

impl AlgorithmStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AlgorithmStatus::Running,
            1 => AlgorithmStatus::Stopped,
            2 => AlgorithmStatus::Deleted,
            3 => AlgorithmStatus::Liquidated,
            4 => AlgorithmStatus::RuntimeError,
            5 => AlgorithmStatus::Completed,
            _ => AlgorithmStatus::History,
        }
    }

    /// Statuses strategy code may request for itself.
    pub fn is_user_settable(self) -> bool {
        matches!(
            self,
            AlgorithmStatus::Stopped | AlgorithmStatus::Deleted | AlgorithmStatus::Liquidated
        )
    }
}

impl fmt::Display for AlgorithmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Run state of one algorithm: status, first fatal error, warm-up flag.
///
/// The loop thread writes; any thread may read.
#[derive(Debug)]
pub struct RunState {
    status: AtomicU8,
    run_time_error: Mutex<Option<EngineError>>,
    warming_up: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        RunState {
            status: AtomicU8::new(AlgorithmStatus::Running as u8),
            run_time_error: Mutex::new(None),
            warming_up: AtomicBool::new(true),
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> AlgorithmStatus {
        AlgorithmStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Loop-side transition. Returns `false` when asked to re-enter
    /// `Running` from a terminal status, which is never allowed.
    pub fn transition(&self, status: AlgorithmStatus) -> bool {
        let current = self.status();
        if status == AlgorithmStatus::Running && current != AlgorithmStatus::Running {
            return false;
        }
        self.status.store(status as u8, Ordering::Release);
        true
    }

    /// Strategy-side request for a soft stop.
    pub fn request_status(&self, status: AlgorithmStatus) -> bool {
        if !status.is_user_settable() || self.status() != AlgorithmStatus::Running {
            return false;
        }
        self.transition(status)
    }

    /// Records a fatal error and flips to `RuntimeError`. The first error wins.
    pub fn fail(&self, error: EngineError) {
        {
            let mut slot = self.run_time_error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.status.store(AlgorithmStatus::RuntimeError as u8, Ordering::Release);
    }

    pub fn has_run_time_error(&self) -> bool {
        self.run_time_error.lock().is_some()
    }

    pub fn run_time_error_message(&self) -> Option<String> {
        self.run_time_error.lock().as_ref().map(ToString::to_string)
    }

    pub fn take_run_time_error(&self) -> Option<EngineError> {
        self.run_time_error.lock().take()
    }

    pub fn is_warming_up(&self) -> bool {
        self.warming_up.load(Ordering::Acquire)
    }

    pub fn set_finished_warming_up(&self) {
        self.warming_up.store(false, Ordering::Release);
    }
}
