use thiserror::Error;

use crate::timeq::Cycle;

/// Fatal and request-level failures surfaced by the memory-system model.
///
/// Backpressure (full queues, busy ports) is never an error: the affected work stays pending
/// and retries on a later cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// Rejected configuration. Raised before any event is scheduled.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal-consistency fault in the coherency engine or the interconnect.
    #[error("protocol violation at cycle {cycle}: {detail}")]
    Protocol { cycle: Cycle, detail: String },

    /// A DRAM command was issued before its timing constraint allowed it.
    #[error("timing violation at cycle {cycle}: {command} needs {constraint} (earliest {earliest})")]
    Timing {
        cycle: Cycle,
        command: String,
        constraint: &'static str,
        earliest: Cycle,
    },

    /// A malformed request was rejected by `submit`.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SimError {
    pub fn config(detail: impl Into<String>) -> Self {
        SimError::Config(detail.into())
    }

    pub fn protocol(cycle: Cycle, detail: impl Into<String>) -> Self {
        SimError::Protocol {
            cycle,
            detail: detail.into(),
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;

/// Fail with a `Config` error unless `cond` holds.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::sim::error::SimError::Config(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
