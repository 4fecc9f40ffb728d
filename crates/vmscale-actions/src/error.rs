//! Action queue and executor error types.

use thiserror::Error;

use vmscale_hypervisor::DriverError;
use vmscale_state::StateError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("action queue full ({capacity} admitted)")]
    Full { capacity: usize },
}

/// Why an action did not succeed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("host not in state store: {0}")]
    UnknownHost(String),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    /// Driver timeouts, unreachable hosts, busy resources and store hiccups
    /// are retried; everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Driver(e) => e.is_transient(),
            Self::State(_) => true,
            Self::UnknownHost(_) | Self::Panicked(_) => false,
        }
    }
}

pub type ActionResult<T> = Result<T, ActionError>;
