//! Error types for the state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Every variant is treated as transient by callers: a failed read skips a
/// group for one reconciliation cycle, a failed write retries the action.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction error: {0}")]
    Transaction(String),

    #[error("state table error: {0}")]
    Table(String),

    #[error("state read error: {0}")]
    Read(String),

    #[error("state write error: {0}")]
    Write(String),

    #[error("failed to encode record: {0}")]
    Serialize(String),

    #[error("failed to decode record: {0}")]
    Deserialize(String),

    #[error("host '{0}' is not registered")]
    UnknownHost(String),
}
