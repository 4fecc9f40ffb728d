use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to open metrics database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("malformed sample key: {0}")]
    BadKey(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;
