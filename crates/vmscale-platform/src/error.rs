use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to encode platform message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;
