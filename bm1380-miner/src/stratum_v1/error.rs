//! Error types for the Stratum v1 client

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

pub type StratumResult<T> = Result<T, StratumError>;

#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Pool connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON from pool: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pool URL: {0}")]
    InvalidUrl(String),

    #[error("Request to pool timed out")]
    Timeout,

    #[error("Disconnected from pool")]
    Disconnected,

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Share rejected: {0}")]
    SubmissionRejected(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<LinesCodecError> for StratumError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => StratumError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                StratumError::InvalidMessage("line too long".to_string())
            }
        }
    }
}
