//! Error types for BM1380 chain operations

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unsupported frequency {mhz} MHz, please use one of: {supported}")]
    UnsupportedFrequency { mhz: u32, supported: String },
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No chips detected")]
    NoChipsDetected,

    #[error("Hashrate measurement failed: {responses} calibration response(s), need 2")]
    Calibration { responses: usize },

    #[error("Chain is closed")]
    Closed,
}
