//! BM1380 chip chain support.
//!
//! The BM1380 talks a minimal serial protocol: 4-byte commands broadcast to
//! every chip, 64-byte job frames carrying a midstate and the header tail,
//! and 5-byte responses. [`protocol`] defines the frames, [`chain`] drives a
//! whole chain through initialization, calibration and job scheduling.

pub mod chain;
pub mod crc;
pub mod error;
pub mod protocol;

#[cfg(test)]
pub(crate) mod test_data;

pub use chain::{Chain, ChainConfig, ChainEvent};
pub use error::{ChainError, ProtocolError};
pub use protocol::{Command, FrameCodec, Frequency, JobFrame, RegisterAddress, Response};
