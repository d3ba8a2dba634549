//! Driver and pool client for BM1380 mining ASIC chains.
//!
//! Work flows from a Stratum v1 pool through the job generator to the chip
//! chain, and nonces flow back through the validator to the pool:
//!
//! ```text
//! stratum_v1 -> job_generator -> asic::bm1380::Chain -> validator -> stratum_v1
//! ```

pub mod asic;
pub mod config;
pub mod daemon;
pub mod job_generator;
pub mod sha256;
pub mod stratum_v1;
pub mod sync;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod validator;
