//! Async primitives guarding the chip chain.
//!
//! [`Mutex`] serializes every command/response exchange on the serial link.
//! [`Fifo`] buffers jobs between whoever submits them and the scheduler that
//! feeds the chips, and is the only backpressure in the pipeline.

pub mod fifo;
pub mod mutex;

pub use fifo::Fifo;
pub use mutex::{Mutex, MutexGuard};
