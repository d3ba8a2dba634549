//! Stratum v1 mining protocol client.
//!
//! JSON-RPC over TCP, one message per line. The client subscribes and
//! authorizes, turns the pool's `mining.set_difficulty` and `mining.notify`
//! pushes into complete [`Notification`](crate::types::Notification)s, and
//! submits validated shares with `mining.submit`.

mod client;
mod connection;
mod error;
mod messages;

pub use client::{ClientEvent, NotificationAssembler, PoolConfig, StratumV1Client};
pub use connection::{parse_url, Connection};
pub use error::{StratumError, StratumResult};
pub use messages::{JobNotification, JsonRpcMessage, SubmitParams, Subscription};
