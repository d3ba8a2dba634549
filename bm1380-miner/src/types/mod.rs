//! Core types shared across the pipeline.
//!
//! Work moves through the miner in three shapes:
//!
//! - [`Work`]: a [`MiningJob`] plus the [`Notification`] it came from, on its
//!   way to the chip chain.
//! - [`MinedWork`]: the same pair with the [`MiningResult`] the chain
//!   collected for it.
//! - [`ValidatedWork`]: the pair with the [`StratumSubmission`] of nonces
//!   that passed proof-of-work checks.
//!
//! The notification is reference-counted since every job drawn from it
//! shares it.

pub use bitcoin::block::{Header as BlockHeader, Version};
pub use bitcoin::{BlockHash, CompactTarget, Target, TxMerkleNode};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::sha256::swap_words;
use crate::tracing::prelude::*;
use crate::u256::U256;

mod difficulty;

pub use difficulty::Difficulty;

impl From<Target> for U256 {
    fn from(target: Target) -> Self {
        Self::from_le_bytes(target.to_le_bytes())
    }
}

impl From<U256> for Target {
    fn from(u: U256) -> Self {
        Target::from_le_bytes(u.to_le_bytes())
    }
}

/// A target as 64 zero-padded hex digits, most significant first.
pub fn target_hex(target: Target) -> String {
    format!("{:x}", U256::from(target))
}

/// Hashrate in hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Time to sweep the full 32-bit nonce space at this rate.
    pub fn nonce_space_duration(&self) -> std::time::Duration {
        if self.0 <= 0.0 {
            return std::time::Duration::MAX;
        }
        std::time::Duration::from_secs_f64((u32::MAX as f64 + 1.0) / self.0)
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1e12 {
            write!(f, "{:.2} TH/s", self.0 / 1e12)
        } else if self.0 >= 1e9 {
            write!(f, "{:.2} GH/s", self.0 / 1e9)
        } else if self.0 >= 1e6 {
            write!(f, "{:.2} MH/s", self.0 / 1e6)
        } else {
            write!(f, "{:.0} H/s", self.0)
        }
    }
}

/// A 32-bit nonce as it appears in the block header.
///
/// Displays as the 8 zero-padded hex digits pools expect in
/// `mining.submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub u32);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for Nonce {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(Nonce)
    }
}

/// A fully assembled pool work template.
///
/// Only built once the session has a subscription, a difficulty, a
/// `mining.notify` payload and authorization; never partially applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub job_id: String,
    pub prev_blockhash: BlockHash,
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<TxMerkleNode>,
    pub version: Version,
    pub bits: CompactTarget,
    pub ntime: u32,
    pub clean_jobs: bool,

    /// Session-scoped fields from `mining.subscribe`
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,

    pub difficulty: Difficulty,
}

/// A ready-to-hash job derived from a [`Notification`].
#[derive(Debug, Clone, PartialEq)]
pub struct MiningJob {
    /// Header with the nonce field zeroed
    pub header: BlockHeader,

    /// SHA-256 state after the header's first 64 bytes, each state word
    /// stored little-endian as the chips expect
    pub midstate: [u8; 32],

    pub target: Target,

    pub extranonce2: Vec<u8>,
}

impl MiningJob {
    /// The header in word-swapped "data" layout.
    pub fn data(&self) -> [u8; 80] {
        let serialized = bitcoin::consensus::serialize(&self.header);
        let mut data = [0u8; 80];
        data.copy_from_slice(&swap_words(&serialized));
        data
    }

    pub fn data_hex(&self) -> String {
        hex::encode(self.data())
    }

    /// Bytes 64..76 of the data layout: merkle root tail, ntime and nbits.
    pub fn header_tail(&self) -> [u8; 12] {
        let mut tail = [0u8; 12];
        tail.copy_from_slice(&self.data()[64..76]);
        tail
    }

    pub fn extranonce2_hex(&self) -> String {
        hex::encode(&self.extranonce2)
    }

    /// Header with `nonce` filled in.
    pub fn header_with_nonce(&self, nonce: Nonce) -> BlockHeader {
        BlockHeader {
            nonce: nonce.0,
            ..self.header
        }
    }
}

/// Nonces the chip chain reported for one job.
///
/// Keeps first-seen order and ignores repeats. Holds at most
/// [`MiningResult::MAX_NONCES`]; a chain reporting more than that for a
/// single job is misbehaving and the excess is dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiningResult {
    nonces: Vec<Nonce>,
    dropped: usize,
}

impl MiningResult {
    pub const MAX_NONCES: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a nonce. Returns true if it was new and kept.
    pub fn record(&mut self, nonce: Nonce) -> bool {
        if self.nonces.contains(&nonce) {
            return false;
        }
        if self.nonces.len() >= Self::MAX_NONCES {
            if self.dropped == 0 {
                warn!(
                    limit = Self::MAX_NONCES,
                    "Nonce limit reached for job, dropping further results"
                );
            }
            self.dropped += 1;
            return false;
        }
        self.nonces.push(nonce);
        true
    }

    pub fn nonces(&self) -> &[Nonce] {
        &self.nonces
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }

    /// Nonces discarded after reaching the limit.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Nonces from one result that met the job's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumSubmission {
    pub nonces: Vec<Nonce>,
}

/// A job on its way to the chip chain.
#[derive(Debug, Clone)]
pub struct Work {
    pub notification: Arc<Notification>,
    pub job: MiningJob,
}

/// A job the chain worked on, with everything it reported.
#[derive(Debug, Clone)]
pub struct MinedWork {
    pub notification: Arc<Notification>,
    pub job: MiningJob,
    pub result: MiningResult,
}

/// A job with the nonces worth submitting to the pool.
#[derive(Debug, Clone)]
pub struct ValidatedWork {
    pub notification: Arc<Notification>,
    pub job: MiningJob,
    pub submission: StratumSubmission,
}
