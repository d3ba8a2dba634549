//! Job synthesis from pool notifications.
//!
//! Each job rolls extranonce2, which changes the coinbase transaction and
//! with it the merkle root, giving the chips a fresh 2^32 nonce space per
//! job without any new work from the pool.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use thiserror::Error;

use crate::sha256::{double_sha256, swap_words, transform};
use crate::tracing::prelude::*;
use crate::types::{target_hex, BlockHeader, MiningJob, Notification, Target, TxMerkleNode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("No notification received yet")]
    NoNotification,

    #[error("Extranonce2 space exhausted ({size} bytes)")]
    Extranonce2Overflow { size: usize },

    #[error("Unsupported extranonce2 size {0}")]
    UnsupportedExtranonce2Size(usize),
}

/// Merkle root of a notification's block with `extranonce2` in the coinbase.
///
/// The coinbase is `coinbase1 || extranonce1 || extranonce2 || coinbase2`;
/// its hash is folded up the branch with `root = dsha256(root || branch)`.
pub fn merkle_root(notification: &Notification, extranonce2: &[u8]) -> TxMerkleNode {
    let mut coinbase = Vec::with_capacity(
        notification.coinbase1.len()
            + notification.extranonce1.len()
            + extranonce2.len()
            + notification.coinbase2.len(),
    );
    coinbase.extend_from_slice(&notification.coinbase1);
    coinbase.extend_from_slice(&notification.extranonce1);
    coinbase.extend_from_slice(extranonce2);
    coinbase.extend_from_slice(&notification.coinbase2);

    let mut root = double_sha256(&coinbase);
    for branch in &notification.merkle_branches {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&root);
        concat[32..].copy_from_slice(branch.as_byte_array());
        root = double_sha256(&concat);
    }

    TxMerkleNode::from_byte_array(root)
}

/// SHA-256 state after the header's first 64 bytes, each state word stored
/// little-endian.
pub fn midstate(header: &BlockHeader) -> [u8; 32] {
    let serialized = bitcoin::consensus::serialize(header);
    let mut first_block = [0u8; 64];
    first_block.copy_from_slice(&serialized[..64]);

    let state = transform(&first_block, None);
    let mut midstate = [0u8; 32];
    midstate.copy_from_slice(&swap_words(&state));
    midstate
}

/// Build the job for one extranonce2 value.
pub fn build_job(notification: &Notification, target: Target, extranonce2: Vec<u8>) -> MiningJob {
    let header = BlockHeader {
        version: notification.version,
        prev_blockhash: notification.prev_blockhash,
        merkle_root: merkle_root(notification, &extranonce2),
        time: notification.ntime,
        bits: notification.bits,
        nonce: 0,
    };

    MiningJob {
        midstate: midstate(&header),
        header,
        target,
        extranonce2,
    }
}

/// Turns the current notification into a stream of distinct jobs.
#[derive(Debug, Default)]
pub struct JobGenerator {
    notification: Option<Arc<Notification>>,
    target: Option<Target>,

    /// Last extranonce2 handed out; `None` until the first job
    extranonce2: Option<u64>,
}

impl JobGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to a new notification.
    ///
    /// Restarts extranonce2 and recomputes the share target. Returns the
    /// notification's clean-jobs flag; when set, queued work from older
    /// notifications is stale and should be flushed.
    pub fn update(&mut self, notification: Arc<Notification>) -> bool {
        let target = notification.difficulty.to_target();
        let clean_jobs = notification.clean_jobs;

        debug!(
            job_id = %notification.job_id,
            difficulty = %notification.difficulty,
            target = %target_hex(target),
            clean_jobs,
            "Generating jobs for new notification"
        );

        self.notification = Some(notification);
        self.target = Some(target);
        self.extranonce2 = None;
        clean_jobs
    }

    pub fn notification(&self) -> Option<&Arc<Notification>> {
        self.notification.as_ref()
    }

    /// The next job, with extranonce2 one higher than the last.
    pub fn next_job(&mut self) -> Result<MiningJob, JobError> {
        let (notification, target) = match (&self.notification, self.target) {
            (Some(notification), Some(target)) => (notification, target),
            _ => return Err(JobError::NoNotification),
        };

        let size = notification.extranonce2_size;
        if size == 0 || size > 8 {
            return Err(JobError::UnsupportedExtranonce2Size(size));
        }
        let max = if size == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * size)) - 1
        };

        let value = match self.extranonce2 {
            None => 0,
            Some(last) => last
                .checked_add(1)
                .filter(|next| *next <= max)
                .ok_or(JobError::Extranonce2Overflow { size })?,
        };
        self.extranonce2 = Some(value);

        let extranonce2 = value.to_be_bytes()[8 - size..].to_vec();
        let job = build_job(notification, target, extranonce2);
        trace!(
            job_id = %notification.job_id,
            extranonce2 = %job.extranonce2_hex(),
            data = %job.data_hex(),
            "Job built"
        );
        Ok(job)
    }
}
