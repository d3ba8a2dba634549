//! Proof-of-work check for nonces reported by the chips.
//!
//! The chips report every nonce that meets their own internal threshold,
//! which is far easier than any pool target. Only nonces whose block hash is
//! below the job's share target are worth submitting.

use bitcoin::hashes::Hash;

use crate::tracing::prelude::*;
use crate::types::{Difficulty, MinedWork, StratumSubmission, ValidatedWork};
use crate::u256::U256;

/// Keep the nonces in `work` whose block hash is strictly below the job's
/// target.
///
/// Returns `None` when none qualify.
pub fn validate(work: MinedWork) -> Option<ValidatedWork> {
    let target = U256::from(work.job.target);

    let nonces: Vec<_> = work
        .result
        .nonces()
        .iter()
        .copied()
        .filter(|&nonce| {
            let hash = work.job.header_with_nonce(nonce).block_hash();
            // The digest is a little-endian 256-bit number
            let valid = U256::from_le_bytes(hash.to_byte_array()) < target;

            if valid {
                debug!(
                    job_id = %work.notification.job_id,
                    %nonce,
                    %hash,
                    difficulty = %Difficulty::from_hash(&hash),
                    "Share found"
                );
            } else {
                trace!(job_id = %work.notification.job_id, %nonce, "Nonce below share target");
            }
            valid
        })
        .collect();

    if nonces.is_empty() {
        return None;
    }

    Some(ValidatedWork {
        notification: work.notification,
        job: work.job,
        submission: StratumSubmission { nonces },
    })
}
