//! Known-good vectors for job synthesis, job frames and share validation.
//!
//! The pool exchange comes from a Bitaxe capture that ended in an accepted
//! share:
//!
//! ```text
//! rx: {"id":null,"method":"mining.notify","params":["875b4b7",
//!      "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000",
//!      "0200...6f6f6c","ffff...00000000",[...12 branches...],
//!      "20000000","17023a04","685468d7",false]}
//! tx: {"id": 11, "method": "mining.submit", "params": ["bc1q...bitaxe",
//!      "875b4b7", "17000000", "685468d7", "7552034c", "00b44000"]}
//! rx: {"id":11,"error":null,"result":true}
//! ```
//!
//! That miner rolled version bits (`00b44000`). This one does not, so the
//! vectors use the rolled version `20b44000` as if the pool had sent it
//! directly; every other field is as captured. The derived values (data,
//! midstate, job frame, hash) were computed independently of this crate.

/// Fields of the `mining.notify` push
pub mod notify {
    pub const JOB_ID: &str = "875b4b7";

    pub const PREV_BLOCKHASH: &str =
        "6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000";

    pub const COINBASE1: &str = "02000000010000000000000000000000000000000000000000000000000000000000000000ffffffff170330c30d5075626c69632d506f6f6c";

    pub const COINBASE2: &str = "ffffffff02e5b5c61200000000220020984a77c289084ff2d434c316bdada021c6c183d507c8a20d3b159b09ac02fe280000000000000000266a24aa21a9edb98ee50410ed4abd48401ed484fc874409d086a3faf0816136a8ad6168314c5800000000";

    pub const MERKLE_BRANCHES: [&str; 12] = [
        "21af451ddb51e887ff1feb5592b87290098565035eb8500031aedcc776d4e72a",
        "c5af269519c809a9546d5a58ca6445d3dbb80cb7045448ecc48309af034da8f8",
        "fb9f8f9959f6bb0ceb63fa53aed1d5a615c6b6d3f50a468ea89a45a1234bda74",
        "a4f4fee8e5fc19ca8d93e67b9236c37ddb864982010434745c0abfe9b914980c",
        "33092206642744fbe5499c3e621cd5c6b52733e54fbebd869f070082b807f740",
        "3b857e32c5cff4864efab967b9a456ca03b2167ab96bd9076ce294c8a67a7fe2",
        "881a07cd881d0c3e590b4b090ea8d58e1439dc56c63686f7de23c47045441e30",
        "315e4dbcc8e7b1c9d594a73978268791880dddb2c26eec8e75768668dad99d80",
        "69952b77c632be16b1ac7ac7048f13d4e962b2e215d79a343f01e6e281d7c304",
        "fc63eb4392c4d6c6d689788875fca35143fdcd4f4a82e8698e0e441751a70b4a",
        "09e419bbe20aa3a7640f1b91f50599ceddff899e90d3f18951ad5418c4850a6b",
        "004978aa346b4f1880bcadb3ca3792d771ee6aeca427f61e74baba44b75cfb88",
    ];

    /// Captured version with the rolled bits folded in
    pub const VERSION: &str = "20b44000";

    pub const NBITS: &str = "17023a04";

    pub const NTIME: &str = "685468d7";

    pub const CLEAN_JOBS: bool = false;
}

/// Session values from `mining.subscribe` and `mining.set_difficulty`
pub mod session {
    pub const EXTRANONCE1: &str = "4128064f";

    pub const EXTRANONCE2_SIZE: usize = 4;

    pub const DIFFICULTY: u64 = 8192;
}

/// Fields of the accepted `mining.submit`
pub mod submit {
    /// Extranonce2 counter value 0x17000000
    pub const EXTRANONCE2: &str = "17000000";

    pub const NONCE: &str = "7552034c";
}

/// Values derived from the capture
pub mod derived {
    /// Merkle root in raw (internal) byte order
    pub const MERKLE_ROOT: &str =
        "06ddf5f08c36414b95ea54db71a0c28761a98bcf6355919e044f88725519a7cb";

    /// Header with zero nonce in word-swapped data layout
    pub const DATA: &str = "20b440006b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000f0f5dd064b41368cdb54ea9587c2a071cf8ba9619e91556372884f04cba71955685468d717023a0400000000";

    /// Midstate with each state word stored little-endian
    pub const MIDSTATE: &str = "7e8b11cc7c8fb55639b96de6fb20f8a2b4c481eed66dba1b7d5f0664a4de3bfb";

    /// Job frame for this job in slot 5
    pub const JOB_FRAME_SLOT_5: &str = "fb3bdea464065f7d1bba6dd6ee81c4b4a2f820fbe66db93956b58f7ccc118b7e0000000000000000000000000000000000000005043a0217d76854685519a7cb";

    /// Block hash with the submitted nonce, display order
    pub const BLOCK_HASH: &str = "0000000000023704cface997bcf7388694ea43dae96c51d80658687a7d8827fe";

    /// Share difficulty of that hash
    pub const HASH_DIFFICULTY: u64 = 29588;
}

/// Calibration job the chain hashes at bring-up
pub mod calibration {
    /// Wire bytes of the nonce every chip should report for the golden frame
    pub const NONCE_WIRE_BYTES: [u8; 4] = [0x00, 0x01, 0x87, 0xa2];
}

/// The captured `mining.notify` joined with the captured session.
pub fn capture_notification() -> crate::types::Notification {
    use crate::stratum_v1::{JobNotification, NotificationAssembler, Subscription};
    use crate::types::Difficulty;

    let params = serde_json::json!([
        notify::JOB_ID,
        notify::PREV_BLOCKHASH,
        notify::COINBASE1,
        notify::COINBASE2,
        notify::MERKLE_BRANCHES.to_vec(),
        notify::VERSION,
        notify::NBITS,
        notify::NTIME,
        notify::CLEAN_JOBS
    ]);
    let job = JobNotification::from_stratum_params(params.as_array().unwrap()).unwrap();

    let mut assembler = NotificationAssembler::new();
    assembler.set_subscription(Subscription {
        extranonce1: hex::decode(session::EXTRANONCE1).unwrap(),
        extranonce2_size: session::EXTRANONCE2_SIZE,
    });
    assembler.set_authorized();
    assembler.set_difficulty(Difficulty::new(session::DIFFICULTY));
    assembler.set_job(job);
    assembler.take_ready().unwrap()
}
