//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Messages follow JSON-RPC with Stratum's conventions: requests carry an
//! `id`, pool pushes carry `"id": null`, and responses carry `result` and
//! `error` side by side.

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Difficulty, Nonce};

/// Work pushed by the pool in `mining.notify`.
///
/// Only the pool-supplied half of a [`crate::types::Notification`]; the
/// session fields are joined in once everything has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub job_id: String,

    pub prev_blockhash: BlockHash,

    /// Coinbase transaction before the extranonces
    pub coinbase1: Vec<u8>,

    /// Coinbase transaction after the extranonces
    pub coinbase2: Vec<u8>,

    pub merkle_branches: Vec<TxMerkleNode>,

    pub version: Version,

    pub bits: CompactTarget,

    /// Block timestamp (Unix epoch seconds)
    pub ntime: u32,

    /// If true, abandon all previous jobs
    pub clean_jobs: bool,
}

impl JobNotification {
    /// Parse from the `mining.notify` params array.
    ///
    /// Manual parsing rather than a serde tuple struct, for error messages
    /// that name the bad field.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_blockhash = parse_block_hash(prev_hash_str)?;

        let coinbase1_str = params[2].as_str().ok_or("coinbase1 not a string")?;
        let coinbase1 = hex::decode(coinbase1_str).map_err(|e| format!("coinbase1 hex: {}", e))?;

        let coinbase2_str = params[3].as_str().ok_or("coinbase2 not a string")?;
        let coinbase2 = hex::decode(coinbase2_str).map_err(|e| format!("coinbase2 hex: {}", e))?;

        let merkle_branches = params[4]
            .as_array()
            .ok_or("merkle_branches not an array")?
            .iter()
            .map(|branch| {
                branch
                    .as_str()
                    .ok_or_else(|| "merkle branch not a string".to_string())
                    .and_then(parse_merkle_node)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let version = Version::from_consensus(parse_hex_u32(&params[5], "version")? as i32);
        let bits = CompactTarget::from_consensus(parse_hex_u32(&params[6], "nbits")?);
        let ntime = parse_hex_u32(&params[7], "ntime")?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            job_id,
            prev_blockhash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            bits,
            ntime,
            clean_jobs,
        })
    }
}

/// Parse an 8-digit big-endian hex field.
fn parse_hex_u32(value: &Value, field: &str) -> Result<u32, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("{} not a string", field))?;
    u32::from_str_radix(s, 16).map_err(|e| format!("{} hex: {}", field, e))
}

/// Parse a block hash in Stratum's word-swapped encoding.
///
/// Stratum sends the hash as eight 4-byte words, each word's bytes reversed
/// relative to Bitcoin's internal order:
///
/// ```text
/// Stratum:  6b6455fd 6db962c1 01f2d4fc 0d67f4a3 bc96391d 00015296 00000000 00000000
/// Internal: fd55646b c162b96d fcd4f201 a3f4670d 1d3996bc 96520100 00000000 00000000
/// Display:  000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd
/// ```
pub fn parse_block_hash(hex: &str) -> Result<BlockHash, String> {
    let mut bytes = hex::decode(hex).map_err(|e| format!("block hash hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| format!("block hash parse: {}", e))
}

/// Parse a merkle branch node. These are sent in internal byte order.
fn parse_merkle_node(hex: &str) -> Result<TxMerkleNode, String> {
    let bytes = hex::decode(hex).map_err(|e| format!("merkle node hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("merkle node wrong length: {}", bytes.len()));
    }
    TxMerkleNode::from_slice(&bytes).map_err(|e| format!("merkle node parse: {}", e))
}

/// Session parameters from the `mining.subscribe` result
/// (`[subscriptions, extranonce1, extranonce2_size]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

impl Subscription {
    pub fn from_result(result: &Value) -> Result<Self, String> {
        let arr = result.as_array().ok_or("subscribe result not an array")?;
        if arr.len() < 3 {
            return Err("subscribe result too short".to_string());
        }

        let extranonce1_str = arr[1].as_str().ok_or("extranonce1 not a string")?;
        let extranonce1 =
            hex::decode(extranonce1_str).map_err(|e| format!("extranonce1 hex: {}", e))?;

        let extranonce2_size = arr[2].as_u64().ok_or("extranonce2_size not a number")? as usize;
        if extranonce2_size == 0 || extranonce2_size > 8 {
            return Err(format!("unsupported extranonce2_size {}", extranonce2_size));
        }

        Ok(Self {
            extranonce1,
            extranonce2_size,
        })
    }
}

/// Parse the `mining.set_difficulty` params (`[difficulty]`).
///
/// Fractional difficulties are kept as sent.
pub fn parse_difficulty(params: &Value) -> Result<Difficulty, String> {
    let value = params
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(Value::as_f64)
        .ok_or("set_difficulty params missing a number")?;

    Difficulty::from_pool_value(value).ok_or_else(|| format!("difficulty {} out of range", value))
}

/// One share for `mining.submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,

    /// Timestamp used (Unix epoch seconds)
    pub ntime: u32,

    pub nonce: Nonce,
}

impl SubmitParams {
    /// `[user, job_id, extranonce2, ntime, nonce]`, the last three as hex.
    pub fn to_stratum_json(&self) -> Value {
        Value::Array(vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(hex::encode(&self.extranonce2)),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(self.nonce.to_string()),
        ])
    }
}

/// JSON-RPC message envelope.
///
/// Requests and pushes share a shape (a push has a null `id`); responses
/// carry `result` and `error` instead of `method`. Pools answer a request
/// they could not parse with a null-`id` error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request {
        /// `None` for pool pushes
        id: Option<u64>,
        method: String,
        params: Value,
    },

    Response {
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::bm1380::test_data::{notify, session, submit};
    use crate::types::target_hex;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_parse_mining_notify() {
        let json = json!({
            "id": null,
            "method": "mining.notify",
            "params": ["job1", "prevhash", "cb1", "cb2", [], "20000000", "1a00ffff", "504e86b9", true]
        });

        let msg: JsonRpcMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(
            msg,
            JsonRpcMessage::Request { id: None, ref method, .. } if method == "mining.notify"
        ));
    }

    #[test]
    fn test_parse_response() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id":11,"error":null,"result":true}"#).unwrap();
        assert_eq!(
            msg,
            JsonRpcMessage::Response {
                id: Some(11),
                result: Some(Value::Bool(true)),
                error: None,
            }
        );
    }

    #[test]
    fn test_parse_error_response_without_id() {
        let msg: JsonRpcMessage = serde_json::from_str(
            r#"{"id":null,"result":null,"error":[20,"Unable to parse request",null]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            JsonRpcMessage::Response {
                id: None,
                result: None,
                error: Some(json!([20, "Unable to parse request", null])),
            }
        );
    }

    #[test]
    fn test_request_serialization() {
        let msg = JsonRpcMessage::request(1, "mining.subscribe", json!([]));
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"id":1,"method":"mining.subscribe","params":[]}"#
        );
    }

    #[test]
    fn test_parse_block_hash_stratum_encoding() {
        let hash = parse_block_hash(notify::PREV_BLOCKHASH).unwrap();

        let bytes = hash.as_byte_array();
        assert_eq!(&bytes[0..4], &[0xfd, 0x55, 0x64, 0x6b]);
        assert_eq!(&bytes[4..8], &[0xc1, 0x62, 0xb9, 0x6d]);
        assert_eq!(
            hash.to_string(),
            "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd"
        );
    }

    #[test_case("deadbeef"; "too_short")]
    #[test_case("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"; "not_hex")]
    fn test_parse_invalid_block_hash(hex: &str) {
        assert!(parse_block_hash(hex).is_err());
    }

    #[test]
    fn test_job_notification_from_capture() {
        let params = json!([
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

        assert_eq!(job.job_id, notify::JOB_ID);
        assert_eq!(job.version, Version::from_consensus(0x20b44000));
        assert_eq!(job.bits, CompactTarget::from_consensus(0x17023a04));
        assert_eq!(job.ntime, 0x685468d7);
        assert_eq!(job.merkle_branches.len(), 12);
        assert_eq!(
            job.merkle_branches[0].as_byte_array().to_vec(),
            hex::decode(notify::MERKLE_BRANCHES[0]).unwrap()
        );
        assert_eq!(job.coinbase1, hex::decode(notify::COINBASE1).unwrap());
        assert_eq!(job.coinbase2, hex::decode(notify::COINBASE2).unwrap());
        assert!(!job.clean_jobs);
    }

    #[test_case(json!(["job1"]); "short")]
    #[test_case(json!(["job1", "00", "aa", "bb", [], "20000000", "1d00ffff", "5a5a5a5a", false]); "short_prev_hash")]
    #[test_case(json!(["job1", notify::PREV_BLOCKHASH, "aa", "bb", ["00"], "20000000", "1d00ffff", "5a5a5a5a", false]); "short_branch")]
    #[test_case(json!(["job1", notify::PREV_BLOCKHASH, "aa", "bb", [], "2000000g", "1d00ffff", "5a5a5a5a", false]); "bad_version")]
    #[test_case(json!(["job1", notify::PREV_BLOCKHASH, "aa", "bb", [], "20000000", "1d00ffff", "5a5a5a5a", "yes"]); "clean_jobs_not_bool")]
    fn test_job_notification_rejects(params: Value) {
        assert!(JobNotification::from_stratum_params(params.as_array().unwrap()).is_err());
    }

    #[test]
    fn test_subscription_from_result() {
        let result = json!([[["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"]], session::EXTRANONCE1, 4]);
        let sub = Subscription::from_result(&result).unwrap();
        assert_eq!(sub.extranonce1, vec![0x41, 0x28, 0x06, 0x4f]);
        assert_eq!(sub.extranonce2_size, session::EXTRANONCE2_SIZE);

        assert!(Subscription::from_result(&json!([[], "4128064f"])).is_err());
        assert!(Subscription::from_result(&json!([[], "4128064f", 0])).is_err());
    }

    #[test_case(json!([8192]) => Ok(Difficulty::new(8192)); "integer")]
    #[test_case(json!([512.0]) => Ok(Difficulty::new(512)); "integral_float")]
    fn test_parse_difficulty(params: Value) -> Result<Difficulty, String> {
        parse_difficulty(&params)
    }

    #[test_case(json!([1.5]), "00000000aaaa0000000000000000000000000000000000000000000000000000"; "one_and_a_half")]
    #[test_case(json!([0.5]), "00000001fffe0000000000000000000000000000000000000000000000000000"; "half")]
    fn test_parse_fractional_difficulty(params: Value, expected_target: &str) {
        let difficulty = parse_difficulty(&params).unwrap();
        assert_eq!(target_hex(difficulty.to_target()), expected_target);
    }

    #[test_case(json!([]); "empty")]
    #[test_case(json!(["8192"]); "string")]
    #[test_case(json!([0]); "zero")]
    fn test_parse_difficulty_rejects(params: Value) {
        assert!(parse_difficulty(&params).is_err());
    }

    #[test]
    fn test_submit_params_match_capture() {
        let params = SubmitParams {
            username: "worker".to_string(),
            job_id: notify::JOB_ID.to_string(),
            extranonce2: hex::decode(submit::EXTRANONCE2).unwrap(),
            ntime: 0x685468d7,
            nonce: submit::NONCE.parse().unwrap(),
        };

        assert_eq!(
            params.to_stratum_json(),
            json!(["worker", "875b4b7", "17000000", "685468d7", "7552034c"])
        );
    }
}
