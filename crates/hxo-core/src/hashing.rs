//! Content addressing
//!
//! `serde_json::Value` keeps object keys sorted, so serializing a value gives
//! a canonical byte string without extra normalization.

use serde_json::Value;
use sha2::{Digest, Sha256};

const SHARD_ID_DOMAIN: &str = "hxo-shard:v1";

/// Length of a shard id in hex characters
pub const SHARD_ID_LEN: usize = 32;

/// Hex SHA-256 of raw bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of the canonical JSON encoding of a value
pub fn content_hash(value: &Value) -> String {
    sha256_hex(value.to_string().as_bytes())
}

/// Deterministic shard identifier
///
/// Identical (kind, executor, input slice) always collapses to the same id,
/// whichever stage or plan produced it.
pub fn shard_id(kind: &str, executor: &str, input_hash: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [SHARD_ID_DOMAIN, kind, executor, input_hash] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let mut id = hex::encode(hasher.finalize());
    id.truncate(SHARD_ID_LEN);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"a": [2, 1], "b": 1})));
    }

    #[test]
    fn test_shard_id_is_stable() {
        let h = content_hash(&json!({"index": 3}));
        let id = shard_id("deploy.pack", "echo", &h);
        assert_eq!(id.len(), SHARD_ID_LEN);
        assert_eq!(id, shard_id("deploy.pack", "echo", &h));
        assert_ne!(id, shard_id("deploy.prime", "echo", &h));
        assert_ne!(id, shard_id("deploy.pack", "command", &h));
    }

    #[test]
    fn test_shard_id_fields_do_not_run_together() {
        assert_ne!(shard_id("ab", "c", "d"), shard_id("a", "bc", "d"));
    }
}
