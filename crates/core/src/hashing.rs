//! Content hashing for lock identifiers and request fingerprints

use crate::errors::{CacheError, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash any serializable value into a lowercase SHA-256 hex digest
///
/// Strings hash their raw bytes. Every other value hashes its JSON text;
/// object keys are sorted, so structurally equal values collide.
pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| CacheError::encode("<hash input>", e.to_string()))?;
    Ok(hash_value(&value))
}

/// Hash an already-converted JSON value
pub fn hash_value(value: &Value) -> String {
    match value {
        Value::String(s) => hash_bytes(s.as_bytes()),
        other => hash_bytes(other.to_string().as_bytes()),
    }
}

/// Hash raw bytes
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_string_hashes_raw_bytes() {
        // sha256("abc")
        assert_eq!(
            hash("abc").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_number_hashes_json_text() {
        assert_eq!(hash(&42).unwrap(), hash_bytes(b"42"));
        assert_eq!(hash(&true).unwrap(), hash_bytes(b"true"));
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut a = HashMap::new();
        a.insert("zeta", 1);
        a.insert("alpha", 2);
        let b = json!({"alpha": 2, "zeta": 1});
        assert_eq!(hash(&a).unwrap(), hash(&b).unwrap());
    }

    #[test]
    fn test_digest_shape() {
        let digest = hash(&json!({"path": "/users", "query": null})).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(s in ".*") {
            prop_assert_eq!(hash(&s).unwrap(), hash(&s.clone()).unwrap());
        }
    }
}
