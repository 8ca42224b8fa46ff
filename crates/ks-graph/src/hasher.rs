// hasher.rs — SHA-256 hashing utilities.
//
// All hashes in Keystone are SHA-256, hex-encoded: artifact bodies, ledger
// entries and signals. This module provides the shared helpers so every
// crate digests bytes the same way.
//
// SHA-256 produces a 32-byte (256-bit) digest. We encode it as a 64-character
// lowercase hex string for readability and JSON compatibility.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes, returning a lowercase hex-encoded SHA-256 string.
///
/// This is deterministic: the same input always produces the same output.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    // `format!("{:x}", ...)` produces lowercase hex
    format!("{:x}", result)
}

/// Hash a UTF-8 string, returning a lowercase hex-encoded SHA-256 string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash the compact JSON form of a serializable value.
///
/// Struct fields serialize in declaration order and `serde_json::Value`
/// objects are key-sorted, so the same value always yields the same digest.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Short display form of a hash (first 12 hex chars).
pub fn short(hash: &str) -> &str {
    let end = hash.len().min(12);
    &hash[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_determinism() {
        let input = b"hello world";
        assert_eq!(hash_bytes(input), hash_bytes(input));
    }

    #[test]
    fn hash_uniqueness() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn hash_is_hex_encoded_sha256() {
        let hash = hash_str("test");
        assert_eq!(hash.len(), 64);
        assert!(hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn hash_known_value() {
        // SHA-256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        assert_eq!(
            hash_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn json_hash_ignores_map_insertion_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
    }

    #[test]
    fn short_truncates_long_hashes_only() {
        assert_eq!(short("abcdef0123456789"), "abcdef012345");
        assert_eq!(short("abc"), "abc");
    }
}
