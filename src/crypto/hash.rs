//! Cryptographic hashing utilities for the ledger
//!
//! Provides the SHA-256 helpers used for block hashes, transaction IDs
//! and merkle tree calculations, plus the proof-of-work target check.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a lowercase hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Canonical block header hash.
///
/// The fields are pipe-joined in this fixed order; changing any of them
/// changes the hash, which is what the proof-of-work search targets.
pub fn block_hash(
    index: u64,
    previous_hash: &str,
    timestamp: i64,
    nonce: u64,
    merkle_root: &str,
) -> String {
    let data = format!(
        "{}|{}|{}|{}|{}",
        index, previous_hash, timestamp, nonce, merkle_root
    );
    sha256_hex(data.as_bytes())
}

/// Checks if a hex hash meets the difficulty target
/// The hash must start with `difficulty` zero hex characters
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let required = difficulty as usize;
    hash.len() >= required && hash.bytes().take(required).all(|b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            sha256_hex(data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_block_hash_field_sensitivity() {
        let base = block_hash(1, "abc", 1000, 7, "root");
        assert_eq!(base, block_hash(1, "abc", 1000, 7, "root"));
        assert_ne!(base, block_hash(2, "abc", 1000, 7, "root"));
        assert_ne!(base, block_hash(1, "abd", 1000, 7, "root"));
        assert_ne!(base, block_hash(1, "abc", 1001, 7, "root"));
        assert_ne!(base, block_hash(1, "abc", 1000, 8, "root"));
        assert_ne!(base, block_hash(1, "abc", 1000, 7, "toor"));
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("000abc", 3));
        assert!(meets_difficulty("000abc", 2));
        assert!(!meets_difficulty("000abc", 4));
        assert!(meets_difficulty("abc", 0));
        // A target longer than the hash can never be met
        assert!(!meets_difficulty("00", 3));
    }
}
