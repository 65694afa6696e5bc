//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and the canonical block header hash
//! - ECDSA signing primitives (secp256k1)
//! - Merkle tree roots and inclusion proofs

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{block_hash, meets_difficulty, sha256, sha256_hex};
pub use keys::{
    address_from_public_key_hex, decode_canonical_hex, is_valid_address, public_key_from_hex, public_key_to_address,
    sign_message, verify_signature, KeyError, KeyPair, ADDRESS_LENGTH,
};
pub use merkle::{
    calculate_merkle_root, merkle_proof, verify_proof, MerkleProof, Position, ProofStep,
};
