//! Merkle tree implementation for transaction verification
//!
//! Commits a block to its transaction set and produces inclusion proofs
//! that can be checked against the root without scanning the block.
//! Leaves and inner nodes are hex strings; a parent is the SHA-256 of the
//! concatenated hex of its two children.

use super::hash::sha256_hex;
use serde::{Deserialize, Serialize};

/// Hash of two sibling nodes
fn hash_pair(left: &str, right: &str) -> String {
    let mut data = String::with_capacity(left.len() + right.len());
    data.push_str(left);
    data.push_str(right);
    sha256_hex(data.as_bytes())
}

/// Duplicate the last hash when the level has an odd number of nodes
fn pad_to_even(level: &mut Vec<String>) {
    if level.len() % 2 != 0 {
        if let Some(last) = level.last().cloned() {
            level.push(last);
        }
    }
}

/// Calculate the merkle root from a list of hex hashes
pub fn calculate_merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return sha256_hex(b"empty");
    }

    if hashes.len() == 1 {
        return hashes[0].clone();
    }

    let mut level: Vec<String> = hashes.to_vec();
    pad_to_even(&mut level);

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();

        if level.len() > 1 {
            pad_to_even(&mut level);
        }
    }

    level.remove(0)
}

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

/// One step of a merkle proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub position: Position,
}

/// Merkle proof for verifying transaction inclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Sibling hashes ordered from leaf to root
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Build the proof path for the leaf at `index`.
    ///
    /// Returns `None` for an empty set or an out-of-range index. A single
    /// leaf yields an empty path since the leaf is the root.
    pub fn generate(hashes: &[String], index: usize) -> Option<Self> {
        if hashes.is_empty() || index >= hashes.len() {
            return None;
        }

        let mut steps = Vec::new();
        let mut level: Vec<String> = hashes.to_vec();
        let mut current = index;

        if level.len() > 1 {
            pad_to_even(&mut level);
        }

        while level.len() > 1 {
            let step = if current % 2 == 0 {
                ProofStep {
                    hash: level[current + 1].clone(),
                    position: Position::Right,
                }
            } else {
                ProofStep {
                    hash: level[current - 1].clone(),
                    position: Position::Left,
                }
            };
            steps.push(step);

            level = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            current /= 2;

            if level.len() > 1 {
                pad_to_even(&mut level);
            }
        }

        Some(Self { steps })
    }

    /// Verify the proof against a root hash
    pub fn verify(&self, leaf_hash: &str, root_hash: &str) -> bool {
        let mut current = leaf_hash.to_string();

        for step in &self.steps {
            current = match step.position {
                Position::Left => hash_pair(&step.hash, &current),
                Position::Right => hash_pair(&current, &step.hash),
            };
        }

        current == root_hash
    }

    /// Number of levels walked by this proof
    pub fn depth(&self) -> usize {
        self.steps.len()
    }
}

/// Generate an inclusion proof for `hashes[index]`
pub fn merkle_proof(hashes: &[String], index: usize) -> Option<MerkleProof> {
    MerkleProof::generate(hashes, index)
}

/// Check that `leaf_hash` is committed to by `root` through `proof`
pub fn verify_proof(leaf_hash: &str, proof: &MerkleProof, root: &str) -> bool {
    proof.verify(leaf_hash, root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| sha256_hex(format!("tx{}", i).as_bytes()))
            .collect()
    }

    #[test]
    fn test_merkle_root_single() {
        let hashes = leaves(1);
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hashes = leaves(2);
        let expected = sha256_hex(format!("{}{}", hashes[0], hashes[1]).as_bytes());
        assert_eq!(calculate_merkle_root(&hashes), expected);
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let three = leaves(3);
        let mut four = three.clone();
        four.push(three[2].clone());
        assert_eq!(calculate_merkle_root(&three), calculate_merkle_root(&four));
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), sha256_hex(b"empty"));
    }

    #[test]
    fn test_proof_roundtrip_all_sizes() {
        for n in 1..=9 {
            let hashes = leaves(n);
            let root = calculate_merkle_root(&hashes);
            for (i, leaf) in hashes.iter().enumerate() {
                let proof = merkle_proof(&hashes, i).unwrap();
                assert!(verify_proof(leaf, &proof, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf() {
        let hashes = leaves(5);
        let root = calculate_merkle_root(&hashes);
        let proof = merkle_proof(&hashes, 2).unwrap();
        assert!(!verify_proof(&hashes[3], &proof, &root));
        assert!(!verify_proof(&hashes[2], &proof, &sha256_hex(b"other")));
    }

    #[test]
    fn test_proof_out_of_range() {
        assert!(merkle_proof(&leaves(3), 3).is_none());
        assert!(merkle_proof(&[], 0).is_none());
    }

    #[test]
    fn test_single_leaf_proof_is_empty() {
        let hashes = leaves(1);
        let proof = merkle_proof(&hashes, 0).unwrap();
        assert_eq!(proof.depth(), 0);
        assert!(verify_proof(&hashes[0], &proof, &hashes[0]));
    }
}
