//! Block implementation for the ledger
//!
//! A block commits to its transactions through a merkle root and is sealed
//! by a proof-of-work nonce over the canonical header hash.

use crate::core::transaction::{coinbase_commitment, Transaction};
use crate::crypto::{block_hash, calculate_merkle_root, meets_difficulty, merkle_proof, MerkleProof};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Block Constants
// =============================================================================

/// Reward paid by the first block after genesis
pub const INITIAL_REWARD: u64 = 16;

/// Number of blocks between reward halvings
pub const HALVING_INTERVAL: u64 = 50;

/// Fixed timestamp of the genesis block (Unix milliseconds)
pub const GENESIS_TIMESTAMP: i64 = 1_640_000_000_000;

/// Previous-hash marker of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

// =============================================================================
// Block Errors
// =============================================================================

/// Block validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid block hash")]
    InvalidBlockHash,
    #[error("Insufficient proof of work for difficulty {0}")]
    InvalidProofOfWork(u32),
    #[error("Block too large: {0} bytes (max: {1})")]
    BlockTooLarge(usize, usize),
    #[error("Too many transactions: {0} (max: {1})")]
    TooManyTransactions(usize, usize),
    #[error("Invalid merkle root")]
    InvalidMerkleRoot,
    #[error("Invalid index: expected {expected}, got {got}")]
    InvalidIndex { expected: u64, got: u64 },
    #[error("Invalid previous hash")]
    InvalidPreviousHash,
    #[error("Block timestamp {0} is too far in the future")]
    TimestampTooFar(i64),
    #[error("Block timestamp {0} is before its predecessor")]
    TimestampBeforePrevious(i64),
    #[error("Invalid coinbase amount: expected {expected}, got {got}")]
    InvalidCoinbaseAmount { expected: u64, got: u64 },
    #[error("Invalid coinbase recipient: {0}")]
    InvalidCoinbaseRecipient(String),
    #[error("Invalid transaction {0}: {1}")]
    InvalidTransaction(String, String),
    #[error("Transaction {0} appears twice")]
    DuplicateTransaction(String),
    #[error("Transaction {0} is already confirmed")]
    AlreadySpent(String),
    #[error("Sender {0} cannot cover transaction {1}")]
    InsufficientFunds(String, String),
    #[error("Empty chain")]
    EmptyChain,
    #[error("Genesis block mismatch")]
    GenesisMismatch,
}

/// Reward minted by the block at `height`, halving every `HALVING_INTERVAL`
/// blocks until it shifts out to zero
pub fn reward_for_height(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= u64::BITS as u64 {
        return 0;
    }
    INITIAL_REWARD >> halvings
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Zero-based height
    pub index: u64,
    /// Hash of the predecessor (`"0"` for genesis)
    pub previous_hash: String,
    /// Creation time (Unix milliseconds)
    pub timestamp: i64,
    /// Proof-of-work nonce
    pub nonce: u64,
    /// Canonical header hash; always recomputed before it is trusted
    pub hash: String,
    /// Merkle root over the coinbase commitment and transfer ids
    pub merkle_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase_tx: Option<Transaction>,
    /// Transfers included in this block (coinbase excluded)
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub total_fees: u64,
}

impl Block {
    /// Create a new unmined block
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction>) -> Self {
        let total_fees = transactions.iter().map(|tx| tx.fee).sum();
        let mut block = Self {
            index,
            previous_hash,
            timestamp: Utc::now().timestamp_millis(),
            nonce: 0,
            hash: String::new(),
            merkle_root: String::new(),
            miner_address: None,
            coinbase_tx: None,
            transactions,
            total_fees,
        };
        block.merkle_root = block.calculate_merkle_root();
        block.hash = block.calculate_hash();
        block
    }

    /// The hard-coded genesis block, identical on every node
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            timestamp: GENESIS_TIMESTAMP,
            nonce: 0,
            hash: String::new(),
            merkle_root: calculate_merkle_root(&[]),
            miner_address: None,
            coinbase_tx: None,
            transactions: Vec::new(),
            total_fees: 0,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Calculate the canonical header hash
    pub fn calculate_hash(&self) -> String {
        block_hash(
            self.index,
            &self.previous_hash,
            self.timestamp,
            self.nonce,
            &self.merkle_root,
        )
    }

    /// Sum of the transfer fees in this block
    pub fn calculate_fees(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }

    /// Commitment hash of the coinbase, bound to this block's height
    pub fn coinbase_commitment(&self) -> Option<String> {
        self.coinbase_tx
            .as_ref()
            .map(|cb| coinbase_commitment(&cb.to, cb.amount, self.index))
    }

    /// Merkle leaves: coinbase commitment first, then transfer ids
    pub fn transaction_hashes(&self) -> Vec<String> {
        self.coinbase_commitment()
            .into_iter()
            .chain(self.transactions.iter().map(|tx| tx.id()))
            .collect()
    }

    /// Calculate the merkle root from the block contents
    pub fn calculate_merkle_root(&self) -> String {
        calculate_merkle_root(&self.transaction_hashes())
    }

    /// Seal the block: attach the coinbase and search for a nonce.
    ///
    /// Monopolises the calling thread until a hash meeting `difficulty` is
    /// found. Returns the number of hashes tried.
    pub fn mine_block(&mut self, difficulty: u32, miner_address: &str) -> u64 {
        self.total_fees = self.calculate_fees();
        let reward = reward_for_height(self.index).saturating_add(self.total_fees);
        let mut coinbase = Transaction::coinbase(miner_address, reward, self.index);
        coinbase.timestamp = self.timestamp;

        self.miner_address = Some(miner_address.to_string());
        self.coinbase_tx = Some(coinbase);
        self.merkle_root = self.calculate_merkle_root();

        let mut attempts = 1u64;
        self.nonce = 0;
        loop {
            self.hash = self.calculate_hash();
            if meets_difficulty(&self.hash, difficulty) {
                return attempts;
            }
            self.nonce = self.nonce.wrapping_add(1);
            attempts += 1;
        }
    }

    /// Check the stored hash against a recomputation
    pub fn verify_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Check the proof of work against `difficulty`
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        self.merkle_root == self.calculate_merkle_root()
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }

    /// Number of transfers (coinbase excluded)
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Inclusion proof for a transfer id against this block's merkle root
    pub fn transaction_proof(&self, txid: &str) -> Option<MerkleProof> {
        let leaves = self.transaction_hashes();
        let position = leaves.iter().position(|leaf| leaf == txid)?;
        merkle_proof(&leaves, position)
    }

    /// Whether `txid` is committed to by this block's merkle root
    pub fn contains_transaction(&self, txid: &str) -> bool {
        self.transaction_proof(txid)
            .map(|proof| proof.verify(txid, &self.merkle_root))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn miner() -> String {
        "a".repeat(64)
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, "0");
        assert_eq!(genesis.timestamp, GENESIS_TIMESTAMP);
        assert_eq!(genesis.merkle_root, calculate_merkle_root(&[]));
        assert!(genesis.verify_hash());
        assert_eq!(genesis, Block::genesis());
        assert_eq!(
            serde_json::to_string(&genesis).unwrap(),
            serde_json::to_string(&Block::genesis()).unwrap()
        );
    }

    #[test]
    fn test_reward_halving() {
        assert!((0..50).all(|h| reward_for_height(h) == 16));
        assert!((50..100).all(|h| reward_for_height(h) == 8));
        assert!((100..150).all(|h| reward_for_height(h) == 4));
        assert_eq!(reward_for_height(250), 0);
        assert_eq!(reward_for_height(u64::MAX), 0);
    }

    #[test]
    fn test_block_mining() {
        let genesis = Block::genesis();
        let mut block = Block::new(1, genesis.hash.clone(), vec![]);
        let attempts = block.mine_block(2, &miner());

        assert!(attempts >= 1);
        assert!(block.hash.starts_with("00"));
        assert!(block.verify_hash());
        assert!(block.verify_merkle_root());

        let coinbase = block.coinbase_tx.as_ref().unwrap();
        assert_eq!(coinbase.amount, 16);
        assert_eq!(coinbase.to, miner());
    }

    #[test]
    fn test_coinbase_includes_fees() {
        let alice = KeyPair::generate();
        let mut tx = Transaction::new(&alice.address(), &"b".repeat(64), 5, 3);
        tx.sign(&alice).unwrap();

        let mut block = Block::new(1, Block::genesis().hash, vec![tx]);
        block.mine_block(1, &miner());

        assert_eq!(block.total_fees, 3);
        assert_eq!(block.coinbase_tx.as_ref().unwrap().amount, 19);
    }

    #[test]
    fn test_merkle_root_verification() {
        let alice = KeyPair::generate();
        let mut tx = Transaction::new(&alice.address(), &"b".repeat(64), 5, 1);
        tx.sign(&alice).unwrap();

        let mut block = Block::new(1, Block::genesis().hash, vec![tx]);
        block.mine_block(1, &miner());
        assert!(block.verify_merkle_root());

        block.transactions[0].txid = Some("tampered".to_string());
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_coinbase_commitment_binds_amount() {
        let mut block = Block::new(1, Block::genesis().hash, vec![]);
        block.mine_block(1, &miner());

        if let Some(coinbase) = block.coinbase_tx.as_mut() {
            coinbase.amount = 1_000;
        }
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_block_hash_verification() {
        let mut block = Block::genesis();
        assert!(block.verify_hash());

        block.nonce += 1;
        assert!(!block.verify_hash());
    }

    #[test]
    fn test_transaction_proof() {
        let alice = KeyPair::generate();
        let txs: Vec<Transaction> = (0..3)
            .map(|i| {
                let mut tx = Transaction::new(&alice.address(), &"b".repeat(64), i + 1, 0);
                tx.sign(&alice).unwrap();
                tx
            })
            .collect();
        let ids: Vec<String> = txs.iter().map(|tx| tx.id()).collect();

        let mut block = Block::new(1, Block::genesis().hash, txs);
        block.mine_block(1, &miner());

        for id in &ids {
            assert!(block.contains_transaction(id));
        }
        assert!(!block.contains_transaction(&"c".repeat(64)));
    }
}
