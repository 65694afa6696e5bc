//! pow-ledger: a proof-of-work account ledger node in Rust
//!
//! This crate provides:
//! - Proof of Work blocks with periodic difficulty retargeting
//! - ECDSA-signed transfers (secp256k1) over an account balance model
//! - Merkle commitments and inclusion proofs
//! - A fee-ordered mempool and a miner that runs off the chain lock
//! - Longest-valid-chain replacement
//! - P2P relay with partial and full chain sync
//! - JSON chain snapshots
//!
//! # Example
//!
//! ```rust
//! use pow_ledger::core::{Blockchain, Transaction};
//! use pow_ledger::crypto::KeyPair;
//!
//! let mut blockchain = Blockchain::with_difficulty(1);
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! blockchain.mine_block(&alice.address()).unwrap();
//! assert_eq!(blockchain.get_balance(&alice.address()), 16);
//!
//! let mut tx = Transaction::new(&alice.address(), &bob.address(), 5, 1);
//! tx.sign(&alice).unwrap();
//! blockchain.add_transaction(tx).unwrap();
//! assert_eq!(blockchain.get_available_balance(&alice.address()), 10);
//!
//! blockchain.mine_block(&alice.address()).unwrap();
//! assert_eq!(blockchain.get_balance(&alice.address()), 27);
//! assert_eq!(blockchain.get_balance(&bob.address()), 5);
//! ```

pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use config::ChainConfig;
pub use core::{Block, Blockchain, BlockchainError, Transaction, TransactionError};
pub use crypto::KeyPair;
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeConfig};
pub use storage::Storage;
