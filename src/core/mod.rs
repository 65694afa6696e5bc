//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (account model, signed transfers, coinbase)
//! - Blocks (proof of work, merkle commitment, reward schedule)
//! - Difficulty retargeting
//! - Validators for transactions, blocks and whole chains
//! - The balance index
//! - Blockchain (the chain/mempool engine)

pub mod balance;
pub mod block;
pub mod blockchain;
pub mod difficulty;
pub mod transaction;
pub mod validator;

pub use balance::BalanceIndex;
pub use block::{
    reward_for_height, Block, BlockError, GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP,
    HALVING_INTERVAL, INITIAL_REWARD,
};
pub use blockchain::{
    BlockTemplate, Blockchain, BlockchainError, ChainSnapshot, ChainStats, HistoryEntry,
    HistoryKind, TransactionRecord,
};
pub use difficulty::next_difficulty;
pub use transaction::{
    coinbase_commitment, derive_txid, Transaction, TransactionError, TransactionType,
    COINBASE_SENDER,
};
pub use validator::{
    check_stateless, validate_chain, BlockContext, BlockValidator, ReplayedChain,
    TransactionValidator,
};
