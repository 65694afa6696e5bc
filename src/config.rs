//! Consensus and resource-limit configuration
//!
//! Every node on a network must run with the same `ChainConfig`: the
//! difficulty schedule and block limits are part of block validity.

use serde::{Deserialize, Serialize};

/// Default mining difficulty (number of leading zero hex characters)
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// Lowest difficulty the retargeting may reach
pub const MIN_DIFFICULTY: u32 = 1;

/// Highest difficulty the retargeting may reach
pub const MAX_DIFFICULTY: u32 = 6;

/// Number of blocks between difficulty adjustments
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;

/// Target block time in milliseconds
pub const TARGET_BLOCK_TIME_MS: i64 = 30_000;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum number of transfers per block (coinbase excluded)
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 100;

/// Maximum serialized transaction size in bytes
pub const MAX_TX_SIZE: usize = 100_000;

/// Default maximum mempool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 5_000;

/// How far ahead of local time a block timestamp may be (2 hours)
pub const MAX_FUTURE_BLOCK_TIME_MS: i64 = 2 * 60 * 60 * 1000;

/// Confirmations after which a transaction counts as settled
pub const CONFIRMATIONS_REQUIRED: u64 = 6;

/// Chain parameters shared by every node on a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    pub difficulty_adjustment_interval: u64,
    pub target_block_time_ms: i64,
    pub max_block_size: usize,
    pub max_block_transactions: usize,
    pub max_transaction_size: usize,
    pub max_mempool_size: usize,
    pub max_future_block_time_ms: i64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: DEFAULT_DIFFICULTY,
            min_difficulty: MIN_DIFFICULTY,
            max_difficulty: MAX_DIFFICULTY,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            target_block_time_ms: TARGET_BLOCK_TIME_MS,
            max_block_size: MAX_BLOCK_SIZE,
            max_block_transactions: MAX_TRANSACTIONS_PER_BLOCK,
            max_transaction_size: MAX_TX_SIZE,
            max_mempool_size: DEFAULT_MEMPOOL_SIZE,
            max_future_block_time_ms: MAX_FUTURE_BLOCK_TIME_MS,
        }
    }
}

impl ChainConfig {
    /// Config whose difficulty starts at and never leaves `difficulty`.
    ///
    /// Used for development networks and tests, where retargeting would
    /// otherwise make mining runs unpredictable.
    pub fn with_difficulty(difficulty: u32) -> Self {
        Self {
            initial_difficulty: difficulty,
            min_difficulty: difficulty,
            max_difficulty: difficulty,
            ..Default::default()
        }
    }

    /// Clamp a difficulty into the configured range
    pub fn clamp_difficulty(&self, difficulty: u32) -> u32 {
        difficulty.clamp(self.min_difficulty, self.max_difficulty)
    }
}
