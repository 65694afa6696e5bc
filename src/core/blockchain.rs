//! Blockchain implementation
//!
//! `Blockchain` is the single owner of the chain, the mempool, the balance
//! index and the spent set. Every mutation goes through one of its methods,
//! so holding `&mut Blockchain` (in practice the write half of the node's
//! `RwLock`) serialises mining, block admission, chain replacement and
//! transaction admission.

use crate::config::{ChainConfig, CONFIRMATIONS_REQUIRED};
use crate::core::balance::{to_signed, BalanceIndex};
use crate::core::block::{reward_for_height, Block, BlockError};
use crate::core::difficulty::next_difficulty;
use crate::core::transaction::{Transaction, TransactionError};
use crate::core::validator::{validate_chain, BlockContext, BlockValidator, TransactionValidator};
use crate::mining::Mempool;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Space kept free in a template for the header and the coinbase
const BLOCK_HEADER_RESERVE: usize = 1_024;

/// Number of recent blocks used for the fee fallback estimate
const FEE_HISTORY_BLOCKS: usize = 10;

/// Blockchain-related errors
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(BlockError),
    #[error("Invalid chain: {0}")]
    InvalidChain(BlockError),
    #[error("Chain not longer: local {local} blocks, candidate {candidate}")]
    ChainNotLonger { local: usize, candidate: usize },
    #[error("Genesis block mismatch")]
    GenesisMismatch,
    #[error("Transaction rejected: {0}")]
    Transaction(#[from] TransactionError),
}

/// Persisted form of the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub blocks: Vec<Block>,
    pub difficulty: u32,
}

/// Unmined block plus what the miner needs to seal it
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub difficulty: u32,
    pub miner_address: String,
}

/// A confirmed transaction and where it sits in the chain
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub block_index: u64,
    pub confirmations: u64,
}

/// How a history entry moved coins for the queried address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    Sent,
    Received,
    MiningReward,
}

/// One confirmed transaction touching an address
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub block_index: u64,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    pub timestamp: i64,
    /// Transaction id
    pub hash: String,
}

/// Chain statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    pub total_blocks: u64,
    /// Transfers plus coinbase transactions
    pub total_transactions: u64,
    pub total_coins: i64,
    pub difficulty: u32,
    pub mempool_size: usize,
    /// Mean seconds between blocks, genesis excluded
    pub avg_block_time: f64,
    pub spent_tx_count: usize,
}

/// The chain/mempool engine
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    mempool: Mempool,
    spent_txids: HashSet<String>,
    balances: BalanceIndex,
    difficulty: u32,
    config: ChainConfig,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new(ChainConfig::default())
    }
}

impl Blockchain {
    /// Create a chain holding only the genesis block
    pub fn new(config: ChainConfig) -> Self {
        Self {
            blocks: vec![Block::genesis()],
            mempool: Mempool::with_capacity(config.max_mempool_size),
            spent_txids: HashSet::new(),
            balances: BalanceIndex::new(),
            difficulty: config.clamp_difficulty(config.initial_difficulty),
            config,
        }
    }

    /// Create a blockchain pinned to one difficulty
    pub fn with_difficulty(difficulty: u32) -> Self {
        Self::new(ChainConfig::with_difficulty(difficulty))
    }

    /// Restore a chain from a persisted snapshot.
    ///
    /// The snapshot is fully revalidated. A foreign genesis is reported as
    /// `GenesisMismatch`, which callers must treat as fatal.
    pub fn from_snapshot(
        snapshot: ChainSnapshot,
        config: ChainConfig,
    ) -> Result<Self, BlockchainError> {
        let replay = validate_chain(&snapshot.blocks, &config, now_ms()).map_err(|e| match e {
            BlockError::GenesisMismatch => BlockchainError::GenesisMismatch,
            other => BlockchainError::InvalidChain(other),
        })?;

        if replay.difficulty != snapshot.difficulty {
            log::warn!(
                "Snapshot difficulty {} differs from replayed difficulty {}",
                snapshot.difficulty,
                replay.difficulty
            );
        }

        log::info!(
            "Loaded chain of {} blocks (difficulty {})",
            snapshot.blocks.len(),
            replay.difficulty
        );

        Ok(Self {
            blocks: snapshot.blocks,
            mempool: Mempool::with_capacity(config.max_mempool_size),
            spent_txids: replay.spent_txids,
            balances: replay.balances,
            difficulty: replay.difficulty,
            config,
        })
    }

    /// Export the chain for persistence
    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            blocks: self.blocks.clone(),
            difficulty: self.difficulty,
        }
    }

    // =========================================================================
    // Chain access
    // =========================================================================

    /// Get the latest block
    pub fn latest_block(&self) -> &Block {
        self.blocks
            .last()
            .expect("Blockchain should have at least genesis block")
    }

    /// Get blockchain height
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false: the genesis block is never removed
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Get a block by index
    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    /// Up to `max` blocks starting at `from_index`
    pub fn get_blocks_from(&self, from_index: u64, max: usize) -> Vec<Block> {
        let start = usize::try_from(from_index).unwrap_or(usize::MAX);
        self.blocks.iter().skip(start).take(max).cloned().collect()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn spent_txids(&self) -> &HashSet<String> {
        &self.spent_txids
    }

    // =========================================================================
    // Mining
    // =========================================================================

    /// Build an unmined block extending the head.
    ///
    /// Pending transfers are taken by fee, highest first, while they fit
    /// under the count and byte caps. Transfers that are already confirmed
    /// or no longer funded are skipped. The mempool is left untouched: the
    /// selected transfers leave it only once the block is appended.
    pub fn create_block_template(&self, miner_address: &str) -> BlockTemplate {
        let latest = self.latest_block();
        let max_bytes = self
            .config
            .max_block_size
            .saturating_sub(BLOCK_HEADER_RESERVE);

        let mut debits: HashMap<String, i64> = HashMap::new();
        let transactions = self.mempool.select_transactions(
            self.config.max_block_transactions,
            max_bytes,
            |tx| {
                if self.spent_txids.contains(&tx.id()) {
                    return false;
                }
                let reserved = debits.get(&tx.from).copied().unwrap_or(0);
                let available = self.balances.get_balance(&tx.from).saturating_sub(reserved);
                let cost = to_signed(tx.total_cost());
                if available < cost {
                    return false;
                }
                *debits.entry(tx.from.clone()).or_insert(0) += cost;
                true
            },
        );

        let mut block = Block::new(latest.index + 1, latest.hash.clone(), transactions);
        if block.timestamp < latest.timestamp {
            block.timestamp = latest.timestamp;
        }
        block.miner_address = Some(miner_address.to_string());

        BlockTemplate {
            block,
            difficulty: self.difficulty,
            miner_address: miner_address.to_string(),
        }
    }

    /// Mine a block on the calling thread and append it
    pub fn mine_block(&mut self, miner_address: &str) -> Result<Block, BlockchainError> {
        let BlockTemplate {
            mut block,
            difficulty,
            miner_address,
        } = self.create_block_template(miner_address);

        let attempts = block.mine_block(difficulty, &miner_address);
        log::info!(
            "Block {} mined with {} attempts ({} transactions)",
            block.index,
            attempts,
            block.tx_count()
        );

        self.submit_mined_block(block.clone())?;
        Ok(block)
    }

    /// Append a block mined off-lock from a template.
    ///
    /// Fails without touching state when the chain moved on while mining.
    pub fn submit_mined_block(&mut self, block: Block) -> Result<(), BlockchainError> {
        if block.previous_hash != self.latest_block().hash {
            log::info!(
                "Discarding mined block {}: chain head moved to {}",
                block.index,
                self.height()
            );
        }
        self.receive_block(block)
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Validate a block against the head and append it
    pub fn receive_block(&mut self, block: Block) -> Result<(), BlockchainError> {
        let ctx = BlockContext {
            previous: self.latest_block(),
            difficulty: self.difficulty,
            balances: &self.balances,
            spent_txids: &self.spent_txids,
            config: &self.config,
            now_ms: now_ms(),
        };
        BlockValidator::validate(&block, &ctx).map_err(BlockchainError::InvalidBlock)?;

        self.append_block(block);
        Ok(())
    }

    fn append_block(&mut self, block: Block) {
        self.balances.process_block(&block);
        self.spent_txids
            .extend(block.transactions.iter().map(|tx| tx.id()));
        let confirmed = self.mempool.remove_confirmed(&block.transactions);

        log::info!(
            "Appended block {} ({}), {} transactions, {} left the mempool",
            block.index,
            block.hash,
            block.tx_count(),
            confirmed
        );

        self.blocks.push(block);
        self.difficulty = next_difficulty(&self.blocks, self.difficulty, &self.config);
        self.prune_mempool();
    }

    /// Drop pending transfers that a new block made invalid
    fn prune_mempool(&mut self) {
        let spent = &self.spent_txids;
        let balances = &self.balances;
        let mut debits: HashMap<String, i64> = HashMap::new();

        self.mempool.retain(|tx| {
            if spent.contains(&tx.id()) {
                return false;
            }
            let reserved = debits.get(&tx.from).copied().unwrap_or(0);
            let cost = to_signed(tx.total_cost());
            if balances.get_balance(&tx.from).saturating_sub(reserved) < cost {
                log::debug!("Evicting unfunded transaction {}", tx.id());
                return false;
            }
            *debits.entry(tx.from.clone()).or_insert(0) += cost;
            true
        });
    }

    /// Replace the local chain with `candidate` when it is strictly longer
    /// and valid from the shared genesis. Length is the only fork-choice
    /// criterion; cumulative work is not compared.
    pub fn receive_chain(&mut self, candidate: Vec<Block>) -> Result<(), BlockchainError> {
        if candidate.len() <= self.blocks.len() {
            log::debug!(
                "Ignoring chain of {} blocks (local {})",
                candidate.len(),
                self.blocks.len()
            );
            return Err(BlockchainError::ChainNotLonger {
                local: self.blocks.len(),
                candidate: candidate.len(),
            });
        }

        let replay = validate_chain(&candidate, &self.config, now_ms()).map_err(|e| {
            log::warn!("Rejected candidate chain of {} blocks: {}", candidate.len(), e);
            BlockchainError::InvalidChain(e)
        })?;

        log::info!(
            "Replacing chain: {} -> {} blocks",
            self.blocks.len(),
            candidate.len()
        );

        self.blocks = candidate;
        self.balances = replay.balances;
        self.spent_txids = replay.spent_txids;
        self.difficulty = replay.difficulty;
        self.mempool.clear();
        Ok(())
    }

    /// Validate and queue a transaction
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), TransactionError> {
        TransactionValidator {
            balances: &self.balances,
            spent_txids: &self.spent_txids,
            mempool: &self.mempool,
            config: &self.config,
        }
        .validate(&tx)?;

        let id = tx.id();
        self.mempool.add_transaction(tx)?;
        log::info!("Transaction {} added to mempool", id);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Confirmed balance of an address
    pub fn get_balance(&self, address: &str) -> i64 {
        self.balances.get_balance(address)
    }

    /// Confirmed balance minus pending debits
    pub fn get_available_balance(&self, address: &str) -> i64 {
        self.get_balance(address)
            .saturating_sub(to_signed(self.mempool.pending_cost(address)))
    }

    pub fn get_all_balances(&self) -> &HashMap<String, i64> {
        self.balances.get_all_balances()
    }

    /// Revalidate the whole chain from genesis
    pub fn is_chain_valid(&self) -> bool {
        validate_chain(&self.blocks, &self.config, now_ms()).is_ok()
    }

    pub fn get_pending_transactions(&self) -> &[Transaction] {
        self.mempool.transactions()
    }

    /// Find a confirmed transaction (coinbase included) by id
    pub fn get_transaction(&self, txid: &str) -> Option<TransactionRecord> {
        self.blocks.iter().find_map(|block| {
            block
                .coinbase_tx
                .iter()
                .chain(block.transactions.iter())
                .find(|tx| tx.id() == txid)
                .map(|tx| TransactionRecord {
                    transaction: tx.clone(),
                    block_index: block.index,
                    confirmations: self.height() - block.index + 1,
                })
        })
    }

    /// Whether `txid` has at least `CONFIRMATIONS_REQUIRED` confirmations
    pub fn is_confirmed(&self, txid: &str) -> bool {
        self.get_transaction(txid)
            .map(|record| record.confirmations >= CONFIRMATIONS_REQUIRED)
            .unwrap_or(false)
    }

    /// Confirmed transactions sent, received or mined by `address`, oldest
    /// first. Pending transactions are not included.
    pub fn get_transaction_history(&self, address: &str) -> Vec<HistoryEntry> {
        let mut history = Vec::new();

        for block in &self.blocks {
            for tx in block.coinbase_tx.iter().chain(block.transactions.iter()) {
                let kind = if tx.is_coinbase() {
                    if tx.to != address {
                        continue;
                    }
                    HistoryKind::MiningReward
                } else if tx.from == address {
                    HistoryKind::Sent
                } else if tx.to == address {
                    HistoryKind::Received
                } else {
                    continue;
                };

                history.push(HistoryEntry {
                    kind,
                    block_index: block.index,
                    from: tx.from.clone(),
                    to: tx.to.clone(),
                    amount: tx.amount,
                    fee: tx.fee,
                    timestamp: tx.timestamp,
                    hash: tx.id(),
                });
            }
        }

        history
    }

    /// Reward the next block will mint
    pub fn get_block_reward(&self) -> u64 {
        reward_for_height(self.height() + 1)
    }

    /// Suggested fee: median of the pending fees, else the mean transfer fee
    /// over the last few blocks, else zero
    pub fn estimate_fee(&self) -> u64 {
        if let Some(median) = self.mempool.median_fee() {
            return median;
        }

        let recent: Vec<u64> = self
            .blocks
            .iter()
            .rev()
            .take(FEE_HISTORY_BLOCKS)
            .flat_map(|block| block.transactions.iter().map(|tx| tx.fee))
            .collect();

        if recent.is_empty() {
            0
        } else {
            recent.iter().sum::<u64>() / recent.len() as u64
        }
    }

    /// Get chain statistics
    pub fn stats(&self) -> ChainStats {
        let total_transactions: usize = self
            .blocks
            .iter()
            .map(|b| b.tx_count() + usize::from(b.coinbase_tx.is_some()))
            .sum();

        let avg_block_time = match (self.blocks.get(1), self.blocks.last()) {
            (Some(first), Some(last)) if self.blocks.len() > 2 => {
                (last.timestamp - first.timestamp) as f64
                    / (self.blocks.len() - 2) as f64
                    / 1000.0
            }
            _ => 0.0,
        };

        ChainStats {
            total_blocks: self.blocks.len() as u64,
            total_transactions: total_transactions as u64,
            total_coins: self.balances.total_supply(),
            difficulty: self.difficulty,
            mempool_size: self.mempool.len(),
            avg_block_time,
            spent_tx_count: self.spent_txids.len(),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
