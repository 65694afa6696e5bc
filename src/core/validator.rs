//! Transaction and block validation pipelines
//!
//! Each rule is a small function returning `Result<(), E>`; the pipelines
//! chain them with `?` so the first failing rule rejects. Every failure is
//! logged once at `warn` with the reason.

use crate::config::ChainConfig;
use crate::core::balance::{to_signed, BalanceIndex};
use crate::core::block::{reward_for_height, Block, BlockError};
use crate::core::difficulty::next_difficulty;
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::is_valid_address;
use crate::mining::Mempool;
use std::collections::{HashMap, HashSet};

// =============================================================================
// Transaction validation
// =============================================================================

/// Admission checks for a transaction entering the mempool
pub struct TransactionValidator<'a> {
    pub balances: &'a BalanceIndex,
    pub spent_txids: &'a HashSet<String>,
    pub mempool: &'a Mempool,
    pub config: &'a ChainConfig,
}

impl<'a> TransactionValidator<'a> {
    /// Run every rule in order
    pub fn validate(&self, tx: &Transaction) -> Result<(), TransactionError> {
        check_amount(tx)?;
        check_addresses(tx)?;
        self.check_not_duplicate(tx)?;
        check_signature(tx)?;
        self.check_balance(tx)?;
        check_size(tx, self.config.max_transaction_size)?;
        Ok(())
    }

    fn check_not_duplicate(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let id = tx.id();
        if self.spent_txids.contains(&id) {
            log::warn!("Transaction {} rejected: already confirmed", id);
            return Err(TransactionError::DoubleSpend(id));
        }
        if self.mempool.is_duplicate(tx) {
            log::warn!("Transaction {} rejected: already pending", id);
            return Err(TransactionError::DuplicateTransaction(id));
        }
        Ok(())
    }

    /// Pending debits of the sender are reserved against its balance
    fn check_balance(&self, tx: &Transaction) -> Result<(), TransactionError> {
        let available = self
            .balances
            .get_balance(&tx.from)
            .saturating_sub(to_signed(self.mempool.pending_cost(&tx.from)));
        let needed = tx.total_cost();
        if available < to_signed(needed) {
            log::warn!(
                "Transaction {} rejected: {} needs {}, has {} available",
                tx.id(),
                tx.from,
                needed,
                available
            );
            return Err(TransactionError::InsufficientBalance { needed, available });
        }
        Ok(())
    }
}

/// Rules that need no ledger state: amount, addresses and signature
pub fn check_stateless(tx: &Transaction) -> Result<(), TransactionError> {
    check_amount(tx)?;
    check_addresses(tx)?;
    check_signature(tx)
}

fn check_amount(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.amount == 0 {
        log::warn!("Transaction {} rejected: amount must be positive", tx.id());
        return Err(TransactionError::InvalidAmount(tx.amount));
    }
    Ok(())
}

fn check_addresses(tx: &Transaction) -> Result<(), TransactionError> {
    for address in [&tx.from, &tx.to] {
        if !is_valid_address(address) {
            log::warn!(
                "Transaction {} rejected: malformed address {}",
                tx.id(),
                address
            );
            return Err(TransactionError::InvalidAddress(address.clone()));
        }
    }
    if tx.from == tx.to {
        log::info!("Transaction {} sends to its own sender {}", tx.id(), tx.from);
    }
    Ok(())
}

fn check_signature(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.is_coinbase() {
        return Ok(());
    }
    if !tx.is_valid() {
        log::warn!("Transaction {} rejected: invalid signature", tx.id());
        return Err(TransactionError::InvalidSignature);
    }
    Ok(())
}

fn check_size(tx: &Transaction, max: usize) -> Result<(), TransactionError> {
    let size = tx.size();
    if size > max {
        log::warn!("Transaction {} rejected: {} bytes", tx.id(), size);
        return Err(TransactionError::TransactionTooLarge(size, max));
    }
    Ok(())
}

// =============================================================================
// Block validation
// =============================================================================

/// Ledger state a candidate block is validated against
pub struct BlockContext<'a> {
    /// Block the candidate must extend
    pub previous: &'a Block,
    /// Difficulty in force for the candidate
    pub difficulty: u32,
    /// Balances before the candidate is applied
    pub balances: &'a BalanceIndex,
    /// Transfer ids already confirmed
    pub spent_txids: &'a HashSet<String>,
    pub config: &'a ChainConfig,
    /// Local wall clock (Unix milliseconds)
    pub now_ms: i64,
}

/// Acceptance checks for a block extending the chain
pub struct BlockValidator;

impl BlockValidator {
    /// Run every rule in order against `ctx`
    pub fn validate(block: &Block, ctx: &BlockContext<'_>) -> Result<(), BlockError> {
        let result = Self::run_rules(block, ctx);
        if let Err(e) = &result {
            log::warn!("Block {} ({}) rejected: {}", block.index, block.hash, e);
        }
        result
    }

    fn run_rules(block: &Block, ctx: &BlockContext<'_>) -> Result<(), BlockError> {
        check_hash(block)?;
        check_proof_of_work(block, ctx.difficulty)?;
        check_limits(block, ctx.config)?;
        check_merkle_root(block)?;
        check_linkage(block, ctx.previous)?;
        check_timestamp(block, ctx.previous, ctx.now_ms, ctx.config)?;
        check_coinbase(block)?;
        check_transfers(block, ctx.spent_txids)?;
        check_funding(block, ctx.balances)?;
        Ok(())
    }
}

fn check_hash(block: &Block) -> Result<(), BlockError> {
    if !block.verify_hash() {
        return Err(BlockError::InvalidBlockHash);
    }
    Ok(())
}

fn check_proof_of_work(block: &Block, difficulty: u32) -> Result<(), BlockError> {
    if !block.meets_difficulty(difficulty) {
        return Err(BlockError::InvalidProofOfWork(difficulty));
    }
    Ok(())
}

fn check_limits(block: &Block, config: &ChainConfig) -> Result<(), BlockError> {
    let count = block.tx_count();
    if count > config.max_block_transactions {
        return Err(BlockError::TooManyTransactions(
            count,
            config.max_block_transactions,
        ));
    }
    let size = block.size();
    if size > config.max_block_size {
        return Err(BlockError::BlockTooLarge(size, config.max_block_size));
    }
    Ok(())
}

fn check_merkle_root(block: &Block) -> Result<(), BlockError> {
    if !block.verify_merkle_root() {
        return Err(BlockError::InvalidMerkleRoot);
    }
    Ok(())
}

fn check_linkage(block: &Block, previous: &Block) -> Result<(), BlockError> {
    let expected = previous.index + 1;
    if block.index != expected {
        return Err(BlockError::InvalidIndex {
            expected,
            got: block.index,
        });
    }
    if block.previous_hash != previous.hash {
        return Err(BlockError::InvalidPreviousHash);
    }
    Ok(())
}

fn check_timestamp(
    block: &Block,
    previous: &Block,
    now_ms: i64,
    config: &ChainConfig,
) -> Result<(), BlockError> {
    if block.timestamp > now_ms.saturating_add(config.max_future_block_time_ms) {
        return Err(BlockError::TimestampTooFar(block.timestamp));
    }
    if block.timestamp < previous.timestamp {
        return Err(BlockError::TimestampBeforePrevious(block.timestamp));
    }
    Ok(())
}

fn check_coinbase(block: &Block) -> Result<(), BlockError> {
    let coinbase = match &block.coinbase_tx {
        Some(cb) => cb,
        None => return Ok(()),
    };

    let expected = reward_for_height(block.index).saturating_add(block.calculate_fees());
    if coinbase.amount != expected {
        return Err(BlockError::InvalidCoinbaseAmount {
            expected,
            got: coinbase.amount,
        });
    }
    if !coinbase.is_coinbase() || !is_valid_address(&coinbase.to) {
        return Err(BlockError::InvalidCoinbaseRecipient(coinbase.to.clone()));
    }
    Ok(())
}

/// Every transfer is well formed, unique in the block and not yet confirmed
fn check_transfers(block: &Block, spent_txids: &HashSet<String>) -> Result<(), BlockError> {
    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let id = tx.id();
        if tx.is_coinbase() {
            return Err(BlockError::InvalidTransaction(
                id,
                "coinbase outside the coinbase slot".to_string(),
            ));
        }
        check_stateless(tx).map_err(|e| BlockError::InvalidTransaction(id.clone(), e.to_string()))?;
        if spent_txids.contains(&id) {
            return Err(BlockError::AlreadySpent(id));
        }
        if !seen.insert(id.clone()) {
            return Err(BlockError::DuplicateTransaction(id));
        }
    }
    Ok(())
}

/// Senders cover their transfers, counting earlier transfers in the block.
/// The block's own coinbase is not spendable inside it.
fn check_funding(block: &Block, balances: &BalanceIndex) -> Result<(), BlockError> {
    let mut deltas: HashMap<&str, i64> = HashMap::new();
    for tx in &block.transactions {
        let available = balances
            .get_balance(&tx.from)
            .saturating_add(deltas.get(tx.from.as_str()).copied().unwrap_or(0));
        if available < to_signed(tx.total_cost()) {
            return Err(BlockError::InsufficientFunds(tx.from.clone(), tx.id()));
        }
        let sender = deltas.entry(tx.from.as_str()).or_insert(0);
        *sender = sender.saturating_sub(to_signed(tx.total_cost()));
        let recipient = deltas.entry(tx.to.as_str()).or_insert(0);
        *recipient = recipient.saturating_add(to_signed(tx.amount));
    }
    Ok(())
}

// =============================================================================
// Chain validation
// =============================================================================

/// Ledger state rebuilt while validating a whole chain
#[derive(Debug, Clone)]
pub struct ReplayedChain {
    /// Difficulty in force after the last block
    pub difficulty: u32,
    pub balances: BalanceIndex,
    pub spent_txids: HashSet<String>,
}

/// Validate a chain from genesis, replaying difficulty, balances and the
/// spent set so each block is checked against the state it extended
pub fn validate_chain(
    blocks: &[Block],
    config: &ChainConfig,
    now_ms: i64,
) -> Result<ReplayedChain, BlockError> {
    let genesis = blocks.first().ok_or_else(|| {
        log::warn!("Chain rejected: empty");
        BlockError::EmptyChain
    })?;
    if *genesis != Block::genesis() {
        log::warn!("Chain rejected: genesis {} does not match", genesis.hash);
        return Err(BlockError::GenesisMismatch);
    }

    let mut difficulty = config.clamp_difficulty(config.initial_difficulty);
    let mut balances = BalanceIndex::from_chain(&blocks[..1]);
    let mut spent_txids = HashSet::new();

    for i in 1..blocks.len() {
        let block = &blocks[i];
        let ctx = BlockContext {
            previous: &blocks[i - 1],
            difficulty,
            balances: &balances,
            spent_txids: &spent_txids,
            config,
            now_ms,
        };
        BlockValidator::validate(block, &ctx)?;

        balances.process_block(block);
        spent_txids.extend(block.transactions.iter().map(|tx| tx.id()));
        difficulty = next_difficulty(&blocks[..=i], difficulty, config);
    }

    Ok(ReplayedChain {
        difficulty,
        balances,
        spent_txids,
    })
}
