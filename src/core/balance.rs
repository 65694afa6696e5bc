//! Address balance index
//!
//! A materialized view over the chain: it can always be rebuilt by
//! replaying every block from genesis, or advanced by applying exactly the
//! block that was just appended.

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use std::collections::HashMap;

/// Mapping from address to signed accumulated balance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceIndex {
    balances: HashMap<String, i64>,
}

impl BalanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index by replaying a whole chain
    pub fn from_chain(blocks: &[Block]) -> Self {
        let mut index = Self::new();
        index.update_balance(blocks);
        index
    }

    /// Apply one block: credit the coinbase, then each transfer in order
    pub fn process_block(&mut self, block: &Block) {
        if let Some(coinbase) = &block.coinbase_tx {
            self.credit(&coinbase.to, coinbase.amount);
        }
        for tx in &block.transactions {
            self.apply_transfer(tx);
        }
    }

    /// Debit `amount + fee` from the sender and credit `amount` to the recipient
    pub fn apply_transfer(&mut self, tx: &Transaction) {
        self.debit(&tx.from, tx.total_cost());
        self.credit(&tx.to, tx.amount);
    }

    /// Clear the index and replay `blocks`
    pub fn update_balance(&mut self, blocks: &[Block]) {
        self.balances.clear();
        for block in blocks {
            self.process_block(block);
        }
    }

    fn credit(&mut self, address: &str, amount: u64) {
        let entry = self.balances.entry(address.to_string()).or_insert(0);
        *entry = entry.saturating_add(to_signed(amount));
    }

    fn debit(&mut self, address: &str, amount: u64) {
        let entry = self.balances.entry(address.to_string()).or_insert(0);
        *entry = entry.saturating_sub(to_signed(amount));
    }

    /// Balance of `address` (zero when never seen)
    pub fn get_balance(&self, address: &str) -> i64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// Whether `address` holds at least `amount`
    pub fn has_balance(&self, address: &str, amount: u64) -> bool {
        self.get_balance(address) >= to_signed(amount)
    }

    pub fn get_all_balances(&self) -> &HashMap<String, i64> {
        &self.balances
    }

    /// Sum of every balance.
    ///
    /// Fees are debited from senders and re-minted in the coinbase, so this
    /// equals the sum of the block rewards applied so far.
    pub fn total_supply(&self) -> i64 {
        self.balances.values().sum()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Amounts above `i64::MAX` saturate
pub(crate) fn to_signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::reward_for_height;
    use crate::crypto::KeyPair;

    fn mined_block(index: u64, previous_hash: &str, txs: Vec<Transaction>, miner: &str) -> Block {
        let mut block = Block::new(index, previous_hash.to_string(), txs);
        block.mine_block(1, miner);
        block
    }

    #[test]
    fn test_coinbase_credit() {
        let miner = "a".repeat(64);
        let genesis = Block::genesis();
        let block = mined_block(1, &genesis.hash, vec![], &miner);

        let index = BalanceIndex::from_chain(&[genesis, block]);
        assert_eq!(index.get_balance(&miner), 16);
        assert!(index.has_balance(&miner, 16));
        assert!(!index.has_balance(&miner, 17));
        assert_eq!(index.get_balance("unknown"), 0);
    }

    #[test]
    fn test_transfer_and_conservation() {
        let alice = KeyPair::generate();
        let bob = "b".repeat(64);
        let genesis = Block::genesis();
        let b1 = mined_block(1, &genesis.hash, vec![], &alice.address());

        let mut tx = Transaction::new(&alice.address(), &bob, 5, 1);
        tx.sign(&alice).unwrap();
        let b2 = mined_block(2, &b1.hash, vec![tx], &alice.address());

        let chain = vec![genesis, b1, b2];
        let index = BalanceIndex::from_chain(&chain);

        assert_eq!(index.get_balance(&alice.address()), 27);
        assert_eq!(index.get_balance(&bob), 5);

        let rewards: u64 = chain[1..].iter().map(|b| reward_for_height(b.index)).sum();
        assert_eq!(index.total_supply(), rewards as i64);
    }

    #[test]
    fn test_incremental_matches_rebuild() {
        let miner = "c".repeat(64);
        let genesis = Block::genesis();
        let b1 = mined_block(1, &genesis.hash, vec![], &miner);
        let b2 = mined_block(2, &b1.hash, vec![], &miner);

        let mut incremental = BalanceIndex::from_chain(&[genesis.clone(), b1.clone()]);
        incremental.process_block(&b2);

        let rebuilt = BalanceIndex::from_chain(&[genesis, b1, b2]);
        assert_eq!(incremental, rebuilt);
    }
}
