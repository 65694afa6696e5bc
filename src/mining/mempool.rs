//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated, unconfirmed transfers in arrival order. Admission rules
//! live in `TransactionValidator`; the pool only stores, deduplicates,
//! prioritises and evicts.

use crate::core::{Transaction, TransactionError};
use crate::config::DEFAULT_MEMPOOL_SIZE;

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug, Clone)]
pub struct Mempool {
    /// Transactions in order of arrival
    transactions: Vec<Transaction>,
    /// Maximum pool size
    max_size: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    /// Create a new mempool
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    /// Create a mempool holding at most `max_size` transactions
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            transactions: Vec::new(),
            max_size,
        }
    }

    /// Append an already validated transaction
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), TransactionError> {
        if self.is_full() {
            return Err(TransactionError::MempoolFull(self.max_size));
        }
        if self.is_duplicate(&tx) {
            return Err(TransactionError::DuplicateTransaction(tx.id()));
        }
        self.transactions.push(tx);
        Ok(())
    }

    /// Check if a transaction id is pending
    pub fn contains(&self, txid: &str) -> bool {
        self.transactions.iter().any(|tx| tx.id() == txid)
    }

    /// Pending by id, or a content-equal transaction is pending
    pub fn is_duplicate(&self, tx: &Transaction) -> bool {
        let id = tx.id();
        self.transactions
            .iter()
            .any(|pending| pending.id() == id || pending.same_content(tx))
    }

    /// Sum of `amount + fee` of every pending transaction sent by `address`
    pub fn pending_cost(&self, address: &str) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| tx.from == address)
            .fold(0u64, |acc, tx| acc.saturating_add(tx.total_cost()))
    }

    /// Pending transactions by fee, highest first; ties keep arrival order
    pub fn prioritized(&self) -> Vec<&Transaction> {
        let mut ordered: Vec<&Transaction> = self.transactions.iter().collect();
        ordered.sort_by(|a, b| b.fee.cmp(&a.fee));
        ordered
    }

    /// Pick transactions for a block template.
    ///
    /// Walks the pool in fee order and greedily keeps every transaction that
    /// `accept` approves and that still fits under `max_count` and
    /// `max_bytes`. A transaction too large for the remaining space is
    /// skipped so smaller ones behind it can still fill the block.
    pub fn select_transactions<F>(
        &self,
        max_count: usize,
        max_bytes: usize,
        mut accept: F,
    ) -> Vec<Transaction>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let mut selected = Vec::new();
        let mut used_bytes = 0usize;

        for tx in self.prioritized() {
            if selected.len() >= max_count {
                break;
            }
            let size = tx.size();
            if used_bytes + size > max_bytes {
                continue;
            }
            if !accept(tx) {
                continue;
            }
            used_bytes += size;
            selected.push(tx.clone());
        }

        selected
    }

    /// Remove transactions confirmed by a block, matched by id or content
    pub fn remove_confirmed(&mut self, confirmed: &[Transaction]) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|pending| {
            let id = pending.id();
            !confirmed
                .iter()
                .any(|tx| tx.id() == id || tx.same_content(pending))
        });
        before - self.transactions.len()
    }

    /// Keep only the transactions for which `keep` returns true
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&Transaction) -> bool,
    {
        self.transactions.retain(keep);
    }

    /// Pending transactions in arrival order
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Median fee of the pending transactions
    pub fn median_fee(&self) -> Option<u64> {
        if self.transactions.is_empty() {
            return None;
        }
        let mut fees: Vec<u64> = self.transactions.iter().map(|tx| tx.fee).collect();
        fees.sort_unstable();
        Some(fees[fees.len() / 2])
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.transactions.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Clear all transactions
    pub fn clear(&mut self) {
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn transfer(key_pair: &KeyPair, amount: u64, fee: u64, timestamp: i64) -> Transaction {
        let mut tx =
            Transaction::with_timestamp(&key_pair.address(), &"b".repeat(64), amount, fee, timestamp);
        tx.sign(key_pair).unwrap();
        tx
    }

    #[test]
    fn test_mempool_add_remove() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        let tx = transfer(&alice, 5, 1, 1000);

        mempool.add_transaction(tx.clone()).unwrap();
        assert_eq!(mempool.len(), 1);
        assert!(mempool.contains(&tx.id()));

        assert_eq!(mempool.remove_confirmed(&[tx]), 1);
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_mempool_duplicate() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        let tx = transfer(&alice, 5, 1, 1000);

        mempool.add_transaction(tx.clone()).unwrap();
        assert!(matches!(
            mempool.add_transaction(tx),
            Err(TransactionError::DuplicateTransaction(_))
        ));

        // Same content with a different fee is still a duplicate
        let resent = transfer(&alice, 5, 2, 1000);
        assert!(mempool.is_duplicate(&resent));
    }

    #[test]
    fn test_mempool_max_size() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::with_capacity(2);
        mempool.add_transaction(transfer(&alice, 1, 0, 1)).unwrap();
        mempool.add_transaction(transfer(&alice, 1, 0, 2)).unwrap();

        assert!(matches!(
            mempool.add_transaction(transfer(&alice, 1, 0, 3)),
            Err(TransactionError::MempoolFull(2))
        ));
    }

    #[test]
    fn test_fee_priority_selection() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        for (i, fee) in [5u64, 1, 10].iter().enumerate() {
            mempool
                .add_transaction(transfer(&alice, 1, *fee, i as i64))
                .unwrap();
        }

        let fees: Vec<u64> = mempool
            .select_transactions(10, usize::MAX, |_| true)
            .iter()
            .map(|tx| tx.fee)
            .collect();
        assert_eq!(fees, vec![10, 5, 1]);

        let capped: Vec<u64> = mempool
            .select_transactions(2, usize::MAX, |_| true)
            .iter()
            .map(|tx| tx.fee)
            .collect();
        assert_eq!(capped, vec![10, 5]);
    }

    #[test]
    fn test_equal_fees_keep_arrival_order() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        let first = transfer(&alice, 1, 3, 1);
        let second = transfer(&alice, 2, 3, 2);
        mempool.add_transaction(first.clone()).unwrap();
        mempool.add_transaction(second.clone()).unwrap();

        let selected = mempool.select_transactions(10, usize::MAX, |_| true);
        assert_eq!(selected, vec![first, second]);
    }

    #[test]
    fn test_selection_respects_byte_cap() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        let tx = transfer(&alice, 1, 1, 1);
        let size = tx.size();
        mempool.add_transaction(tx).unwrap();
        mempool.add_transaction(transfer(&alice, 2, 1, 2)).unwrap();

        assert_eq!(mempool.select_transactions(10, size, |_| true).len(), 1);
        assert!(mempool.select_transactions(10, size - 1, |_| true).is_empty());
    }

    #[test]
    fn test_pending_cost_and_median_fee() {
        let alice = KeyPair::generate();
        let mut mempool = Mempool::new();
        assert_eq!(mempool.median_fee(), None);

        mempool.add_transaction(transfer(&alice, 5, 1, 1)).unwrap();
        mempool.add_transaction(transfer(&alice, 3, 4, 2)).unwrap();
        mempool.add_transaction(transfer(&alice, 2, 2, 3)).unwrap();

        assert_eq!(mempool.pending_cost(&alice.address()), 17);
        assert_eq!(mempool.pending_cost("nobody"), 0);
        assert_eq!(mempool.median_fee(), Some(2));
    }
}
