//! Mining engine for the ledger
//!
//! The nonce search never runs under the chain lock: the caller takes a
//! `BlockTemplate` while holding a read lock, mines it here, and submits
//! the sealed block under the write lock.

use crate::core::{Block, BlockTemplate, Blockchain, BlockchainError};
use log::info;
use std::time::Instant;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Miner for creating new blocks
pub struct Miner {
    /// Miner's address for receiving rewards
    pub address: String,
}

impl Miner {
    /// Create a new miner
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    /// Mine and append a block while holding the chain exclusively
    pub fn mine_block(
        &self,
        blockchain: &mut Blockchain,
    ) -> Result<(Block, MiningStats), BlockchainError> {
        let template = blockchain.create_block_template(&self.address);
        let (block, stats) = Self::mine_template(template);
        blockchain.submit_mined_block(block.clone())?;
        Ok((block, stats))
    }

    /// Seal a template without touching the chain.
    ///
    /// CPU bound and unbounded; run it on a blocking worker. The caller
    /// submits the result with `Blockchain::submit_mined_block`.
    pub fn mine_template(template: BlockTemplate) -> (Block, MiningStats) {
        let BlockTemplate {
            mut block,
            difficulty,
            miner_address,
        } = template;

        info!(
            "Mining block {} with difficulty {} ({} transactions)...",
            block.index,
            difficulty,
            block.tx_count()
        );

        let start = Instant::now();
        let attempts = block.mine_block(difficulty, &miner_address);

        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (attempts as f64) / (elapsed as f64 / 1000.0)
        } else {
            attempts as f64
        };

        info!(
            "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
            block.index, elapsed, attempts, hash_rate
        );

        let stats = MiningStats {
            hash_attempts: attempts,
            time_ms: elapsed,
            hash_rate,
        };

        (block, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miner() {
        let mut blockchain = Blockchain::with_difficulty(2);
        let miner = Miner::new(&"a".repeat(64));

        let (block, stats) = miner.mine_block(&mut blockchain).unwrap();

        assert_eq!(block.index, 1);
        assert!(block.hash.starts_with("00"));
        assert!(stats.hash_attempts > 0);
        assert_eq!(blockchain.height(), 1);
    }

    #[test]
    fn test_detached_mining() {
        let mut blockchain = Blockchain::with_difficulty(1);
        let address = "a".repeat(64);

        let template = blockchain.create_block_template(&address);
        let (block, _) = Miner::mine_template(template);

        blockchain.submit_mined_block(block).unwrap();
        assert_eq!(blockchain.get_balance(&address), 16);
    }
}
