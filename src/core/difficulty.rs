//! Periodic difficulty retargeting
//!
//! Difficulty is a pure function of the chain: replaying the blocks from
//! genesis always yields the same value, so peers never need to trust a
//! difficulty they were told.

use crate::config::ChainConfig;
use crate::core::block::Block;

/// Difficulty that applies after `blocks.last()` was appended.
///
/// Every `difficulty_adjustment_interval` blocks, the time spent on the last
/// interval is compared with the target: under half the target raises the
/// difficulty by one, over double lowers it by one. The window never
/// reaches back to genesis since its timestamp is a fixed historical value.
pub fn next_difficulty(blocks: &[Block], current: u32, config: &ChainConfig) -> u32 {
    let interval = config.difficulty_adjustment_interval;
    let height = match blocks.len().checked_sub(1) {
        Some(h) => h as u64,
        None => return config.clamp_difficulty(current),
    };

    if interval == 0 || height % interval != 0 || height <= interval {
        return config.clamp_difficulty(current);
    }

    let latest = &blocks[height as usize];
    let window_start = &blocks[(height - interval) as usize];
    let actual = latest.timestamp - window_start.timestamp;
    let expected = config.target_block_time_ms * interval as i64;

    let adjusted = if actual < expected / 2 {
        current.saturating_add(1)
    } else if actual > expected.saturating_mul(2) {
        current.saturating_sub(1)
    } else {
        current
    };
    let adjusted = config.clamp_difficulty(adjusted);

    if adjusted != current {
        log::info!(
            "Difficulty adjusted from {} to {} at height {} ({}ms for {} blocks, target {}ms)",
            current,
            adjusted,
            height,
            actual,
            interval,
            expected
        );
    }

    adjusted
}
