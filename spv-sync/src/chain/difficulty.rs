//! Next-required-difficulty calculation.
//!
//! The result only depends on the headers behind the new block, so the same
//! routine serves both the main chain and a speculative reorg branch: the caller
//! passes whichever [`HeaderChain`] holds the branch, and anything older than the
//! in-memory window is read from the block-header store, which holds the shared
//! history below the branch point.

use bitcoin::block::Header as BlockHeader;
use bitcoin::pow::{CompactTarget, Target};
use primitive_types::{U256, U512};

use crate::chain::header_chain::HeaderChain;
use crate::chain::params::ChainParams;
use crate::error::{StorageError, StorageResult};
use crate::storage::BlockHeaderStorage;

/// Compact bits required for a block at `chain.back().height + 1` with timestamp `new_block_time`.
pub async fn next_required_difficulty<S>(
    chain: &HeaderChain,
    new_block_time: u32,
    params: &ChainParams,
    storage: &S,
) -> StorageResult<CompactTarget>
where
    S: BlockHeaderStorage + ?Sized,
{
    let Some(last) = chain.back() else {
        return Ok(params.pow_limit_bits);
    };

    let interval = params.retarget_interval.max(1);
    if (last.height + 1) % interval != 0 {
        if !params.reduce_min_difficulty {
            return Ok(last.header.bits);
        }

        let allow_min_time = last.header.time as u64 + params.min_diff_reduction_time as u64;
        if new_block_time as u64 > allow_min_time {
            return Ok(params.pow_limit_bits);
        }

        return last_non_min_difficulty_bits(chain, params, storage).await;
    }

    let first_height = last.height + 1 - interval;
    let first = header_at(chain, first_height, storage).await?;
    let actual_timespan = last.header.time as i64 - first.time as i64;
    let new_bits = retarget(last.header.bits, actual_timespan, params);

    tracing::debug!(
        "Difficulty retarget at height {}: old bits {:08x}, new bits {:08x}, actual timespan {}s, target timespan {}s",
        last.height + 1,
        last.header.bits.to_consensus(),
        new_bits.to_consensus(),
        actual_timespan,
        params.target_timespan,
    );

    Ok(new_bits)
}

/// Scale `old_bits` by the clamped observed timespan, capped at the proof-of-work limit.
pub fn retarget(old_bits: CompactTarget, actual_timespan: i64, params: &ChainParams) -> CompactTarget {
    let adjusted = actual_timespan.clamp(
        params.min_retarget_timespan() as i64,
        params.max_retarget_timespan() as i64,
    ) as u64;

    let old_target = target_to_u256(Target::from_compact(old_bits));
    let limit = target_to_u256(params.pow_limit);

    // Integer division rounds down, as the reference clients do.
    let scaled = U512::from(old_target) * U512::from(adjusted)
        / U512::from(params.target_timespan.max(1) as u64);

    let new_target = if scaled > U512::from(limit) {
        limit
    } else {
        U256::try_from(scaled).unwrap_or(limit)
    };

    u256_to_target(new_target).to_compact_lossy()
}

/// Walk back past blocks mined under the minimum-difficulty exception and return
/// the bits of the nearest block that was not.
async fn last_non_min_difficulty_bits<S>(
    chain: &HeaderChain,
    params: &ChainParams,
    storage: &S,
) -> StorageResult<CompactTarget>
where
    S: BlockHeaderStorage + ?Sized,
{
    let Some(mut handle) = chain.back_handle() else {
        return Ok(params.pow_limit_bits);
    };
    let Some(start) = chain.get(handle) else {
        return Ok(params.pow_limit_bits);
    };

    let interval = params.retarget_interval.max(1);
    let mut height = start.height;
    let mut bits = start.header.bits;
    let mut in_window = true;

    while height % interval != 0 && bits == params.pow_limit_bits {
        height -= 1;

        let prev = if in_window { chain.prev(handle) } else { None };
        match prev.and_then(|p| chain.get(p).map(|node| (p, node))) {
            Some((prev_handle, node)) => {
                handle = prev_handle;
                bits = node.header.bits;
            }
            None => {
                in_window = false;
                bits = header_at(chain, height, storage).await?.bits;
            }
        }
    }

    Ok(bits)
}

async fn header_at<S>(chain: &HeaderChain, height: u32, storage: &S) -> StorageResult<BlockHeader>
where
    S: BlockHeaderStorage + ?Sized,
{
    if let Some(node) = chain.get_by_height(height) {
        return Ok(node.header);
    }
    storage
        .get_header(height)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("block header at height {}", height)))
}

fn target_to_u256(target: Target) -> U256 {
    U256::from_big_endian(&target.to_be_bytes())
}

fn u256_to_target(value: U256) -> Target {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    Target::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageManager;
    use crate::test_utils::{header_with_bits, unmined_header_chain};
    use crate::types::HeaderNode;
    use test_case::test_case;

    const EASY_BITS: u32 = 0x207fffff;
    const HARD_BITS: u32 = 0x1d00ffff;

    fn mainnet_like() -> ChainParams {
        ChainParams::regtest()
            .with_pow_limit(CompactTarget::from_consensus(0x1d00ffff))
            .with_reduce_min_difficulty(false, 0)
    }

    #[tokio::test]
    async fn test_empty_chain_returns_pow_limit() {
        let params = ChainParams::regtest();
        let storage = MemoryStorageManager::with_genesis(params.genesis_header);
        let bits = next_required_difficulty(&HeaderChain::new(16), 0, &params, &storage)
            .await
            .unwrap();
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[tokio::test]
    async fn test_non_boundary_keeps_previous_bits() {
        let params = mainnet_like();
        let storage = MemoryStorageManager::with_genesis(params.genesis_header);
        let mut chain = HeaderChain::new(16);
        let node = HeaderNode::new(header_with_bits(HARD_BITS, 1_000), 10);
        chain.reset(node);

        let bits = next_required_difficulty(&chain, 999_999, &params, &storage).await.unwrap();
        assert_eq!(bits.to_consensus(), HARD_BITS);
    }

    #[tokio::test]
    async fn test_min_difficulty_after_gap() {
        let params = ChainParams::regtest()
            .with_pow_limit(CompactTarget::from_consensus(EASY_BITS))
            .with_reduce_min_difficulty(true, 1200);
        let storage = MemoryStorageManager::with_genesis(params.genesis_header);
        let mut chain = HeaderChain::new(16);
        chain.reset(HeaderNode::new(header_with_bits(HARD_BITS, 10_000), 5));

        let late = next_required_difficulty(&chain, 10_000 + 1201, &params, &storage).await.unwrap();
        assert_eq!(late.to_consensus(), EASY_BITS);
    }

    #[tokio::test]
    async fn test_min_difficulty_walks_back_to_real_bits() {
        let params = ChainParams::regtest().with_reduce_min_difficulty(true, 1200);
        let storage = MemoryStorageManager::with_genesis(params.genesis_header);

        // height 1 carries real difficulty, heights 2..=4 were mined at the floor
        let mut chain = HeaderChain::new(16);
        chain.reset(HeaderNode::new(params.genesis_header, 0));
        chain.push_back(HeaderNode::new(header_with_bits(HARD_BITS, 100), 1));
        for height in 2..=4 {
            chain.push_back(HeaderNode::new(
                header_with_bits(params.pow_limit_bits.to_consensus(), 100 * height),
                height,
            ));
        }

        let bits = next_required_difficulty(&chain, 450, &params, &storage).await.unwrap();
        assert_eq!(bits.to_consensus(), HARD_BITS);
    }

    #[tokio::test]
    async fn test_min_difficulty_walk_falls_back_to_store() {
        let params = ChainParams::regtest().with_reduce_min_difficulty(true, 1200);
        let mut storage = MemoryStorageManager::with_genesis(params.genesis_header);

        let limit = params.pow_limit_bits.to_consensus();
        let stored = unmined_header_chain(params.genesis_hash(), 1, &[HARD_BITS, limit, limit]);
        storage.write_headers(&stored).await.unwrap();

        // Window only holds the floor-difficulty tip
        let mut chain = HeaderChain::new(16);
        chain.reset(stored[2]);

        let bits = next_required_difficulty(&chain, stored[2].header.time + 1, &params, &storage)
            .await
            .unwrap();
        assert_eq!(bits.to_consensus(), HARD_BITS);
    }

    #[tokio::test]
    async fn test_boundary_uses_window_start() {
        let params = mainnet_like().with_retarget(4, 400);
        let storage = MemoryStorageManager::with_genesis(params.genesis_header);
        let mut chain = HeaderChain::new(16);
        // heights 0..=3, 100s apart: on schedule, so bits are unchanged
        for height in 0..4u32 {
            chain.push_back(HeaderNode::new(header_with_bits(HARD_BITS, 1_000 + 100 * height), height));
        }

        let bits = next_required_difficulty(&chain, 1_400, &params, &storage).await.unwrap();
        // 300s observed against a 400s target: the target shrinks by a quarter
        let expected = retarget(CompactTarget::from_consensus(HARD_BITS), 300, &params);
        assert_eq!(bits, expected);
        assert!(Target::from_compact(bits) < Target::from_compact(CompactTarget::from_consensus(HARD_BITS)));
    }

    #[test_case(400, 0x1d00ffff ; "on schedule")]
    #[test_case(100_000, 0x1d00ffff ; "slow blocks capped at limit")]
    #[test_case(0, 0x1c3fffc0 ; "fast blocks clamped to a quarter")]
    #[test_case(-50, 0x1c3fffc0 ; "negative timespan clamped")]
    fn test_retarget(actual_timespan: i64, expected_bits: u32) {
        let params = mainnet_like().with_retarget(4, 400);
        let bits = retarget(CompactTarget::from_consensus(0x1d00ffff), actual_timespan, &params);
        assert_eq!(bits.to_consensus(), expected_bits);
    }
}
