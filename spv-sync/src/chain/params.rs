//! Consensus parameters consumed by header validation and difficulty retargeting.
//!
//! Network-specific rules that differ between chains (per-algorithm difficulty floors,
//! the future-timestamp window) are plain function pointers so each network can plug
//! in its own policy without the engines knowing about it.

use bitcoin::bip158::{self, BlockFilter, FilterHeader};
use bitcoin::block::{Block, Header as BlockHeader, Version};
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::{Network, OutPoint, ScriptBuf};

use crate::chain::checkpoints::Checkpoint;

/// Default window for block timestamps ahead of adjusted time.
pub const DEFAULT_MAX_TIME_OFFSET_SECS: u32 = 2 * 60 * 60;

/// Narrowed window used once a chain enables the tightened timestamp rule.
pub const TIGHTENED_MAX_TIME_OFFSET_SECS: u32 = 90;

/// Floor on the target a header may be validated against, keyed by block version and height.
pub type MinDifficultyPolicy = fn(&ChainParams, Version, u32) -> Target;

/// Seconds a header at the given height may be ahead of adjusted time.
pub type MaxTimeOffsetPolicy = fn(u32) -> u32;

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub genesis_header: BlockHeader,
    /// BIP 158 basic filter header of the genesis block, the anchor of the filter-header chain.
    pub genesis_filter_header: FilterHeader,
    pub pow_limit: Target,
    pub pow_limit_bits: CompactTarget,
    /// Blocks between difficulty adjustments.
    pub retarget_interval: u32,
    /// Desired seconds per retarget window.
    pub target_timespan: u32,
    /// Clamp for the observed timespan, `[timespan / factor, timespan * factor]`.
    pub retarget_adjustment_factor: u32,
    /// Allow minimum-difficulty blocks after a long gap (testnet style).
    pub reduce_min_difficulty: bool,
    pub min_diff_reduction_time: u32,
    pub checkpoints: Vec<Checkpoint>,
    pub min_difficulty: MinDifficultyPolicy,
    pub max_time_offset: MaxTimeOffsetPolicy,
    /// Keep requesting headers after every batch, even when synced.
    pub always_request_headers: bool,
}

impl ChainParams {
    /// Parameters for a chain rooted at `genesis`, using its bits as the proof-of-work limit.
    pub fn new(genesis: &Block) -> Self {
        let pow_limit_bits = genesis.header.bits;
        Self {
            genesis_header: genesis.header,
            genesis_filter_header: basic_filter_header(genesis, &FilterHeader::all_zeros()),
            pow_limit: Target::from_compact(pow_limit_bits),
            pow_limit_bits,
            retarget_interval: 2016,
            target_timespan: 14 * 24 * 60 * 60,
            retarget_adjustment_factor: 4,
            reduce_min_difficulty: false,
            min_diff_reduction_time: 20 * 60,
            checkpoints: Vec::new(),
            min_difficulty: pow_limit_floor,
            max_time_offset: default_max_time_offset,
            always_request_headers: false,
        }
    }

    /// Local regression-test network.
    pub fn regtest() -> Self {
        Self {
            reduce_min_difficulty: true,
            always_request_headers: true,
            ..Self::new(&genesis_block(Network::Regtest))
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Vec<Checkpoint>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_pow_limit(mut self, bits: CompactTarget) -> Self {
        self.pow_limit_bits = bits;
        self.pow_limit = Target::from_compact(bits);
        self
    }

    pub fn with_retarget(mut self, interval: u32, target_timespan: u32) -> Self {
        self.retarget_interval = interval;
        self.target_timespan = target_timespan;
        self
    }

    pub fn with_reduce_min_difficulty(mut self, enabled: bool, reduction_time: u32) -> Self {
        self.reduce_min_difficulty = enabled;
        self.min_diff_reduction_time = reduction_time;
        self
    }

    pub fn with_min_difficulty(mut self, policy: MinDifficultyPolicy) -> Self {
        self.min_difficulty = policy;
        self
    }

    pub fn with_max_time_offset(mut self, policy: MaxTimeOffsetPolicy) -> Self {
        self.max_time_offset = policy;
        self
    }

    pub fn with_always_request_headers(mut self, enabled: bool) -> Self {
        self.always_request_headers = enabled;
        self
    }

    pub fn genesis_hash(&self) -> bitcoin::BlockHash {
        self.genesis_header.block_hash()
    }

    pub fn min_retarget_timespan(&self) -> u32 {
        self.target_timespan / self.retarget_adjustment_factor.max(1)
    }

    pub fn max_retarget_timespan(&self) -> u32 {
        self.target_timespan.saturating_mul(self.retarget_adjustment_factor.max(1))
    }
}

/// Default floor: the chain's proof-of-work limit.
pub fn pow_limit_floor(params: &ChainParams, _version: Version, _height: u32) -> Target {
    params.pow_limit
}

/// Two hours regardless of height.
pub fn default_max_time_offset(_height: u32) -> u32 {
    DEFAULT_MAX_TIME_OFFSET_SECS
}

/// Build a policy that narrows the timestamp window at and after `fork_height`.
///
/// Function pointers cannot capture, so chains pick the fork height at compile time:
///
/// ```
/// use spv_sync::chain::params::tightened_max_time_offset;
///
/// fn after_fork(height: u32) -> u32 {
///     tightened_max_time_offset::<250_000>(height)
/// }
/// assert_eq!(after_fork(1), 7200);
/// assert_eq!(after_fork(250_000), 90);
/// ```
pub fn tightened_max_time_offset<const FORK_HEIGHT: u32>(height: u32) -> u32 {
    if height >= FORK_HEIGHT {
        TIGHTENED_MAX_TIME_OFFSET_SECS
    } else {
        DEFAULT_MAX_TIME_OFFSET_SECS
    }
}

/// Chain the basic filter of `block` onto `prev`.
fn basic_filter_header(block: &Block, prev: &FilterHeader) -> FilterHeader {
    // Only spent outputs are resolved; a block whose transactions spend nothing
    // needs no lookups.
    let filter = BlockFilter::new_script_filter(block, |outpoint: &OutPoint| {
        Err::<ScriptBuf, _>(bip158::Error::UtxoMissing(*outpoint))
    });
    match filter {
        Ok(filter) => filter.filter_header(prev),
        Err(_) => unreachable!("genesis blocks only contain a coinbase"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regtest_params() {
        let params = ChainParams::regtest();
        assert_eq!(params.pow_limit_bits.to_consensus(), 0x207fffff);
        assert_eq!(params.genesis_hash(), genesis_block(Network::Regtest).block_hash());
        assert_ne!(params.genesis_filter_header, FilterHeader::all_zeros());
        assert!(params.reduce_min_difficulty);
    }

    #[test]
    fn test_retarget_clamps() {
        let params = ChainParams::regtest().with_retarget(10, 1000);
        assert_eq!(params.min_retarget_timespan(), 250);
        assert_eq!(params.max_retarget_timespan(), 4000);
    }

    #[test]
    fn test_default_policies() {
        let params = ChainParams::regtest();
        assert_eq!((params.max_time_offset)(0), DEFAULT_MAX_TIME_OFFSET_SECS);
        assert_eq!((params.min_difficulty)(&params, Version::ONE, 100), params.pow_limit);
        assert_eq!(tightened_max_time_offset::<10>(9), DEFAULT_MAX_TIME_OFFSET_SECS);
        assert_eq!(tightened_max_time_offset::<10>(10), TIGHTENED_MAX_TIME_OFFSET_SECS);
    }
}
