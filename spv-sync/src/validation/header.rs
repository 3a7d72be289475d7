use rayon::prelude::*;
use std::time::Instant;

use bitcoin::block::Header as BlockHeader;
use bitcoin::pow::{CompactTarget, Target};

use crate::chain::{ChainParams, Checkpoint};
use crate::error::{ValidationError, ValidationResult};
use crate::types::HeaderNode;
use crate::validation::Validator;

/// Structural pre-check of a received header batch.
///
/// Every header must link to the one before it and satisfy its own declared
/// target. Whether the declared target is the one the chain requires is decided
/// later, header by header, by [`check_header_sanity`].
#[derive(Default)]
pub struct BlockHeaderValidator {}

impl BlockHeaderValidator {
    pub fn new() -> Self {
        Self {}
    }
}

impl Validator<&[BlockHeader]> for BlockHeaderValidator {
    fn validate(&self, headers: &[BlockHeader]) -> ValidationResult<()> {
        let start = Instant::now();

        headers.par_iter().enumerate().try_for_each(|(i, header)| {
            let hash = header.block_hash();
            if i > 0 && header.prev_blockhash != headers[i - 1].block_hash() {
                return Err(ValidationError::InvalidHeaderChain(format!(
                    "header {} does not connect to {}",
                    hash,
                    headers[i - 1].block_hash()
                )));
            }
            if !header.target().is_met_by(hash) {
                return Err(ValidationError::InvalidProofOfWork(format!(
                    "hash {} above declared target {:08x}",
                    hash,
                    header.bits.to_consensus()
                )));
            }
            Ok(())
        })?;

        tracing::trace!(
            "Header batch pre-check passed for {} headers, duration: {:?}",
            headers.len(),
            start.elapsed(),
        );

        Ok(())
    }
}

/// Context-dependent checks for a header about to be connected at `height`.
///
/// `required_bits` comes from the difficulty retarget over the branch the header
/// extends. The header's declared target may not be easier than the network's
/// floor for its version and height, its hash must meet the required target, and
/// its timestamp may not run ahead of adjusted time by more than the network allows.
pub fn check_header_sanity(
    header: &BlockHeader,
    height: u32,
    required_bits: CompactTarget,
    params: &ChainParams,
    adjusted_time: u32,
) -> ValidationResult<()> {
    let hash = header.block_hash();

    let declared = header.target();
    let floor = (params.min_difficulty)(params, header.version, height);
    if declared == Target::ZERO || declared > floor {
        return Err(ValidationError::InvalidProofOfWork(format!(
            "block {} declares bits {:08x} outside the allowed range",
            hash,
            header.bits.to_consensus()
        )));
    }

    if !Target::from_compact(required_bits).is_met_by(hash) {
        return Err(ValidationError::InvalidProofOfWork(format!(
            "block {} at height {} does not meet required bits {:08x}",
            hash,
            height,
            required_bits.to_consensus()
        )));
    }

    let max_timestamp = adjusted_time.saturating_add((params.max_time_offset)(height));
    if header.time > max_timestamp {
        return Err(ValidationError::TimestampTooFarInFuture {
            timestamp: header.time,
            max_timestamp,
        });
    }

    Ok(())
}

/// A header connected at a checkpoint height must carry the checkpoint hash.
pub fn check_checkpoint(checkpoint: &Checkpoint, node: &HeaderNode) -> ValidationResult<()> {
    if checkpoint.height != node.height || checkpoint.hash == node.hash() {
        return Ok(());
    }
    Err(ValidationError::CheckpointMismatch {
        height: checkpoint.height,
        expected: checkpoint.hash,
        actual: node.hash(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::params::tightened_max_time_offset;
    use crate::test_utils::{build_header_chain, fixture_time, header_with_bits, EASY_BITS};
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    #[test]
    fn test_empty_batch() {
        assert!(BlockHeaderValidator::new().validate(&[]).is_ok());
    }

    #[test]
    fn test_valid_batch() {
        let headers: Vec<_> =
            build_header_chain(BlockHash::all_zeros(), 1, 10).iter().map(|n| n.header).collect();
        assert!(BlockHeaderValidator::new().validate(&headers).is_ok());
    }

    #[test]
    fn test_broken_batch() {
        let mut headers: Vec<_> =
            build_header_chain(BlockHash::all_zeros(), 1, 3).iter().map(|n| n.header).collect();
        headers.swap(1, 2);

        let result = BlockHeaderValidator::new().validate(&headers);
        assert!(matches!(result, Err(ValidationError::InvalidHeaderChain(_))));
    }

    #[test]
    fn test_batch_with_unmet_declared_target() {
        let header = header_with_bits(0x1d00ffff, 0);
        let result = BlockHeaderValidator::new().validate(&[header]);
        assert!(matches!(result, Err(ValidationError::InvalidProofOfWork(_))));
    }

    #[test]
    fn test_sanity_accepts_mined_header() {
        let params = ChainParams::regtest();
        let node = build_header_chain(params.genesis_hash(), 1, 1)[0];

        let result = check_header_sanity(
            &node.header,
            1,
            CompactTarget::from_consensus(EASY_BITS),
            &params,
            fixture_time(1),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_sanity_rejects_hash_above_required_target() {
        let params = ChainParams::regtest();
        let node = build_header_chain(params.genesis_hash(), 1, 1)[0];

        let result = check_header_sanity(
            &node.header,
            1,
            CompactTarget::from_consensus(0x1d00ffff),
            &params,
            fixture_time(1),
        );
        assert!(matches!(result, Err(ValidationError::InvalidProofOfWork(_))));
    }

    #[test]
    fn test_sanity_rejects_bits_below_floor() {
        let params = ChainParams::regtest().with_pow_limit(CompactTarget::from_consensus(0x1f7fffff));
        let node = build_header_chain(params.genesis_hash(), 1, 1)[0];

        let result = check_header_sanity(
            &node.header,
            1,
            CompactTarget::from_consensus(EASY_BITS),
            &params,
            fixture_time(1),
        );
        assert!(matches!(result, Err(ValidationError::InvalidProofOfWork(_))));
    }

    #[test]
    fn test_sanity_timestamp_window_follows_policy() {
        fn narrow(height: u32) -> u32 {
            tightened_max_time_offset::<1>(height)
        }

        let node = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 1)[0];
        let bits = CompactTarget::from_consensus(EASY_BITS);
        // 10 minutes behind the header's timestamp
        let now = node.header.time - 600;

        let wide = ChainParams::regtest();
        assert!(check_header_sanity(&node.header, 1, bits, &wide, now).is_ok());

        let tight = ChainParams::regtest().with_max_time_offset(narrow);
        let result = check_header_sanity(&node.header, 1, bits, &tight, now);
        assert!(matches!(
            result,
            Err(ValidationError::TimestampTooFarInFuture {
                max_timestamp,
                ..
            }) if max_timestamp == now + 90
        ));
    }

    #[test]
    fn test_checkpoint_hash_must_match() {
        let node = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 3)[2];
        assert!(check_checkpoint(&Checkpoint::new(3, node.hash()), &node).is_ok());
        // Other heights are not checked
        assert!(check_checkpoint(&Checkpoint::new(4, BlockHash::all_zeros()), &node).is_ok());

        let wrong = BlockHash::from_byte_array([3u8; 32]);
        let result = check_checkpoint(&Checkpoint::new(3, wrong), &node);
        assert!(matches!(
            result,
            Err(ValidationError::CheckpointMismatch {
                height: 3,
                expected,
                actual,
            }) if expected == wrong && actual == node.hash()
        ));
    }
}
