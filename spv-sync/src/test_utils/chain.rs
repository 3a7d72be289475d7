//! Header chain fixtures.

use std::sync::atomic::{AtomicU32, Ordering};

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, TxMerkleNode};

use crate::types::{HeaderNode, TimeSource};

/// Regtest proof-of-work limit: roughly every other nonce solves it.
pub const EASY_BITS: u32 = 0x207fffff;

/// 256 times harder than [`EASY_BITS`], still quick to mine.
pub const MEDIUM_BITS: u32 = 0x1f7fffff;

/// Timestamp of the regtest genesis block.
const GENESIS_TIME: u32 = 1_296_688_602;

/// Timestamp given to fixture headers at `height`: one block a minute after genesis.
pub fn fixture_time(height: u32) -> u32 {
    GENESIS_TIME + height * 60
}

/// Bump the nonce until `header` meets its own declared target.
pub fn mine(mut header: BlockHeader) -> BlockHeader {
    while !header.target().is_met_by(header.block_hash()) {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

/// An unmined header with the given bits and timestamp and no parent.
pub fn header_with_bits(bits: u32, time: u32) -> BlockHeader {
    BlockHeader {
        version: Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(bits),
        nonce: 0,
    }
}

/// `count` mined headers at `bits` extending `prev`, starting at `first_height`.
///
/// `salt` shifts every timestamp so two branches from the same parent never share
/// a hash.
pub fn build_branch(
    prev: BlockHash,
    first_height: u32,
    count: usize,
    bits: u32,
    salt: u32,
) -> Vec<HeaderNode> {
    let mut prev = prev;
    (0..count as u32)
        .map(|i| {
            let height = first_height + i;
            let header = mine(BlockHeader {
                prev_blockhash: prev,
                ..header_with_bits(bits, fixture_time(height) + salt)
            });
            prev = header.block_hash();
            HeaderNode::new(header, height)
        })
        .collect()
}

/// The canonical fixture chain: deterministic, so rebuilding it gives the same hashes.
pub fn build_header_chain(prev: BlockHash, first_height: u32, count: usize) -> Vec<HeaderNode> {
    build_branch(prev, first_height, count, EASY_BITS, 0)
}

/// Linked but unmined headers, one per entry of `bits`.
pub fn unmined_header_chain(prev: BlockHash, first_height: u32, bits: &[u32]) -> Vec<HeaderNode> {
    let mut prev = prev;
    bits.iter()
        .enumerate()
        .map(|(i, bits)| {
            let height = first_height + i as u32;
            let header = BlockHeader {
                prev_blockhash: prev,
                ..header_with_bits(*bits, fixture_time(height))
            };
            prev = header.block_hash();
            HeaderNode::new(header, height)
        })
        .collect()
}

/// Adjustable clock for tests.
#[derive(Debug, Default)]
pub struct FixedTimeSource(AtomicU32);

impl FixedTimeSource {
    pub fn new(now: u32) -> Self {
        Self(AtomicU32::new(now))
    }

    pub fn set(&self, now: u32) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn adjusted_time(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
