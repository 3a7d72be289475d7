//! Common type definitions for the sync engines.

use std::fmt;

use bitcoin::bip158::FilterHeader;
use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;

/// Stable identity of a peer, used as the key when attributing responses for banning.
pub type PeerAddr = String;

/// A block header together with its height in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderNode {
    pub header: BlockHeader,
    pub height: u32,
}

impl HeaderNode {
    pub fn new(header: BlockHeader, height: u32) -> Self {
        Self {
            header,
            height,
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Whether `next` extends this node by exactly one block.
    pub fn is_parent_of(&self, next: &HeaderNode) -> bool {
        next.header.prev_blockhash == self.hash() && next.height == self.height + 1
    }
}

impl fmt::Display for HeaderNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (height {})", self.hash(), self.height)
    }
}

/// Tip of a block-header store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderTip {
    pub header: BlockHeader,
    pub height: u32,
}

impl BlockHeaderTip {
    pub fn hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

impl From<HeaderNode> for BlockHeaderTip {
    fn from(node: HeaderNode) -> Self {
        Self {
            header: node.header,
            height: node.height,
        }
    }
}

impl From<BlockHeaderTip> for HeaderNode {
    fn from(tip: BlockHeaderTip) -> Self {
        Self {
            header: tip.header,
            height: tip.height,
        }
    }
}

/// One record of the filter-header log.
///
/// Serialized as `filter_header (32) || height (4, LE) || block_hash (32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHeaderEntry {
    pub filter_header: FilterHeader,
    pub height: u32,
    pub block_hash: BlockHash,
}

impl FilterHeaderEntry {
    pub const SERIALIZED_LEN: usize = 68;

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_LEN] {
        use bitcoin::hashes::Hash;

        let mut out = [0u8; Self::SERIALIZED_LEN];
        out[..32].copy_from_slice(self.filter_header.as_byte_array());
        out[32..36].copy_from_slice(&self.height.to_le_bytes());
        out[36..].copy_from_slice(self.block_hash.as_byte_array());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SERIALIZED_LEN]) -> Self {
        use bitcoin::hashes::Hash;

        let mut filter_header = [0u8; 32];
        filter_header.copy_from_slice(&bytes[..32]);
        let mut height = [0u8; 4];
        height.copy_from_slice(&bytes[32..36]);
        let mut block_hash = [0u8; 32];
        block_hash.copy_from_slice(&bytes[36..]);

        Self {
            filter_header: FilterHeader::from_byte_array(filter_header),
            height: u32::from_le_bytes(height),
            block_hash: BlockHash::from_byte_array(block_hash),
        }
    }
}

/// Source of network-adjusted time, in unix seconds.
pub trait TimeSource: Send + Sync {
    fn adjusted_time(&self) -> u32;
}

/// Wall-clock time with no peer offset applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> u32 {
        chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }
}
