//! Storage abstraction for block headers and filter headers.
//!
//! Both stores are height-ordered append-only logs. Writes are atomic per batch and
//! must extend the current tip; a rollback to an earlier height is the only way
//! entries are removed. The engines share stores as `Arc<RwLock<S>>`, so readers
//! observe either the state before or after a batch, never part of one.

mod memory;

use async_trait::async_trait;
use bitcoin::bip158::FilterHeader;
use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;

use crate::error::{StorageError, StorageResult};
use crate::types::{BlockHeaderTip, FilterHeaderEntry, HeaderNode};

pub use memory::MemoryStorageManager;

/// Number of dense entries at the start of a block locator before steps double.
const LOCATOR_DENSE_ENTRIES: usize = 10;

#[async_trait]
pub trait BlockHeaderStorage: Send + Sync {
    /// Header and height of the best stored block.
    async fn chain_tip(&self) -> StorageResult<BlockHeaderTip>;

    /// Header at `height` on the stored chain.
    async fn get_header(&self, height: u32) -> StorageResult<Option<BlockHeader>>;

    /// Header and height for a block hash on the stored chain.
    async fn get_header_by_hash(&self, hash: &BlockHash) -> StorageResult<Option<HeaderNode>>;

    /// Height for a block hash on the stored chain.
    async fn get_header_height_by_hash(&self, hash: &BlockHash) -> StorageResult<Option<u32>> {
        Ok(self.get_header_by_hash(hash).await?.map(|node| node.height))
    }

    /// Append `headers` atomically. The first header must extend the current tip and
    /// each following header must extend the one before it.
    async fn write_headers(&mut self, headers: &[HeaderNode]) -> StorageResult<()>;

    /// Drop every header above `height` and return the new tip.
    async fn rollback_to_height(&mut self, height: u32) -> StorageResult<BlockHeaderTip>;

    /// `count` headers ending at `stop_hash` (inclusive), oldest first, with the
    /// height of the first one.
    async fn fetch_header_ancestors(
        &self,
        count: u32,
        stop_hash: &BlockHash,
    ) -> StorageResult<(Vec<BlockHeader>, u32)> {
        let stop_height = self
            .get_header_height_by_hash(stop_hash)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("block header {}", stop_hash)))?;
        let start_height = stop_height.checked_sub(count.saturating_sub(1)).ok_or_else(|| {
            StorageError::NotFound(format!(
                "{} ancestors of {} at height {}",
                count, stop_hash, stop_height
            ))
        })?;

        let mut headers = Vec::with_capacity(count as usize);
        for height in start_height..=stop_height {
            let header = self
                .get_header(height)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("block header at {}", height)))?;
            headers.push(header);
        }
        Ok((headers, start_height))
    }

    /// Block locator for the stored chain: the tip, nine dense predecessors, then
    /// exponentially sparser entries, always ending with genesis.
    async fn latest_block_locator(&self) -> StorageResult<Vec<BlockHash>> {
        let tip = self.chain_tip().await?;
        let mut locator = vec![tip.hash()];
        let mut height = tip.height;
        let mut step = 1u32;

        while height > 0 {
            height = height.saturating_sub(step);
            let header = self
                .get_header(height)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("block header at {}", height)))?;
            locator.push(header.block_hash());

            if locator.len() > LOCATOR_DENSE_ENTRIES {
                step = step.saturating_mul(2);
            }
        }

        Ok(locator)
    }
}

#[async_trait]
pub trait FilterHeaderStorage: Send + Sync {
    /// The last written entry, or `None` for an empty store.
    async fn filter_chain_tip(&self) -> StorageResult<Option<FilterHeaderEntry>>;

    async fn get_filter_header(&self, height: u32) -> StorageResult<Option<FilterHeader>> {
        Ok(self.get_filter_entry(height).await?.map(|entry| entry.filter_header))
    }

    /// The full entry at `height`, including the block it commits to.
    async fn get_filter_entry(&self, height: u32) -> StorageResult<Option<FilterHeaderEntry>>;

    /// Append `entries` atomically. Heights must continue the current tip.
    async fn write_filter_headers(&mut self, entries: &[FilterHeaderEntry]) -> StorageResult<()>;

    /// Drop every entry above `height`.
    async fn rollback_filter_headers_to(&mut self, height: u32) -> StorageResult<()>;
}
