//! In-memory storage implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::block::Header as BlockHeader;
use bitcoin::BlockHash;

use crate::error::{StorageError, StorageResult};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::types::{BlockHeaderTip, FilterHeaderEntry, HeaderNode};

/// In-memory block-header and filter-header log.
///
/// Implements both storage traits so one type can back either store. Validation of
/// a batch happens before anything is applied, which makes every write atomic.
#[derive(Debug, Clone)]
pub struct MemoryStorageManager {
    headers: Vec<BlockHeader>,
    // Reverse index for O(1) lookups
    header_hash_index: HashMap<BlockHash, u32>,
    filter_headers: Vec<FilterHeaderEntry>,
    /// When set, the next header write fails without applying anything.
    fail_next_write: bool,
}

impl MemoryStorageManager {
    /// A block-header log holding only `genesis` at height 0.
    pub fn with_genesis(genesis: BlockHeader) -> Self {
        let mut header_hash_index = HashMap::new();
        header_hash_index.insert(genesis.block_hash(), 0);
        Self {
            headers: vec![genesis],
            header_hash_index,
            filter_headers: Vec::new(),
            fail_next_write: false,
        }
    }

    /// Make the next header or filter-header write fail, for exercising fatal paths.
    pub fn fail_next_write(&mut self) {
        self.fail_next_write = true;
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn filter_header_count(&self) -> usize {
        self.filter_headers.len()
    }

    fn take_injected_failure(&mut self) -> StorageResult<()> {
        if std::mem::take(&mut self.fail_next_write) {
            return Err(StorageError::WriteFailed("injected write failure".to_string()));
        }
        Ok(())
    }

    fn tip_node(&self) -> StorageResult<HeaderNode> {
        let header = self
            .headers
            .last()
            .ok_or_else(|| StorageError::InconsistentState("empty header store".to_string()))?;
        Ok(HeaderNode::new(*header, self.headers.len() as u32 - 1))
    }
}

#[async_trait]
impl BlockHeaderStorage for MemoryStorageManager {
    async fn chain_tip(&self) -> StorageResult<BlockHeaderTip> {
        self.tip_node().map(BlockHeaderTip::from)
    }

    async fn get_header(&self, height: u32) -> StorageResult<Option<BlockHeader>> {
        Ok(self.headers.get(height as usize).copied())
    }

    async fn get_header_by_hash(&self, hash: &BlockHash) -> StorageResult<Option<HeaderNode>> {
        Ok(self
            .header_hash_index
            .get(hash)
            .and_then(|&height| self.headers.get(height as usize).map(|h| HeaderNode::new(*h, height))))
    }

    async fn write_headers(&mut self, headers: &[HeaderNode]) -> StorageResult<()> {
        self.take_injected_failure()?;

        let mut prev = self.tip_node()?;
        for node in headers {
            if !prev.is_parent_of(node) {
                return Err(StorageError::InconsistentState(format!(
                    "header {} does not extend {}",
                    node, prev
                )));
            }
            prev = *node;
        }

        for node in headers {
            self.header_hash_index.insert(node.hash(), node.height);
            self.headers.push(node.header);
        }
        Ok(())
    }

    async fn rollback_to_height(&mut self, height: u32) -> StorageResult<BlockHeaderTip> {
        if height as usize >= self.headers.len() {
            return Err(StorageError::NotFound(format!(
                "rollback target {} above tip {}",
                height,
                self.headers.len().saturating_sub(1)
            )));
        }
        for removed in self.headers.drain(height as usize + 1..) {
            self.header_hash_index.remove(&removed.block_hash());
        }
        self.chain_tip().await
    }
}

#[async_trait]
impl FilterHeaderStorage for MemoryStorageManager {
    async fn filter_chain_tip(&self) -> StorageResult<Option<FilterHeaderEntry>> {
        Ok(self.filter_headers.last().copied())
    }

    async fn get_filter_entry(&self, height: u32) -> StorageResult<Option<FilterHeaderEntry>> {
        Ok(self.filter_headers.get(height as usize).copied())
    }

    async fn write_filter_headers(&mut self, entries: &[FilterHeaderEntry]) -> StorageResult<()> {
        self.take_injected_failure()?;

        let mut expected = self.filter_headers.len() as u32;
        for entry in entries {
            if entry.height != expected {
                return Err(StorageError::InconsistentState(format!(
                    "filter header at height {} written out of order, expected {}",
                    entry.height, expected
                )));
            }
            expected += 1;
        }

        self.filter_headers.extend_from_slice(entries);
        Ok(())
    }

    async fn rollback_filter_headers_to(&mut self, height: u32) -> StorageResult<()> {
        self.filter_headers.truncate(height as usize + 1);
        Ok(())
    }
}
