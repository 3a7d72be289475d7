//! Cross-checking disputed filters against block contents.
//!
//! Compact filters may report false positives but never false negatives, so a
//! filter that fails to match an output script of its own block is proof the
//! serving peer lied.

use std::collections::BTreeMap;

use bitcoin::bip158::BlockFilter;
use bitcoin::block::Block;
use bitcoin::p2p::message_filter::CFHeaders;
use bitcoin::{BlockHash, Script};

use super::util::check_for_cfheader_mismatch;
use super::FilterHeaderSyncEngine;
use crate::error::{StorageError, SyncError, SyncResult};
use crate::network::{QueryRequest, QueryResponse, FILTER_TYPE_BASIC};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::types::PeerAddr;

/// Peers whose filter for `block` is missing at least one of the block's indexed
/// output scripts.
///
/// Empty scripts and `OP_RETURN` outputs are not indexed by basic filters and are
/// skipped. A filter that cannot be queried is skipped as well: it proves nothing.
pub(super) fn resolve_cfheader_mismatch(
    block: &Block,
    filter_type: u8,
    filters_from_peers: &BTreeMap<PeerAddr, BlockFilter>,
) -> SyncResult<Vec<PeerAddr>> {
    if filter_type != FILTER_TYPE_BASIC {
        return Err(SyncError::Validation(format!("unknown filter type {}", filter_type)));
    }

    let block_hash = block.block_hash();
    let scripts: Vec<&Script> = block
        .txdata
        .iter()
        .flat_map(|tx| tx.output.iter())
        .map(|txout| txout.script_pubkey.as_script())
        .filter(|script| is_indexed_script(script))
        .collect();

    tracing::info!(
        "Attempting to pinpoint cfheaders mismatch for block {} with {} indexed scripts",
        block_hash,
        scripts.len()
    );

    let mut bad_peers = Vec::new();
    for (peer, filter) in filters_from_peers {
        if let Some(script) = first_missing_script(filter, &block_hash, &scripts) {
            tracing::warn!(
                "Filter from peer {} for block {} does not match output script {}",
                peer,
                block_hash,
                script.to_hex_string()
            );
            bad_peers.push(peer.clone());
        }
    }

    Ok(bad_peers)
}

fn is_indexed_script(script: &Script) -> bool {
    !script.is_empty() && !script.is_op_return()
}

fn first_missing_script<'s>(
    filter: &BlockFilter,
    block_hash: &BlockHash,
    scripts: &[&'s Script],
) -> Option<&'s Script> {
    for script in scripts {
        match filter.match_any(block_hash, std::iter::once(script.as_bytes())) {
            Ok(true) => continue,
            Ok(false) => return Some(script),
            Err(e) => {
                tracing::debug!("Unable to query filter for block {}: {}", block_hash, e);
                return None;
            }
        }
    }
    None
}

impl<B, F> FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    /// Ask every peer for the cfheaders starting at `start_height`, up to the block
    /// tip or one full message, whichever is lower.
    pub(super) async fn get_cfheaders_for_all_peers(
        &self,
        start_height: u32,
    ) -> SyncResult<BTreeMap<PeerAddr, CFHeaders>> {
        let mut headers = BTreeMap::new();

        let (stop_hash, stop_height) = {
            let storage = self.block_storage.read().await;
            let tip = storage.chain_tip().await?;
            if tip.height < start_height {
                return Ok(headers);
            }
            if tip.height - start_height >= self.config.max_cfheaders_per_msg {
                let stop_height = start_height + self.config.max_cfheaders_per_msg - 1;
                let header = storage.get_header(stop_height).await?.ok_or_else(|| {
                    StorageError::NotFound(format!("block header at height {}", stop_height))
                })?;
                (header.block_hash(), stop_height)
            } else {
                (tip.hash(), tip.height)
            }
        };

        tracing::debug!(
            "Querying all peers for cfheaders from height {} to {} ({})",
            start_height,
            stop_height,
            stop_hash
        );

        let request = QueryRequest::cfheaders(self.config.filter_type, start_height, stop_hash);
        let mut collect = |peer: &PeerAddr, response: QueryResponse| {
            if let QueryResponse::CFHeaders(msg) = response {
                headers.insert(peer.clone(), msg);
            }
        };
        let result =
            self.network.query_all_peers(request, self.config.query_timeout, &mut collect).await;
        if let Err(e) = result {
            tracing::debug!("cfheaders query from height {} ended early: {}", start_height, e);
        }

        Ok(headers)
    }

    /// Ask every peer for the filter of the single block `block_hash` at `height`.
    pub(super) async fn fetch_filter_from_all_peers(
        &self,
        height: u32,
        block_hash: BlockHash,
    ) -> BTreeMap<PeerAddr, BlockFilter> {
        let mut filters = BTreeMap::new();

        let request = QueryRequest::cfilter(self.config.filter_type, height, block_hash);
        let mut collect = |peer: &PeerAddr, response: QueryResponse| {
            if let QueryResponse::CFilter(msg) = response {
                filters.insert(peer.clone(), BlockFilter::new(&msg.filter));
            }
        };
        let result =
            self.network.query_all_peers(request, self.config.query_timeout, &mut collect).await;
        if let Err(e) = result {
            tracing::debug!("cfilter query for block {} ended early: {}", block_hash, e);
        }

        filters
    }

    /// Find every position where the responses disagree, pin down the liars by
    /// checking their filters against the block, ban them and drop their responses.
    ///
    /// Returns the banned peers.
    pub(super) async fn ban_mismatching_peers(
        &mut self,
        headers: &mut BTreeMap<PeerAddr, CFHeaders>,
        start_height: u32,
    ) -> SyncResult<Vec<PeerAddr>> {
        let mut banned = Vec::new();
        let max_len = headers.values().map(|msg| msg.filter_hashes.len()).max().unwrap_or(0);

        for idx in 0..max_len {
            if !check_for_cfheader_mismatch(headers, idx) {
                continue;
            }

            let height = start_height + idx as u32;
            tracing::warn!("Detected cfheaders mismatch at height {}", height);

            let block_hash = self
                .block_storage
                .read()
                .await
                .get_header(height)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("block header at height {}", height)))?
                .block_hash();
            let block = self.fetch_verified_block(block_hash).await?;

            let filters = self.fetch_filter_from_all_peers(height, block_hash).await;
            tracing::warn!(
                "Attempting to reconcile cfheaders mismatch amongst {} peers",
                filters.len()
            );

            let bad_peers = resolve_cfheader_mismatch(&block, self.config.filter_type, &filters)?;
            for peer in bad_peers {
                self.ban_peer(
                    &peer,
                    &format!("filter for block {} at height {} misses block scripts", block_hash, height),
                );
                headers.remove(&peer);
                banned.push(peer);
            }
        }

        Ok(banned)
    }

    /// Download `block_hash` and make sure the block is the one its header commits to.
    async fn fetch_verified_block(&self, block_hash: BlockHash) -> SyncResult<Block> {
        let block = self.network.get_block(block_hash).await?;
        if block.block_hash() != block_hash || !block.check_merkle_root() {
            return Err(SyncError::Validation(format!(
                "block received for {} does not match its header",
                block_hash
            )));
        }
        Ok(block)
    }

    /// Ban `addr` and disconnect it if still connected.
    pub(super) fn ban_peer(&mut self, addr: &PeerAddr, reason: &str) {
        tracing::warn!("Banning peer {}: {}", addr, reason);
        self.network.ban_peer(addr, reason);
        if let Some(peer) = self.network.peer(addr) {
            peer.disconnect();
        }
        self.checkpoint_cache.remove(addr);
        self.progress.add_banned(1);
    }
}
