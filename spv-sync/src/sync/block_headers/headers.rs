//! Header batch processing: extension of the best chain, checkpoint enforcement
//! and reorg evaluation.

use std::sync::Arc;
use std::time::Instant;

use bitcoin::block::Header as BlockHeader;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;

use super::HeaderSyncEngine;
use crate::chain::{next_required_difficulty, ChainWork, Checkpoint};
use crate::error::{FatalError, StorageError, SyncResult, ValidationError};
use crate::network::Peer;
use crate::storage::BlockHeaderStorage;
use crate::sync::progress::SyncState;
use crate::types::HeaderNode;
use crate::validation::{check_checkpoint, check_header_sanity, Validator};

/// Outcome of weighing a competing branch against the stored chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReorgDecision {
    /// The stored chain was rolled back to the fork point.
    Accept,
    /// Equal work, the stored chain stays.
    Ignore,
    /// Invalid or lighter branch; the peer has been disconnected.
    Reject,
}

impl<S: BlockHeaderStorage> HeaderSyncEngine<S> {
    /// Process one headers message.
    pub(super) async fn handle_headers(
        &mut self,
        peer: Arc<dyn Peer>,
        headers: &[BlockHeader],
    ) -> SyncResult<()> {
        if headers.is_empty() {
            return Ok(());
        }

        let from_sync_peer = self.status.is_sync_peer(peer.as_ref());
        if from_sync_peer {
            self.last_sync_activity = Instant::now();
        }

        if let Err(e) = self.validator.validate(headers) {
            self.disconnect_peer(peer.as_ref(), &e.to_string());
            return Ok(());
        }

        let adjusted_time = self.status.adjusted_time();
        let mut write_batch: Vec<HeaderNode> = Vec::with_capacity(headers.len());
        let mut final_node: Option<HeaderNode> = None;
        let mut received_checkpoint = false;
        let mut misbehaved: Option<String> = None;

        let mut index = 0;
        while index < headers.len() {
            let header = headers[index];
            let back = self.tip()?;

            if header.prev_blockhash == back.hash() {
                let height = back.height + 1;

                let required = {
                    let storage = self.storage.read().await;
                    next_required_difficulty(&self.header_chain, header.time, &self.params, &*storage)
                        .await
                };
                let required = match required {
                    Ok(bits) => bits,
                    Err(e) => {
                        tracing::warn!("Unable to compute required difficulty at height {}: {}", height, e);
                        break;
                    }
                };

                if let Err(e) =
                    check_header_sanity(&header, height, required, &self.params, adjusted_time)
                {
                    misbehaved = Some(format!("block header at height {} failed sanity check: {}", height, e));
                    break;
                }

                let node = HeaderNode::new(header, height);
                write_batch.push(node);
                self.header_chain.push_back(node);
                peer.update_last_block_height(height);
                self.logger.log_height(header.time, height);
                final_node = Some(node);

                if let Some(checkpoint) = self.next_checkpoint.filter(|cp| cp.height == height) {
                    if let Err(e) = check_checkpoint(&checkpoint, &node) {
                        return self.reject_checkpoint_mismatch(peer.as_ref(), checkpoint, e).await;
                    }
                    tracing::info!(
                        "Verified downloaded block header against checkpoint at height {}/hash {}",
                        checkpoint.height,
                        checkpoint.hash
                    );
                    received_checkpoint = true;
                    break;
                }

                index += 1;
                continue;
            }

            // Everything past the first extending header extends too, so nothing is pending here.
            debug_assert!(write_batch.is_empty());

            if !from_sync_peer && !self.status.block_headers_synced() {
                tracing::debug!(
                    "Ignoring non-connecting headers from {} while syncing from another peer",
                    peer.address()
                );
                break;
            }

            let hash = header.block_hash();
            if hash == back.hash() {
                index += 1;
                continue;
            }

            let storage = self.storage.read().await;
            if storage.get_header_by_hash(&hash).await?.is_some() {
                index += 1;
                continue;
            }
            let fork = storage.get_header_by_hash(&header.prev_blockhash).await?;
            drop(storage);

            let Some(fork) = fork else {
                self.disconnect_peer(
                    peer.as_ref(),
                    &format!("block header {} does not connect to any known block", hash),
                );
                return Ok(());
            };

            match self.evaluate_reorg(&peer, fork, &headers[index..], adjusted_time).await? {
                // The fork point is the new back, the same header now extends it.
                ReorgDecision::Accept => continue,
                ReorgDecision::Ignore | ReorgDecision::Reject => return Ok(()),
            }
        }

        if !write_batch.is_empty() {
            self.storage
                .write()
                .await
                .write_headers(&write_batch)
                .await
                .map_err(|e| FatalError::new("write block headers", e.to_string()))?;
            self.progress.add_processed(write_batch.len() as u32);
        }

        let Some(final_node) = final_node else {
            if let Some(reason) = misbehaved {
                self.disconnect_peer(peer.as_ref(), &reason);
            }
            return Ok(());
        };

        self.progress.update_current_height(final_node.height);
        if received_checkpoint {
            self.next_checkpoint = self.status.checkpoints().next_after(final_node.height).copied();
        }
        self.status.header_tip_signal().publish(final_node);

        if let Some(reason) = misbehaved {
            self.disconnect_peer(peer.as_ref(), &reason);
            return Ok(());
        }

        self.progress.update_target_height(peer.last_block());

        let synced = self.status.block_headers_synced();
        if synced && self.progress.state() != SyncState::Synced {
            tracing::info!("Block headers synced to {}", final_node);
            self.progress.set_state(SyncState::Synced);
        }

        if self.params.always_request_headers || !synced {
            let stop_hash = self.next_checkpoint.map_or(BlockHash::all_zeros(), |cp| cp.hash);
            if let Err(e) = peer.push_get_headers(vec![final_node.hash()], stop_hash) {
                tracing::warn!("Failed to request headers from {}: {}", peer.address(), e);
            }
        }

        Ok(())
    }

    /// Weigh `branch`, whose first header builds on the stored block `fork`, against
    /// the stored chain above `fork`.
    pub(super) async fn evaluate_reorg(
        &mut self,
        peer: &Arc<dyn Peer>,
        fork: HeaderNode,
        branch: &[BlockHeader],
        adjusted_time: u32,
    ) -> SyncResult<ReorgDecision> {
        let tip = self.tip()?;

        let floor = self.status.checkpoints().previous_before(tip.height + 1);
        if fork.height < floor.height {
            self.disconnect_peer(
                peer.as_ref(),
                &format!(
                    "reorg from height {} would cross checkpoint at height {}",
                    fork.height, floor.height
                ),
            );
            return Ok(ReorgDecision::Reject);
        }

        self.reorg_chain.reset(fork);
        for (offset, header) in branch.iter().enumerate() {
            let height = fork.height + 1 + offset as u32;
            let required = {
                let storage = self.storage.read().await;
                next_required_difficulty(&self.reorg_chain, header.time, &self.params, &*storage)
                    .await?
            };
            if let Err(e) = check_header_sanity(header, height, required, &self.params, adjusted_time)
            {
                self.disconnect_peer(
                    peer.as_ref(),
                    &format!("reorg header at height {} failed sanity check: {}", height, e),
                );
                return Ok(ReorgDecision::Reject);
            }
            self.reorg_chain.push_back(HeaderNode::new(*header, height));
        }

        let candidate_work = ChainWork::sum(branch);
        let known_work = self.known_work_above(fork.height, tip.height).await?;

        if known_work > candidate_work {
            self.disconnect_peer(
                peer.as_ref(),
                &format!(
                    "branch from height {} has less work ({}) than the known chain ({})",
                    fork.height, candidate_work, known_work
                ),
            );
            return Ok(ReorgDecision::Reject);
        }
        if known_work == candidate_work {
            tracing::debug!(
                "Branch from {} has the same work as the known chain, keeping the known chain",
                fork
            );
            return Ok(ReorgDecision::Ignore);
        }

        tracing::warn!(
            "Reorganizing from {} to a branch of {} headers forking at {} (work {} > {})",
            tip,
            branch.len(),
            fork,
            candidate_work,
            known_work
        );

        self.status.set_sync_peer(Some(Arc::clone(peer)));
        self.last_sync_activity = Instant::now();

        let new_tip = self
            .storage
            .write()
            .await
            .rollback_to_height(fork.height)
            .await
            .map_err(|e| FatalError::new("rollback block headers", e.to_string()))?;
        let new_tip = HeaderNode::from(new_tip);

        self.header_chain.reset(new_tip);
        self.next_checkpoint = self.status.checkpoints().next_after(new_tip.height).copied();
        self.progress.add_reorg();
        self.progress.update_current_height(new_tip.height);
        self.status.header_tip_signal().publish(new_tip);

        Ok(ReorgDecision::Accept)
    }

    /// Cumulative work of the known chain over `(fork_height, tip_height]`, from the
    /// in-memory window where it reaches, from the store below that.
    async fn known_work_above(&self, fork_height: u32, tip_height: u32) -> SyncResult<ChainWork> {
        let mut work = ChainWork::zero();
        let mut next_height = tip_height;

        for node in self.header_chain.iter_back() {
            if node.height <= fork_height || node.height != next_height {
                break;
            }
            work = work.add_header(&node.header);
            next_height -= 1;
        }

        if next_height > fork_height {
            let storage = self.storage.read().await;
            for height in fork_height + 1..=next_height {
                let header = storage.get_header(height).await?.ok_or_else(|| {
                    StorageError::NotFound(format!("block header at height {}", height))
                })?;
                work = work.add_header(&header);
            }
        }

        Ok(work)
    }

    /// A header landed on a checkpoint height with the wrong hash: drop everything
    /// back to the previous checkpoint and stop talking to the peer.
    async fn reject_checkpoint_mismatch(
        &mut self,
        peer: &dyn Peer,
        checkpoint: Checkpoint,
        evidence: ValidationError,
    ) -> SyncResult<()> {
        let floor = *self.status.checkpoints().previous_before(checkpoint.height);
        tracing::warn!("{}; rolling back to height {}", evidence, floor.height);

        let new_tip = self
            .storage
            .write()
            .await
            .rollback_to_height(floor.height)
            .await
            .map_err(|e| FatalError::new("rollback block headers", e.to_string()))?;
        let new_tip = HeaderNode::from(new_tip);

        self.header_chain.reset(new_tip);
        self.next_checkpoint = self.status.checkpoints().next_after(new_tip.height).copied();
        self.progress.update_current_height(new_tip.height);
        self.status.header_tip_signal().publish(new_tip);

        self.disconnect_peer(peer, &evidence.to_string());
        Ok(())
    }

    /// Disconnect a misbehaving peer and forget it as a sync candidate.
    pub(super) fn disconnect_peer(&mut self, peer: &dyn Peer, reason: &str) {
        tracing::warn!("Disconnecting peer {}: {}", peer.address(), reason);
        peer.disconnect();
        self.candidates.remove(&peer.address());
        if self.status.is_sync_peer(peer) {
            self.status.set_sync_peer(None);
        }
    }

    fn tip(&self) -> SyncResult<HeaderNode> {
        self.header_chain
            .back()
            .copied()
            .ok_or_else(|| crate::error::SyncError::MissingDependency("header chain is empty".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::RwLock;

    use crate::chain::{ChainParams, CheckpointManager};
    use crate::config::SyncConfig;
    use crate::storage::MemoryStorageManager;
    use crate::sync::status::SyncStatus;
    use crate::test_utils::{build_branch, build_header_chain, fixture_time, FixedTimeSource, MockPeer, EASY_BITS};
    use crate::types::FilterHeaderEntry;

    async fn engine(
        params: ChainParams,
        stored: &[HeaderNode],
        now: u32,
    ) -> HeaderSyncEngine<MemoryStorageManager> {
        let mut storage = MemoryStorageManager::with_genesis(params.genesis_header);
        storage.write_headers(stored).await.unwrap();
        let tip = HeaderNode::from(storage.chain_tip().await.unwrap());

        let status = SyncStatus::new(
            tip,
            FilterHeaderEntry {
                filter_header: params.genesis_filter_header,
                height: 0,
                block_hash: params.genesis_hash(),
            },
            CheckpointManager::new(params.checkpoints.clone(), params.genesis_hash()),
            Arc::new(FixedTimeSource::new(now)),
            Duration::from_secs(24 * 60 * 60),
        );
        HeaderSyncEngine::new(
            SyncConfig::default(),
            Arc::new(params),
            Arc::new(RwLock::new(storage)),
            Arc::new(status),
        )
        .await
        .unwrap()
    }

    fn headers(nodes: &[HeaderNode]) -> Vec<BlockHeader> {
        nodes.iter().map(|n| n.header).collect()
    }

    #[tokio::test]
    async fn test_extends_chain_and_requests_more() {
        let params = ChainParams::regtest();
        let nodes = build_header_chain(params.genesis_hash(), 1, 10);
        let mut engine = engine(params, &[], fixture_time(10)).await;
        let peer: Arc<dyn Peer> = Arc::new(MockPeer::new("10.0.0.1:8333", 10));
        engine.status.set_sync_peer(Some(Arc::clone(&peer)));

        engine.handle_headers(Arc::clone(&peer), &headers(&nodes)).await.unwrap();

        assert_eq!(engine.status.header_tip(), nodes[9]);
        assert_eq!(engine.storage.read().await.chain_tip().await.unwrap().height, 10);
        assert_eq!(engine.progress.processed(), 10);
        assert_eq!(engine.best_node(), Some(&nodes[9]));
    }

    #[tokio::test]
    async fn test_stops_at_checkpoint_and_advances_it() {
        let nodes = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 10);
        let params = ChainParams::regtest().with_checkpoints(vec![
            Checkpoint::new(4, nodes[3].hash()),
            Checkpoint::new(8, nodes[7].hash()),
        ]);
        let mut engine = engine(params, &[], fixture_time(10)).await;
        let mock = Arc::new(MockPeer::new("10.0.0.1:8333", 10));
        let peer: Arc<dyn Peer> = mock.clone();
        engine.status.set_sync_peer(Some(Arc::clone(&peer)));

        engine.handle_headers(Arc::clone(&peer), &headers(&nodes)).await.unwrap();

        assert_eq!(engine.status.header_tip().height, 4);
        assert_eq!(engine.next_checkpoint().map(|cp| cp.height), Some(8));
        let requests = mock.get_headers_requests();
        assert_eq!(requests.last().unwrap().0, vec![nodes[3].hash()]);
        assert_eq!(requests.last().unwrap().1, nodes[7].hash());
    }

    #[tokio::test]
    async fn test_checkpoint_mismatch_rolls_back_and_disconnects() {
        let honest = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 10);
        let params = ChainParams::regtest().with_checkpoints(vec![
            Checkpoint::new(3, honest[2].hash()),
            Checkpoint::new(8, honest[7].hash()),
        ]);
        let mut engine = engine(params, &honest[..5], fixture_time(10)).await;

        let forged = build_branch(honest[4].hash(), 6, 4, EASY_BITS, 1);
        let mock = Arc::new(MockPeer::new("10.0.0.2:8333", 10));
        let peer: Arc<dyn Peer> = mock.clone();
        engine.status.set_sync_peer(Some(Arc::clone(&peer)));

        engine.handle_headers(Arc::clone(&peer), &headers(&forged)).await.unwrap();

        assert!(mock.is_disconnected());
        assert_eq!(engine.status.header_tip(), honest[2]);
        assert_eq!(engine.storage.read().await.chain_tip().await.unwrap().height, 3);
        assert_eq!(engine.best_node(), Some(&honest[2]));
        assert_eq!(engine.next_checkpoint().map(|cp| cp.height), Some(8));
        assert!(engine.status.sync_peer().is_none());
    }

    #[tokio::test]
    async fn test_unconnected_headers_disconnect() {
        let params = ChainParams::regtest();
        let stored = build_header_chain(params.genesis_hash(), 1, 3);
        let mut engine = engine(params, &stored, fixture_time(3)).await;

        let orphan = build_branch(BlockHash::from_byte_array([1u8; 32]), 10, 2, EASY_BITS, 2);
        let mock = Arc::new(MockPeer::new("10.0.0.1:8333", 11));
        let peer: Arc<dyn Peer> = mock.clone();
        engine.status.set_sync_peer(Some(Arc::clone(&peer)));

        engine.handle_headers(Arc::clone(&peer), &headers(&orphan)).await.unwrap();

        assert!(mock.is_disconnected());
        assert_eq!(engine.status.header_tip(), stored[2]);
    }

    #[tokio::test]
    async fn test_known_headers_are_skipped() {
        let params = ChainParams::regtest();
        let nodes = build_header_chain(params.genesis_hash(), 1, 6);
        let mut engine = engine(params, &nodes[..4], fixture_time(6)).await;
        let peer: Arc<dyn Peer> = Arc::new(MockPeer::new("10.0.0.1:8333", 6));
        engine.status.set_sync_peer(Some(Arc::clone(&peer)));

        // Overlaps the stored chain by three headers
        engine.handle_headers(Arc::clone(&peer), &headers(&nodes[1..])).await.unwrap();

        assert_eq!(engine.status.header_tip(), nodes[5]);
        assert_eq!(engine.progress.processed(), 2);
        assert_eq!(engine.progress.reorgs(), 0);
    }
}
