//! Block-header sync engine.
//!
//! Consumes peer events from a bounded queue, one at a time, and owns every write
//! to the block-header store. Peer selection and inventory handling live here;
//! header batch processing and reorg evaluation live in `headers.rs`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainParams, Checkpoint, HeaderChain};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::network::{HeaderEvent, Peer};
use crate::storage::BlockHeaderStorage;
use crate::sync::progress::{BlockHeadersProgress, ProgressLogger, SyncState};
use crate::sync::status::SyncStatus;
use crate::types::{HeaderNode, PeerAddr};
use crate::validation::BlockHeaderValidator;

/// Shortest period between sync-peer stall checks.
const MIN_STALL_CHECK_PERIOD: Duration = Duration::from_millis(100);

/// Downloads, validates and stores block headers.
///
/// Generic over `S: BlockHeaderStorage` so any store honoring the append-only
/// contract can back it.
pub struct HeaderSyncEngine<S: BlockHeaderStorage> {
    pub(super) config: SyncConfig,
    pub(super) params: Arc<ChainParams>,
    pub(super) storage: Arc<RwLock<S>>,
    pub(super) status: Arc<SyncStatus>,
    pub(super) validator: BlockHeaderValidator,
    /// Recently processed headers on the best chain.
    pub(super) header_chain: HeaderChain,
    /// Scratch chain for validating a competing branch.
    pub(super) reorg_chain: HeaderChain,
    /// Full-node peers that may serve as sync peer, keyed by address.
    pub(super) candidates: BTreeMap<PeerAddr, Arc<dyn Peer>>,
    pub(super) next_checkpoint: Option<Checkpoint>,
    /// Stop hash of the last inv-triggered header request.
    pub(super) last_requested: Option<BlockHash>,
    pub(super) progress: BlockHeadersProgress,
    pub(super) logger: ProgressLogger,
    /// Last time the sync peer was selected or sent headers.
    pub(super) last_sync_activity: Instant,
}

impl<S: BlockHeaderStorage> std::fmt::Debug for HeaderSyncEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderSyncEngine")
            .field("progress", &self.progress)
            .field("next_checkpoint", &self.next_checkpoint)
            .field("candidates", &self.candidates.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S: BlockHeaderStorage> HeaderSyncEngine<S> {
    /// Create an engine anchored at the current tip of `storage`.
    pub async fn new(
        config: SyncConfig,
        params: Arc<ChainParams>,
        storage: Arc<RwLock<S>>,
        status: Arc<SyncStatus>,
    ) -> SyncResult<Self> {
        let tip: HeaderNode = storage.read().await.chain_tip().await?.into();

        let mut header_chain = HeaderChain::new(config.header_chain_capacity);
        header_chain.reset(tip);
        let reorg_chain = HeaderChain::new(config.header_chain_capacity);

        let mut progress = BlockHeadersProgress::default();
        progress.update_current_height(tip.height);
        progress.update_target_height(tip.height);

        let next_checkpoint = status.checkpoints().next_after(tip.height).copied();
        let logger = ProgressLogger::new("block header", config.progress_log_interval);

        tracing::info!("Header sync engine initialized at {}", tip);

        Ok(Self {
            config,
            params,
            storage,
            status,
            validator: BlockHeaderValidator::new(),
            header_chain,
            reorg_chain,
            candidates: BTreeMap::new(),
            next_checkpoint,
            last_requested: None,
            progress,
            logger,
            last_sync_activity: Instant::now(),
        })
    }

    pub fn progress(&self) -> &BlockHeadersProgress {
        &self.progress
    }

    pub fn next_checkpoint(&self) -> Option<&Checkpoint> {
        self.next_checkpoint.as_ref()
    }

    /// Most recent header in the in-memory window.
    pub fn best_node(&self) -> Option<&HeaderNode> {
        self.header_chain.back()
    }

    /// Process events until `cancel` fires or every sender is gone.
    ///
    /// Errors scoped to one event are logged and dropped. A fatal error cancels
    /// the shared token and is returned.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<HeaderEvent>,
        cancel: CancellationToken,
    ) -> SyncResult<()> {
        self.progress.set_state(SyncState::WaitingForConnections);

        let period = (self.config.sync_peer_stall_tolerance / 2).max(MIN_STALL_CHECK_PERIOD);
        let mut stall_check = tokio::time::interval(period);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Header event queue closed");
                        break;
                    };
                    let kind = event.kind();
                    self.handle_event(event).await.map_err(|e| (kind, e))
                }
                _ = stall_check.tick() => {
                    self.check_sync_peer_stall().await.map_err(|e| ("stall_check", e))
                }
            };

            if let Err((kind, e)) = result {
                if e.is_fatal() {
                    tracing::error!("Header sync stopped on {} event: {}", kind, e);
                    self.progress.set_state(SyncState::Error);
                    cancel.cancel();
                    return Err(e);
                }
                tracing::warn!("Failed to handle {} event ({}): {}", kind, e.category(), e);
            }
        }

        self.progress.set_state(SyncState::Stopped);
        tracing::info!("Header sync engine stopped: {}", self.progress);
        Ok(())
    }

    /// Dispatch one inbound event.
    pub async fn handle_event(&mut self, event: HeaderEvent) -> SyncResult<()> {
        match event {
            HeaderEvent::NewPeer(peer) => self.handle_new_peer(peer).await,
            HeaderEvent::DonePeer(addr) => self.handle_done_peer(&addr).await,
            HeaderEvent::Inv {
                peer,
                inventory,
            } => self.handle_inv(peer, &inventory).await,
            HeaderEvent::Headers {
                peer,
                headers,
            } => self.handle_headers(peer, &headers).await,
        }
    }

    pub(super) async fn store_tip(&self) -> SyncResult<HeaderNode> {
        Ok(self.storage.read().await.chain_tip().await?.into())
    }

    /// Register a newly connected peer as a sync candidate.
    pub(super) async fn handle_new_peer(&mut self, peer: Arc<dyn Peer>) -> SyncResult<()> {
        let addr = peer.address();
        if !peer.services().has(ServiceFlags::NETWORK) {
            tracing::debug!("Peer {} is not a full node, not a sync candidate", addr);
            return Ok(());
        }

        tracing::info!("New sync candidate {} at height {}", addr, peer.starting_height());
        self.candidates.insert(addr.clone(), Arc::clone(&peer));

        // Already current and the newcomer knows more: ask it right away. Without a
        // sync peer, start_sync below picks a peer and sends the request itself.
        let tip = self.store_tip().await?;
        if self.status.sync_peer().is_some()
            && tip.height < peer.starting_height()
            && self.status.block_headers_synced()
        {
            let locator = self.storage.read().await.latest_block_locator().await?;
            if let Err(e) = peer.push_get_headers(locator, BlockHash::all_zeros()) {
                tracing::debug!("Failed to request headers from new peer {}: {}", addr, e);
            }
        }

        self.start_sync().await
    }

    pub(super) async fn handle_done_peer(&mut self, addr: &PeerAddr) -> SyncResult<()> {
        self.candidates.remove(addr);
        tracing::info!("Lost peer {}", addr);

        let was_sync_peer = self.status.sync_peer().is_some_and(|peer| &peer.address() == addr);
        if !was_sync_peer {
            return Ok(());
        }

        self.status.set_sync_peer(None);
        let tip = self.store_tip().await?;
        self.header_chain.reset(tip);
        self.start_sync().await
    }

    /// Pick the best candidate and request headers from it, unless a sync peer is set.
    pub(super) async fn start_sync(&mut self) -> SyncResult<()> {
        if self.status.sync_peer().is_some() {
            return Ok(());
        }

        let best_height = self.store_tip().await?.height;

        // A peer equal to our height stays: it will likely have a new block soon.
        self.candidates.retain(|addr, peer| {
            let keep = peer.last_block() >= best_height;
            if !keep {
                tracing::debug!(
                    "Dropping sync candidate {} at height {} below ours {}",
                    addr,
                    peer.last_block(),
                    best_height
                );
            }
            keep
        });

        let mut best: Option<&Arc<dyn Peer>> = None;
        for peer in self.candidates.values() {
            best = match best {
                Some(current) if !is_better_sync_candidate(peer.as_ref(), current.as_ref()) => {
                    Some(current)
                }
                _ => Some(peer),
            };
        }

        let Some(best) = best.cloned() else {
            tracing::warn!("No sync peer candidates available");
            self.progress.set_state(SyncState::WaitingForConnections);
            return Ok(());
        };

        let locator = self.storage.read().await.latest_block_locator().await?;

        tracing::info!("Syncing to block height {} from peer {}", best.last_block(), best.address());
        self.status.set_sync_peer(Some(Arc::clone(&best)));
        self.last_sync_activity = Instant::now();
        self.progress.set_state(SyncState::Syncing);
        self.progress.update_target_height(best.last_block());

        let stop_hash = match self.next_checkpoint {
            Some(checkpoint) if best_height < checkpoint.height => {
                tracing::info!(
                    "Downloading headers for blocks {} to {} from peer {}",
                    best_height + 1,
                    checkpoint.height,
                    best.address()
                );
                checkpoint.hash
            }
            _ => {
                tracing::info!(
                    "Fetching headers from tip (height {}) from peer {}",
                    best_height,
                    best.address()
                );
                BlockHash::all_zeros()
            }
        };

        if let Err(e) = best.push_get_headers(locator, stop_hash) {
            tracing::debug!("Failed to request headers from sync peer {}: {}", best.address(), e);
        }
        Ok(())
    }

    /// React to a block announcement.
    pub(super) async fn handle_inv(
        &mut self,
        peer: Arc<dyn Peer>,
        inventory: &[Inventory],
    ) -> SyncResult<()> {
        let last_block = inventory.iter().rev().find_map(|item| match item {
            Inventory::Block(hash) | Inventory::WitnessBlock(hash) => Some(*hash),
            _ => None,
        });

        let from_sync_peer = self.status.is_sync_peer(peer.as_ref());
        let synced = self.status.block_headers_synced();

        if let Some(hash) = last_block {
            if !from_sync_peer || synced {
                peer.update_last_announced_block(hash);
            }
        }

        // Announcements from other peers mid-sync are likely orphans.
        if !from_sync_peer && !synced {
            return Ok(());
        }

        let Some(announced) = last_block else {
            return Ok(());
        };

        if synced {
            let height = self.storage.read().await.get_header_height_by_hash(&announced).await?;
            if let Some(height) = height {
                peer.update_last_block_height(height);
            }
        }

        let Some(back) = self.header_chain.back().copied() else {
            return Ok(());
        };
        let back_hash = back.hash();
        if announced == back_hash || self.last_requested == Some(announced) {
            return Ok(());
        }

        let mut locator = vec![back_hash];
        match self.storage.read().await.latest_block_locator().await {
            Ok(known) => locator.extend(known),
            Err(e) => tracing::debug!("Using tip-only locator: {}", e),
        }

        peer.push_get_headers(locator, announced)?;
        self.last_requested = Some(announced);
        tracing::debug!("Requested headers up to announced block {} from {}", announced, peer.address());
        Ok(())
    }

    /// Replace a sync peer that stopped delivering headers before we caught up.
    pub(super) async fn check_sync_peer_stall(&mut self) -> SyncResult<()> {
        let Some(peer) = self.status.sync_peer() else {
            if !self.candidates.is_empty() {
                return self.start_sync().await;
            }
            return Ok(());
        };

        let idle = self.last_sync_activity.elapsed();
        if idle < self.config.sync_peer_stall_tolerance || self.status.block_headers_synced() {
            return Ok(());
        }

        tracing::warn!(
            "Sync peer {} sent no headers for {:?} -- disconnecting",
            peer.address(),
            idle
        );
        peer.disconnect();
        self.candidates.remove(&peer.address());
        self.status.set_sync_peer(None);

        let tip = self.store_tip().await?;
        self.header_chain.reset(tip);
        self.start_sync().await
    }
}

/// Higher advertised height wins; equal heights go to the lower measured latency.
pub(super) fn is_better_sync_candidate(candidate: &dyn Peer, best: &dyn Peer) -> bool {
    match candidate.last_block().cmp(&best.last_block()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match (candidate.last_ping(), best.last_ping()) {
            (Some(candidate_ping), Some(best_ping)) => candidate_ping < best_ping,
            (Some(_), None) => true,
            _ => false,
        },
    }
}
