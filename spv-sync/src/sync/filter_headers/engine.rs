//! Filter-header sync engine.
//!
//! Waits for block-header progress, negotiates filter checkpoints with the peer
//! set, downloads the checkpointed range in one pipelined batch and then follows
//! the block-header tip one cfheaders message at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip158::FilterHeader;
use bitcoin::p2p::message_filter::CFHeaders;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::util::check_for_cfheader_mismatch;
use crate::chain::ChainParams;
use crate::config::SyncConfig;
use crate::error::{FatalError, StorageError, SyncError, SyncResult};
use crate::network::PeerNetwork;
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::sync::progress::{FilterHeadersProgress, ProgressLogger, SyncState};
use crate::sync::status::SyncStatus;
use crate::types::{FilterHeaderEntry, HeaderNode, PeerAddr};

/// Downloads, cross-checks and stores BIP 157 filter headers.
pub struct FilterHeaderSyncEngine<B: BlockHeaderStorage, F: FilterHeaderStorage> {
    pub(super) config: SyncConfig,
    pub(super) params: Arc<ChainParams>,
    pub(super) block_storage: Arc<RwLock<B>>,
    pub(super) filter_storage: Arc<RwLock<F>>,
    pub(super) network: Arc<dyn PeerNetwork>,
    pub(super) status: Arc<SyncStatus>,
    pub(super) progress: FilterHeadersProgress,
    pub(super) logger: ProgressLogger,
    /// Checkpoint lists from the last cfcheckpt round, keyed by peer.
    pub(super) checkpoint_cache: BTreeMap<PeerAddr, Vec<FilterHeader>>,
}

impl<B, F> std::fmt::Debug for FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterHeaderSyncEngine")
            .field("progress", &self.progress)
            .field("checkpoint_peers", &self.checkpoint_cache.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<B, F> FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    /// Create an engine over the two stores. An empty filter store is seeded with
    /// the genesis filter header.
    pub async fn new(
        config: SyncConfig,
        params: Arc<ChainParams>,
        block_storage: Arc<RwLock<B>>,
        filter_storage: Arc<RwLock<F>>,
        network: Arc<dyn PeerNetwork>,
        status: Arc<SyncStatus>,
    ) -> SyncResult<Self> {
        let tip = {
            let mut storage = filter_storage.write().await;
            match storage.filter_chain_tip().await? {
                Some(tip) => tip,
                None => {
                    let genesis = genesis_entry(&params);
                    storage
                        .write_filter_headers(&[genesis])
                        .await
                        .map_err(|e| FatalError::new("seed filter headers", e.to_string()))?;
                    tracing::info!("Seeded filter header store with genesis {}", genesis.filter_header);
                    genesis
                }
            }
        };
        status.filter_tip_signal().publish(tip);

        let mut progress = FilterHeadersProgress::default();
        progress.update_current_height(tip.height);
        progress.update_block_header_tip_height(status.header_tip().height);

        let logger = ProgressLogger::new("filter header", config.progress_log_interval);

        tracing::info!(
            "Filter header sync engine initialized at height {} ({})",
            tip.height,
            tip.filter_header
        );

        Ok(Self {
            config,
            params,
            block_storage,
            filter_storage,
            network,
            status,
            progress,
            logger,
            checkpoint_cache: BTreeMap::new(),
        })
    }

    pub fn progress(&self) -> &FilterHeadersProgress {
        &self.progress
    }

    /// Run sync rounds until `cancel` fires.
    ///
    /// A failed round is logged and retried after `query_timeout`. A fatal error
    /// cancels the shared token and is returned.
    pub async fn run(mut self, cancel: CancellationToken) -> SyncResult<()> {
        loop {
            match self.sync_round(&cancel).await {
                Ok(()) => {}
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!("Filter header sync stopped: {}", e);
                    self.progress.set_state(SyncState::Error);
                    cancel.cancel();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Filter header sync round failed ({}): {}", e.category(), e);
                    if self.pause(self.config.query_timeout, &cancel).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.progress.set_state(SyncState::Stopped);
        tracing::info!("Filter header sync engine stopped: {}", self.progress);
        Ok(())
    }

    /// One pass through the state machine: wait for header progress, catch up on
    /// the checkpointed range, then follow the tip until the block headers run a
    /// full interval ahead again.
    pub(super) async fn sync_round(&mut self, cancel: &CancellationToken) -> SyncResult<()> {
        let interval = self.config.filter_checkpoint_interval;

        self.progress.set_state(SyncState::WaitForEvents);
        let filter_height = self.status.filter_tip().height;
        let status = Arc::clone(&self.status);
        let header_tip = self
            .status
            .header_tip_signal()
            .wait_for(cancel, move |tip| {
                filter_height.saturating_add(interval) <= tip.height || status.headers_synced_at(tip)
            })
            .await?;
        self.progress.update_block_header_tip_height(header_tip.height);

        let lag = header_tip.height.saturating_sub(filter_height);
        if self.status.headers_synced_at(&header_tip) && lag < interval {
            tracing::debug!(
                "Filter headers {} behind synced block headers, following the tip",
                lag
            );
            return self.follow_tip(cancel).await;
        }

        self.progress.set_state(SyncState::Negotiating);
        let block_tip: HeaderNode = self.block_storage.read().await.chain_tip().await?.into();
        let checkpoints = self.negotiate_checkpoints(block_tip, cancel).await?;

        self.progress.set_state(SyncState::Syncing);
        let before = self.filter_tip().await?.height;
        self.fetch_checkpointed(&checkpoints, cancel).await?;
        let after = self.filter_tip().await?.height;

        let header_tip = self.status.header_tip();
        let lag = header_tip.height.saturating_sub(after);
        if lag >= interval {
            if after == before {
                return Err(SyncError::Network(format!(
                    "checkpointed fetch stalled at height {} with block headers at {}",
                    after, header_tip.height
                )));
            }
            return Ok(());
        }
        if !self.status.headers_synced_at(&header_tip) {
            return Ok(());
        }

        self.follow_tip(cancel).await
    }

    /// Fetch uncheckpointed cfheaders each time the block-header tip moves.
    ///
    /// Returns once block headers are a full interval ahead of filter headers.
    async fn follow_tip(&mut self, cancel: &CancellationToken) -> SyncResult<()> {
        let interval = self.config.filter_checkpoint_interval;

        loop {
            self.progress.set_state(SyncState::Synced);
            let filter_tip = self.status.filter_tip();
            let header_tip = self
                .status
                .header_tip_signal()
                .wait_for(cancel, move |tip| tip.hash() != filter_tip.block_hash)
                .await?;
            self.progress.update_block_header_tip_height(header_tip.height);

            if header_tip.height.saturating_sub(filter_tip.height) >= interval {
                tracing::debug!(
                    "Block headers at {} are a full interval past filter headers at {}",
                    header_tip.height,
                    filter_tip.height
                );
                return Ok(());
            }

            self.progress.set_state(SyncState::Syncing);
            if let Err(e) = self.fetch_uncheckpointed().await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::debug!("Failed to fetch uncheckpointed cfheaders: {}", e);
                self.pause(self.config.query_timeout, cancel).await?;
            }
        }
    }

    /// Fetch and write the next cfheaders message past the filter tip, banning
    /// peers proven to serve bad filters along the way.
    pub(super) async fn fetch_uncheckpointed(&mut self) -> SyncResult<()> {
        self.reconcile_filter_chain().await?;

        let filter_tip = self.filter_tip().await?;
        let block_tip = self.block_storage.read().await.chain_tip().await?;
        if block_tip.height < filter_tip.height {
            return Err(SyncError::InvalidState(format!(
                "block height {} below filter height {}, reorg in progress",
                block_tip.height, filter_tip.height
            )));
        }
        if block_tip.height == filter_tip.height {
            return Ok(());
        }

        let start_height = filter_tip.height + 1;
        let max_len = self.config.max_cfheaders_per_msg as usize;
        let mut headers = self.get_cfheaders_for_all_peers(start_height).await?;
        headers.retain(|peer, msg| {
            let usable = msg.previous_filter_header == filter_tip.filter_header
                && !msg.filter_hashes.is_empty()
                && msg.filter_hashes.len() <= max_len;
            if !usable {
                tracing::debug!(
                    "Ignoring cfheaders from {} not chained to filter tip {}",
                    peer,
                    filter_tip.filter_header
                );
            }
            usable
        });
        if headers.is_empty() {
            return Err(SyncError::Network(format!(
                "no peer served cfheaders from height {}",
                start_height
            )));
        }

        self.ban_mismatching_peers(&mut headers, start_height).await?;

        let max_len = headers.values().map(|msg| msg.filter_hashes.len()).max().unwrap_or(0);
        if (0..max_len).any(|idx| check_for_cfheader_mismatch(&headers, idx)) {
            return Err(SyncError::Validation(format!(
                "cfheaders from height {} still disagree after filter checks",
                start_height
            )));
        }

        let Some(best) = longest_response(&headers) else {
            return Err(SyncError::Network(format!(
                "every cfheaders response from height {} was discarded",
                start_height
            )));
        };
        let best = best.clone();
        self.write_cfheaders(&best).await?;
        Ok(())
    }

    /// Roll the filter store back to the last height whose block hash still
    /// matches the block store.
    ///
    /// Only runs while the header engine is settled, that is, when the published
    /// header tip is the block store's tip.
    pub(super) async fn reconcile_filter_chain(&mut self) -> SyncResult<()> {
        let block_storage = self.block_storage.read().await;
        let block_tip = block_storage.chain_tip().await?;
        if block_tip.hash() != self.status.header_tip().hash() {
            return Err(SyncError::InvalidState(
                "block header store is mid-update".to_string(),
            ));
        }

        let mut filter_storage = self.filter_storage.write().await;
        let filter_tip = filter_storage
            .filter_chain_tip()
            .await?
            .ok_or_else(|| SyncError::MissingDependency("filter header store is empty".into()))?;

        let mut height = filter_tip.height.min(block_tip.height);
        let common = loop {
            let entry = filter_storage.get_filter_entry(height).await?;
            let header = block_storage.get_header(height).await?;
            match (entry, header) {
                (Some(entry), Some(header)) if entry.block_hash == header.block_hash() => {
                    break entry;
                }
                _ if height == 0 => {
                    return Err(StorageError::InconsistentState(
                        "filter header store does not start at the genesis block".to_string(),
                    )
                    .into());
                }
                _ => height -= 1,
            }
        };

        if common.height == filter_tip.height {
            return Ok(());
        }

        filter_storage
            .rollback_filter_headers_to(common.height)
            .await
            .map_err(|e| FatalError::new("rollback filter headers", e.to_string()))?;
        drop(filter_storage);
        drop(block_storage);

        tracing::warn!(
            "Rolled filter headers back from height {} to {} to follow a block reorg",
            filter_tip.height,
            common.height
        );
        self.progress.update_current_height(common.height);
        self.status.filter_tip_signal().publish(common);
        Ok(())
    }

    /// Sleep for `duration` unless `cancel` fires first.
    pub(super) async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> SyncResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub(super) async fn filter_tip(&self) -> SyncResult<FilterHeaderEntry> {
        self.filter_storage
            .read()
            .await
            .filter_chain_tip()
            .await?
            .ok_or_else(|| SyncError::MissingDependency("filter header store is empty".into()))
    }
}

/// Filter-header entry for the genesis block of `params`.
pub(crate) fn genesis_entry(params: &ChainParams) -> FilterHeaderEntry {
    FilterHeaderEntry {
        filter_header: params.genesis_filter_header,
        height: 0,
        block_hash: params.genesis_hash(),
    }
}

/// The response with the most filter hashes, earliest peer address on ties.
fn longest_response(headers: &BTreeMap<PeerAddr, CFHeaders>) -> Option<&CFHeaders> {
    let mut best: Option<&CFHeaders> = None;
    for msg in headers.values() {
        if best.map_or(true, |b| msg.filter_hashes.len() > b.filter_hashes.len()) {
            best = Some(msg);
        }
    }
    best
}
