//! Owns the two sync engines and their shared state.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainParams, CheckpointManager};
use crate::config::SyncConfig;
use crate::error::{Result as SpvResult, SpvError, SyncError, SyncResult};
use crate::network::{HeaderEvent, PeerNetwork};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::sync::block_headers::HeaderSyncEngine;
use crate::sync::filter_headers::{genesis_entry, FilterHeaderSyncEngine};
use crate::sync::status::SyncStatus;
use crate::types::{HeaderNode, TimeSource};

/// Runs the header and filter-header engines as background tasks.
///
/// Peer tasks feed the header engine through [`SyncCoordinator::header_events`].
/// Both engines stop when [`SyncCoordinator::shutdown`] is called or when either
/// of them hits a fatal error.
pub struct SyncCoordinator {
    status: Arc<SyncStatus>,
    header_events: mpsc::Sender<HeaderEvent>,
    cancel: CancellationToken,
    header_task: Option<JoinHandle<SyncResult<()>>>,
    filter_task: Option<JoinHandle<SyncResult<()>>>,
}

impl SyncCoordinator {
    /// Validate `config`, build both engines over the given stores and spawn them.
    pub async fn start<B, F>(
        config: SyncConfig,
        params: ChainParams,
        block_store: B,
        filter_store: F,
        network: Arc<dyn PeerNetwork>,
        time_source: Arc<dyn TimeSource>,
    ) -> SpvResult<Self>
    where
        B: BlockHeaderStorage + 'static,
        F: FilterHeaderStorage + 'static,
    {
        config.validate().map_err(SpvError::Config)?;

        let header_tip: HeaderNode = block_store.chain_tip().await?.into();
        let filter_tip = filter_store.filter_chain_tip().await?.unwrap_or_else(|| genesis_entry(&params));

        let params = Arc::new(params);
        let status = Arc::new(SyncStatus::new(
            header_tip,
            filter_tip,
            CheckpointManager::new(params.checkpoints.clone(), params.genesis_hash()),
            time_source,
            config.synced_tip_max_age,
        ));

        let block_store = Arc::new(RwLock::new(block_store));
        let filter_store = Arc::new(RwLock::new(filter_store));

        let header_engine = HeaderSyncEngine::new(
            config.clone(),
            Arc::clone(&params),
            Arc::clone(&block_store),
            Arc::clone(&status),
        )
        .await?;
        let filter_engine = FilterHeaderSyncEngine::new(
            config.clone(),
            Arc::clone(&params),
            block_store,
            filter_store,
            network,
            Arc::clone(&status),
        )
        .await?;

        let (header_events, events_rx) = mpsc::channel(config.inbound_queue_capacity);
        let cancel = CancellationToken::new();

        let header_task = tokio::spawn(header_engine.run(events_rx, cancel.clone()));
        let filter_task = tokio::spawn(filter_engine.run(cancel.clone()));

        tracing::info!(
            "Sync started at block height {}, filter height {}",
            header_tip.height,
            filter_tip.height
        );

        Ok(Self {
            status,
            header_events,
            cancel,
            header_task: Some(header_task),
            filter_task: Some(filter_task),
        })
    }

    /// Sender for peer events consumed by the header engine.
    pub fn header_events(&self) -> mpsc::Sender<HeaderEvent> {
        self.header_events.clone()
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        Arc::clone(&self.status)
    }

    /// Token cancelled on shutdown or when an engine fails fatally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop both engines and wait for them.
    ///
    /// Returns the first fatal error either engine stopped with.
    pub async fn shutdown(mut self) -> SpvResult<()> {
        self.cancel.cancel();

        let mut first_error: Option<SpvError> = None;
        for (name, task) in [("header", self.header_task.take()), ("filter header", self.filter_task.take())] {
            let Some(task) = task else {
                continue;
            };
            let result = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(SyncError::Cancelled)) => continue,
                Ok(Err(e)) => SpvError::Sync(e),
                Err(e) => SpvError::TaskJoin(format!("{} engine: {}", name, e)),
            };
            tracing::error!("The {} engine stopped with an error: {}", name, result);
            first_error.get_or_insert(result);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Sync engines stopped");
                Ok(())
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("header_tip", &self.status.header_tip().height)
            .field("filter_tip", &self.status.filter_tip().height)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageManager;
    use crate::test_utils::{fixture_time, FixedTimeSource, MockPeerNetwork};

    fn start_args() -> (ChainParams, MemoryStorageManager, MemoryStorageManager, Arc<MockPeerNetwork>) {
        let params = ChainParams::regtest();
        let block_store = MemoryStorageManager::with_genesis(params.genesis_header);
        let filter_store = MemoryStorageManager::with_genesis(params.genesis_header);
        let network = Arc::new(MockPeerNetwork::new(params.genesis_filter_header, 1000));
        (params, block_store, filter_store, network)
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (params, block_store, filter_store, network) = start_args();
        let coordinator = SyncCoordinator::start(
            SyncConfig::default(),
            params.clone(),
            block_store,
            filter_store,
            network,
            Arc::new(FixedTimeSource::new(fixture_time(0))),
        )
        .await
        .unwrap();

        assert!(coordinator.is_running());
        assert_eq!(coordinator.status().filter_tip(), genesis_entry(&params));

        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (params, block_store, filter_store, network) = start_args();
        let result = SyncCoordinator::start(
            SyncConfig::default().with_filter_checkpoint_interval(0),
            params,
            block_store,
            filter_store,
            network,
            Arc::new(FixedTimeSource::new(fixture_time(0))),
        )
        .await;

        assert!(matches!(result, Err(SpvError::Config(_))));
    }
}
