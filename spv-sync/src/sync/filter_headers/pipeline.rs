//! Checkpointed cfheaders download.
//!
//! One request per checkpoint interval, all pipelined through the peer pool at
//! once and keyed by stop hash. Responses are verified against the agreed
//! checkpoints, buffered when they arrive ahead of the write position, and written
//! strictly in height order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::bip158::FilterHeader;
use bitcoin::p2p::message_filter::CFHeaders;
use bitcoin::BlockHash;
use tokio_util::sync::CancellationToken;

use super::util::{compute_filter_headers, verify_checkpoint};
use super::FilterHeaderSyncEngine;
use crate::error::{
    NetworkError, StorageError, SyncError, SyncResult, ValidationError, ValidationResult,
};
use crate::network::{BatchHandler, QueryRequest, QueryResponse};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::types::PeerAddr;

/// Batch handler writing verified checkpoint intervals in order.
pub(super) struct CheckpointedFetch<'a, B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    engine: &'a mut FilterHeaderSyncEngine<B, F>,
    checkpoints: &'a [FilterHeader],
    /// Filter header at height zero, the anchor of the first interval.
    genesis: FilterHeader,
    /// Maps stop_hash -> checkpoint interval index for each request.
    batch_starts: HashMap<BlockHash, u32>,
    /// Verified responses ahead of the write position (interval index -> data).
    buffered: HashMap<u32, CFHeaders>,
    /// Height and header of the last written filter header.
    current_height: u32,
    current_header: FilterHeader,
    abort: CancellationToken,
    failure: Option<SyncError>,
}

impl<'a, B, F> CheckpointedFetch<'a, B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    fn interval(&self) -> u32 {
        self.engine.config.filter_checkpoint_interval
    }

    /// Write `msg` for interval `index`, then drain buffered intervals that follow it.
    async fn write_in_order(&mut self, mut index: u32, mut msg: CFHeaders) -> SyncResult<()> {
        loop {
            self.current_header = self.engine.write_cfheaders(&msg).await?;
            self.current_height = (index + 1) * self.interval();

            index += 1;
            match self.buffered.remove(&index) {
                Some(next) => {
                    tracing::debug!(
                        "Writing buffered cfheaders up to checkpoint height {}",
                        (index + 1) * self.interval()
                    );
                    msg = next;
                }
                None => return Ok(()),
            }
        }
    }

    /// Check that `msg` spans exactly the checkpoint interval `index`.
    fn verify_interval(&self, index: u32, msg: &CFHeaders) -> ValidationResult<()> {
        let prev_checkpoint = match index {
            0 => self.genesis,
            i => self.checkpoints[i as usize - 1],
        };
        let next_checkpoint = self.checkpoints[index as usize];
        if verify_checkpoint(&prev_checkpoint, &next_checkpoint, msg) {
            return Ok(());
        }
        Err(ValidationError::InvalidFilterHeaderChain(format!(
            "cfheaders for checkpoint index {} do not chain from {} to {}",
            index, prev_checkpoint, next_checkpoint
        )))
    }

    /// Trim a response overlapping the stored chain to the part above the filter tip.
    ///
    /// The overlap must reproduce the stored filter header at the tip.
    fn trim_overlap(&self, start_height: u32, msg: CFHeaders) -> ValidationResult<CFHeaders> {
        let offset = (self.current_height + 1 - start_height) as usize;
        if offset == 0 {
            return Ok(msg);
        }
        let Some(overlap) = msg.filter_hashes.get(..offset) else {
            return Err(ValidationError::InvalidFilterHeaderChain(format!(
                "{} filter hashes cannot reach stored height {}",
                msg.filter_hashes.len(),
                self.current_height
            )));
        };
        let chained = compute_filter_headers(&msg.previous_filter_header, overlap);
        if chained.last() != Some(&self.current_header) {
            return Err(ValidationError::InvalidFilterHeaderChain(format!(
                "cfheaders from height {} do not reproduce stored filter header {} at {}",
                start_height, self.current_header, self.current_height
            )));
        }

        tracing::debug!(
            "Using offset {} for initial filter header range (new prev_hash={})",
            offset,
            self.current_header
        );
        Ok(CFHeaders {
            previous_filter_header: self.current_header,
            filter_hashes: msg.filter_hashes[offset..].to_vec(),
            ..msg
        })
    }
}

#[async_trait]
impl<'a, B, F> BatchHandler for CheckpointedFetch<'a, B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    async fn on_response(
        &mut self,
        request: &QueryRequest,
        peer: &PeerAddr,
        response: QueryResponse,
    ) -> bool {
        let QueryResponse::CFHeaders(msg) = response else {
            return false;
        };
        if msg.stop_hash != request.stop_hash() {
            return false;
        }
        let Some(&index) = self.batch_starts.get(&msg.stop_hash) else {
            return false;
        };
        if self.failure.is_some() {
            return true;
        }

        if let Err(e) = self.verify_interval(index, &msg) {
            tracing::debug!("Rejecting cfheaders from {}: {}", peer, e);
            return false;
        }

        let start_height = index * self.interval() + 1;
        let last_height = (index + 1) * self.interval();
        tracing::debug!(
            "Got cfheaders from height {} to {} from {}, prev_hash={}",
            start_height,
            last_height,
            peer,
            msg.previous_filter_header
        );

        if start_height > self.current_height + 1 {
            tracing::debug!(
                "Got cfheaders for height {} while at height {}, stashing",
                start_height,
                self.current_height
            );
            self.buffered.insert(index, msg);
            return true;
        }
        if last_height <= self.current_height {
            tracing::debug!("Received cfheaders ending at {}, already written", last_height);
            return true;
        }

        let msg = match self.trim_overlap(start_height, msg) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Rejecting cfheaders from {}: {}", peer, e);
                return false;
            }
        };
        if msg.previous_filter_header != self.current_header {
            tracing::warn!(
                "cfheaders from {} start at {}, stored filter tip is {}",
                peer,
                msg.previous_filter_header,
                self.current_header
            );
            return false;
        }

        if let Err(e) = self.write_in_order(index, msg).await {
            tracing::error!("Stopping checkpointed cfheaders fetch: {}", e);
            self.failure = Some(e);
            self.abort.cancel();
        }
        true
    }
}

impl<B, F> FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    /// Catch the filter-header store up with the agreed checkpoints.
    pub(super) async fn fetch_checkpointed(
        &mut self,
        checkpoints: &[FilterHeader],
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let interval = self.config.filter_checkpoint_interval;
        let tip = self.filter_tip().await?;
        let genesis = self
            .filter_storage
            .read()
            .await
            .get_filter_header(0)
            .await?
            .unwrap_or(self.params.genesis_filter_header);

        let starting_interval = tip.height / interval;
        if starting_interval as usize >= checkpoints.len() {
            return Ok(());
        }

        tracing::info!(
            "Fetching checkpointed cfheaders from height {} ({}), starting at checkpoint interval {}",
            tip.height,
            tip.filter_header,
            starting_interval
        );

        let mut requests = Vec::with_capacity(checkpoints.len() - starting_interval as usize);
        let mut batch_starts = HashMap::new();
        {
            let storage = self.block_storage.read().await;
            for index in starting_interval..checkpoints.len() as u32 {
                let start_height = index * interval + 1;
                let end_height = (index + 1) * interval;
                let stop_hash = storage
                    .get_header(end_height)
                    .await?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("block header at height {}", end_height))
                    })?
                    .block_hash();

                requests.push(QueryRequest::cfheaders(self.config.filter_type, start_height, stop_hash));
                batch_starts.insert(stop_hash, index);
            }
        }

        tracing::info!("Attempting to query for {} cfheaders batches", requests.len());

        let network = Arc::clone(&self.network);
        let abort = cancel.child_token();
        let mut handler = CheckpointedFetch {
            engine: self,
            checkpoints,
            genesis,
            batch_starts,
            buffered: HashMap::new(),
            current_height: tip.height,
            current_header: tip.filter_header,
            abort: abort.clone(),
            failure: None,
        };

        let result = network.query_batch(requests, &mut handler, &abort).await;
        if let Some(failure) = handler.failure.take() {
            return Err(failure);
        }
        match result {
            Ok(()) => Ok(()),
            Err(NetworkError::Cancelled) if cancel.is_cancelled() => Err(SyncError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}
