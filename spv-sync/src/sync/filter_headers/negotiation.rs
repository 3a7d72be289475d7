//! Filter checkpoint negotiation.
//!
//! Every peer is asked for its cfcheckpt list; the lists are compared with each
//! other and with the filter-header store, and disagreement is settled by
//! checking the disputed filters against block contents.

use std::collections::BTreeMap;

use bitcoin::bip158::FilterHeader;
use bitcoin::BlockHash;
use tokio_util::sync::CancellationToken;

use super::util::{corroborated_prefix, min_checkpoint_height};
use super::FilterHeaderSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::network::{QueryRequest, QueryResponse};
use crate::storage::{BlockHeaderStorage, FilterHeaderStorage};
use crate::types::{HeaderNode, PeerAddr};

impl<B, F> FilterHeaderSyncEngine<B, F>
where
    B: BlockHeaderStorage,
    F: FilterHeaderStorage,
{
    /// Agree with the connected peers on the filter checkpoints up to `block_tip`.
    ///
    /// Gives up after `max_negotiation_attempts` rounds. An empty list means the
    /// chain is shorter than one checkpoint interval.
    pub(super) async fn negotiate_checkpoints(
        &mut self,
        block_tip: HeaderNode,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<FilterHeader>> {
        let interval = self.config.filter_checkpoint_interval;
        if block_tip.height < interval {
            return Ok(Vec::new());
        }

        for attempt in 1..=self.config.max_negotiation_attempts {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match self.negotiation_round(block_tip).await {
                Ok(checkpoints) if !checkpoints.is_empty() => {
                    tracing::info!(
                        "Agreed on {} filter checkpoints up to height {}",
                        checkpoints.len(),
                        checkpoints.len() as u32 * interval
                    );
                    return Ok(checkpoints);
                }
                Ok(_) => {
                    tracing::warn!(
                        "Unable to fetch a set of candidate filter checkpoints (attempt {}/{})",
                        attempt,
                        self.config.max_negotiation_attempts
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "Failed to determine correct filter checkpoints (attempt {}/{}): {}",
                        attempt,
                        self.config.max_negotiation_attempts,
                        e
                    );
                }
            }

            self.pause(self.config.negotiation_retry_delay, cancel).await?;
        }

        Err(SyncError::CheckpointNegotiation(format!(
            "no agreement after {} attempts",
            self.config.max_negotiation_attempts
        )))
    }

    async fn negotiation_round(&mut self, block_tip: HeaderNode) -> SyncResult<Vec<FilterHeader>> {
        self.reconcile_filter_chain().await?;

        let interval = self.config.filter_checkpoint_interval;

        // Refetch only once the block tip passes the shortest cached list.
        if min_checkpoint_height(&self.checkpoint_cache, interval) < block_tip.height {
            let (best_height, best_hash) = match self.status.checkpoints().last() {
                Some(cp) if cp.height > block_tip.height => (cp.height, cp.hash),
                _ => (block_tip.height, block_tip.hash()),
            };
            tracing::debug!(
                "Getting filter checkpoints up to height {}, hash {}",
                best_height,
                best_hash
            );
            self.checkpoint_cache = self.get_checkpoints(best_hash).await;
            if self.checkpoint_cache.is_empty() {
                return Ok(Vec::new());
            }
        }

        // Only checkpoints at or below the block tip can be verified.
        let max_len = (block_tip.height / interval) as usize;
        let capped: BTreeMap<PeerAddr, Vec<FilterHeader>> = self
            .checkpoint_cache
            .iter()
            .map(|(peer, cps)| (peer.clone(), cps.iter().take(max_len).copied().collect()))
            .collect();

        self.resolve_conflict(capped).await
    }

    /// Query every peer for its checkpoint list ending at `stop_hash`.
    pub(super) async fn get_checkpoints(
        &self,
        stop_hash: BlockHash,
    ) -> BTreeMap<PeerAddr, Vec<FilterHeader>> {
        let mut checkpoints = BTreeMap::new();

        let request = QueryRequest::cfcheckpt(self.config.filter_type, stop_hash);
        let mut collect = |peer: &PeerAddr, response: QueryResponse| {
            if let QueryResponse::CFCheckpt(msg) = response {
                checkpoints.insert(peer.clone(), msg.filter_headers);
            }
        };
        let result =
            self.network.query_all_peers(request, self.config.query_timeout, &mut collect).await;
        if let Err(e) = result {
            tracing::debug!("cfcheckpt query ended early: {}", e);
        }

        checkpoints
    }

    /// First index at which the lists disagree with each other or with the store,
    /// `None` when everything agrees.
    pub(super) async fn check_checkpoint_sanity(
        &self,
        checkpoints: &BTreeMap<PeerAddr, Vec<FilterHeader>>,
    ) -> SyncResult<Option<usize>> {
        let storage = self.filter_storage.read().await;
        let store_tip = storage.filter_chain_tip().await?.map_or(0, |entry| entry.height);

        let max_len = checkpoints.values().map(Vec::len).max().unwrap_or(0);
        let interval = self.config.filter_checkpoint_interval;

        for i in 0..max_len {
            let mut agreed: Option<FilterHeader> = None;
            for (peer, cps) in checkpoints {
                let Some(cp) = cps.get(i) else {
                    continue;
                };
                match agreed {
                    None => agreed = Some(*cp),
                    Some(first) if first != *cp => {
                        tracing::warn!(
                            "Filter checkpoint mismatch at index {}: expected {}, peer {} has {}",
                            i,
                            first,
                            peer,
                            cp
                        );
                        return Ok(Some(i));
                    }
                    Some(_) => {}
                }
            }

            let height = (i as u32 + 1) * interval;
            if height > store_tip {
                continue;
            }
            let stored = storage.get_filter_header(height).await?;
            if let (Some(stored), Some(agreed)) = (stored, agreed) {
                if stored != agreed {
                    tracing::warn!(
                        "Filter checkpoint mismatch at height {}: stored {}, peers have {}",
                        height,
                        stored,
                        agreed
                    );
                    return Ok(Some(i));
                }
            }
        }

        Ok(None)
    }

    /// Settle disagreement between checkpoint lists.
    ///
    /// Peers that proved to serve bad filters, and peers that served checkpoints but
    /// no cfheaders to back them, are banned. Returns the agreed list, or an error
    /// when disagreement remains.
    pub(super) async fn resolve_conflict(
        &mut self,
        mut checkpoints: BTreeMap<PeerAddr, Vec<FilterHeader>>,
    ) -> SyncResult<Vec<FilterHeader>> {
        let Some(mismatch) = self.check_checkpoint_sanity(&checkpoints).await? else {
            return Ok(corroborated_prefix(&checkpoints));
        };

        tracing::debug!("Detected mismatch at index {} for filter checkpoints", mismatch);

        checkpoints.retain(|_, cps| cps.len() >= mismatch);
        if checkpoints.is_empty() {
            return Err(SyncError::CheckpointNegotiation(
                "no peer is serving good cfheaders".to_string(),
            ));
        }

        // The interval ending at the disputed checkpoint.
        let start_height = mismatch as u32 * self.config.filter_checkpoint_interval + 1;
        let mut headers = self.get_cfheaders_for_all_peers(start_height).await?;

        // Honest peers agree on the checkpoint before the disputed one.
        let mut baseline: Option<FilterHeader> = None;
        for msg in headers.values() {
            match baseline {
                None => baseline = Some(msg.previous_filter_header),
                Some(prev) if prev != msg.previous_filter_header => {
                    return Err(SyncError::CheckpointNegotiation(
                        "mismatch between filter headers expected to be the same".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        for peer in self.ban_mismatching_peers(&mut headers, start_height).await? {
            checkpoints.remove(&peer);
        }

        let unbacked: Vec<PeerAddr> =
            checkpoints.keys().filter(|peer| !headers.contains_key(*peer)).cloned().collect();
        for peer in unbacked {
            self.ban_peer(&peer, "served filter checkpoints but no cfheaders");
            checkpoints.remove(&peer);
        }

        match self.check_checkpoint_sanity(&checkpoints).await? {
            None if !checkpoints.is_empty() => Ok(corroborated_prefix(&checkpoints)),
            _ => Err(SyncError::CheckpointNegotiation("got mismatched checkpoints".to_string())),
        }
    }
}
