//! In-process coordination state shared by the two engines.
//!
//! Holds the current sync peer and both tip signals. None of it is persisted and
//! none of it is held across network I/O.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::chain::CheckpointManager;
use crate::network::Peer;
use crate::sync::signal::TipSignal;
use crate::types::{FilterHeaderEntry, HeaderNode, TimeSource};

pub struct SyncStatus {
    sync_peer: Mutex<Option<Arc<dyn Peer>>>,
    header_tip: TipSignal<HeaderNode>,
    filter_tip: TipSignal<FilterHeaderEntry>,
    checkpoints: CheckpointManager,
    time_source: Arc<dyn TimeSource>,
    synced_tip_max_age: Duration,
}

impl SyncStatus {
    pub fn new(
        header_tip: HeaderNode,
        filter_tip: FilterHeaderEntry,
        checkpoints: CheckpointManager,
        time_source: Arc<dyn TimeSource>,
        synced_tip_max_age: Duration,
    ) -> Self {
        Self {
            sync_peer: Mutex::new(None),
            header_tip: TipSignal::new(header_tip),
            filter_tip: TipSignal::new(filter_tip),
            checkpoints,
            time_source,
            synced_tip_max_age,
        }
    }

    pub fn sync_peer(&self) -> Option<Arc<dyn Peer>> {
        match self.sync_peer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the sync peer and wake tip waiters, whose predicates depend on it.
    pub fn set_sync_peer(&self, peer: Option<Arc<dyn Peer>>) {
        {
            let mut guard = match self.sync_peer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = peer;
        }
        self.header_tip.notify();
    }

    pub fn is_sync_peer(&self, peer: &dyn Peer) -> bool {
        self.sync_peer().is_some_and(|current| current.address() == peer.address())
    }

    pub fn header_tip(&self) -> HeaderNode {
        self.header_tip.current()
    }

    pub fn filter_tip(&self) -> FilterHeaderEntry {
        self.filter_tip.current()
    }

    /// Signal carrying the best block-header tip.
    pub fn header_tip_signal(&self) -> &TipSignal<HeaderNode> {
        &self.header_tip
    }

    /// Signal carrying the filter-header tip.
    pub fn filter_tip_signal(&self) -> &TipSignal<FilterHeaderEntry> {
        &self.filter_tip
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn adjusted_time(&self) -> u32 {
        self.time_source.adjusted_time()
    }

    /// Whether the block-header chain is caught up.
    ///
    /// Requires the tip to be past every checkpoint and to be recent, and, when a
    /// sync peer is set, the tip to have reached the height that peer advertised.
    pub fn block_headers_synced(&self) -> bool {
        self.headers_synced_at(&self.header_tip())
    }

    /// [`Self::block_headers_synced`] evaluated for a given header tip.
    ///
    /// Safe to call from a [`TipSignal::wait_for`] predicate on the header signal.
    pub fn headers_synced_at(&self, tip: &HeaderNode) -> bool {
        if !self.checkpoints.is_past_all(tip.height) {
            return false;
        }

        let sync_peer = self.sync_peer();
        if let Some(peer) = &sync_peer {
            if tip.height < peer.last_block() {
                return false;
            }
        }

        let max_age = self.synced_tip_max_age.as_secs().min(u32::MAX as u64) as u32;
        let oldest = self.adjusted_time().saturating_sub(max_age);
        if tip.header.time < oldest {
            return false;
        }

        match sync_peer {
            None => true,
            Some(peer) => peer.last_block() >= peer.starting_height(),
        }
    }

    /// Block headers are synced and the filter-header chain has reached the same height.
    pub fn is_fully_synced(&self) -> bool {
        self.filter_tip().height == self.header_tip().height && self.block_headers_synced()
    }
}
