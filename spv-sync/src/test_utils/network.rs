//! Mock peers and a scripted peer pool.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::bip158::FilterHeader;
use bitcoin::block::Block;
use bitcoin::p2p::message_filter::{CFCheckpt, CFHeaders, CFilter};
use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use tokio_util::sync::CancellationToken;

use super::filter::{basic_filter, filter_hash, lying_filter};
use crate::error::{NetworkError, NetworkResult};
use crate::network::{BatchHandler, Peer, PeerNetwork, QueryRequest, QueryResponse};
use crate::types::PeerAddr;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A connected peer that records what it was asked to send.
#[derive(Debug)]
pub struct MockPeer {
    address: PeerAddr,
    services: ServiceFlags,
    starting_height: u32,
    last_block: AtomicU32,
    ping: Option<Duration>,
    get_headers: Mutex<Vec<(Vec<BlockHash>, BlockHash)>>,
    last_announced: Mutex<Option<BlockHash>>,
    disconnected: AtomicBool,
}

impl MockPeer {
    /// A full node advertising `height`.
    pub fn new(address: &str, height: u32) -> Self {
        Self {
            address: address.to_string(),
            services: ServiceFlags::NETWORK,
            starting_height: height,
            last_block: AtomicU32::new(height),
            ping: None,
            get_headers: Mutex::new(Vec::new()),
            last_announced: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn with_ping(mut self, ping: Duration) -> Self {
        self.ping = Some(ping);
        self
    }

    pub fn with_services(mut self, services: ServiceFlags) -> Self {
        self.services = services;
        self
    }

    /// Every getheaders pushed to this peer, as `(locator, stop_hash)`.
    pub fn get_headers_requests(&self) -> Vec<(Vec<BlockHash>, BlockHash)> {
        lock(&self.get_headers).clone()
    }

    pub fn last_announced_block(&self) -> Option<BlockHash> {
        *lock(&self.last_announced)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl Peer for MockPeer {
    fn address(&self) -> PeerAddr {
        self.address.clone()
    }

    fn services(&self) -> ServiceFlags {
        self.services
    }

    fn last_block(&self) -> u32 {
        self.last_block.load(Ordering::SeqCst)
    }

    fn starting_height(&self) -> u32 {
        self.starting_height
    }

    fn update_last_block_height(&self, height: u32) {
        self.last_block.fetch_max(height, Ordering::SeqCst);
    }

    fn update_last_announced_block(&self, hash: BlockHash) {
        *lock(&self.last_announced) = Some(hash);
    }

    fn last_ping(&self) -> Option<Duration> {
        self.ping
    }

    fn push_get_headers(&self, locator: Vec<BlockHash>, stop_hash: BlockHash) -> NetworkResult<()> {
        if self.is_disconnected() {
            return Err(NetworkError::PeerDisconnected(self.address.clone()));
        }
        lock(&self.get_headers).push((locator, stop_hash));
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// How one peer of a [`MockPeerNetwork`] answers filter queries.
#[derive(Debug, Clone)]
pub struct ScriptedPeer {
    peer: Arc<MockPeer>,
    /// Serve lying filters for every block at or above this height.
    lie_from: Option<u32>,
    serves_cfheaders: bool,
    /// Highest block this peer knows about.
    tip: Option<u32>,
}

impl ScriptedPeer {
    pub fn honest(address: &str) -> Self {
        Self {
            peer: Arc::new(MockPeer::new(address, 0)),
            lie_from: None,
            serves_cfheaders: true,
            tip: None,
        }
    }

    /// Serves filters missing a block script from `height` onwards, and the
    /// filter headers committing to them.
    pub fn lying_from(address: &str, height: u32) -> Self {
        Self {
            lie_from: Some(height),
            ..Self::honest(address)
        }
    }

    /// Answers cfcheckpt but never cfheaders.
    pub fn without_cfheaders(mut self) -> Self {
        self.serves_cfheaders = false;
        self
    }

    /// Only knows blocks up to `height`.
    pub fn with_tip(mut self, height: u32) -> Self {
        self.tip = Some(height);
        self
    }

    pub fn peer(&self) -> Arc<MockPeer> {
        Arc::clone(&self.peer)
    }

    fn address(&self) -> PeerAddr {
        self.peer.address()
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    blocks: Vec<Block>,
    heights: HashMap<BlockHash, u32>,
    peers: BTreeMap<PeerAddr, ScriptedPeer>,
    banned: BTreeSet<PeerAddr>,
    requests: Vec<QueryRequest>,
    reverse_order: bool,
}

/// Peer pool answering filter queries from a fixed block chain.
///
/// Each scripted peer derives its answers from the shared blocks, honestly or
/// with lying filters. Banned and disconnected peers stop answering.
#[derive(Debug)]
pub struct MockPeerNetwork {
    genesis_filter_header: FilterHeader,
    checkpoint_interval: u32,
    state: Mutex<NetworkState>,
}

impl MockPeerNetwork {
    pub fn new(genesis_filter_header: FilterHeader, checkpoint_interval: u32) -> Self {
        Self {
            genesis_filter_header,
            checkpoint_interval,
            state: Mutex::new(NetworkState::default()),
        }
    }

    /// Blocks at heights `1..=blocks.len()`.
    pub fn with_blocks(self, blocks: Vec<Block>) -> Self {
        self.push_blocks(&blocks);
        self
    }

    pub fn with_peer(self, peer: ScriptedPeer) -> Self {
        self.add_peer(peer);
        self
    }

    /// Answer queries and walk batches in reverse peer and request order.
    pub fn with_reversed_order(self) -> Self {
        lock(&self.state).reverse_order = true;
        self
    }

    pub fn add_peer(&self, peer: ScriptedPeer) {
        lock(&self.state).peers.insert(peer.address(), peer);
    }

    /// Extend the served chain.
    pub fn push_blocks(&self, blocks: &[Block]) {
        let mut state = lock(&self.state);
        for block in blocks {
            let height = state.blocks.len() as u32 + 1;
            state.heights.insert(block.block_hash(), height);
            state.blocks.push(block.clone());
        }
    }

    pub fn banned_peers(&self) -> Vec<PeerAddr> {
        lock(&self.state).banned.iter().cloned().collect()
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        lock(&self.state).requests.clone()
    }

    /// Number of single-block cfilter queries sent so far.
    pub fn cfilter_queries(&self) -> usize {
        self.requests().iter().filter(|r| matches!(r, QueryRequest::GetCFilters(_))).count()
    }

    /// Honest filter header at `height`.
    pub fn honest_filter_header(&self, height: u32) -> FilterHeader {
        let state = lock(&self.state);
        self.filter_header_at(&state, None, height)
    }

    fn filter_bytes(block: &Block, height: u32, lie_from: Option<u32>) -> Vec<u8> {
        match lie_from {
            Some(from) if height >= from => lying_filter(block),
            _ => basic_filter(block),
        }
    }

    fn filter_header_at(&self, state: &NetworkState, lie_from: Option<u32>, height: u32) -> FilterHeader {
        let mut header = self.genesis_filter_header;
        for (i, block) in state.blocks.iter().take(height as usize).enumerate() {
            let bytes = Self::filter_bytes(block, i as u32 + 1, lie_from);
            header = filter_hash(&bytes).filter_header(&header);
        }
        header
    }

    /// Height of `hash` if `peer` knows it.
    fn known_height(state: &NetworkState, peer: &ScriptedPeer, hash: &BlockHash) -> Option<u32> {
        let height = *state.heights.get(hash)?;
        match peer.tip {
            Some(tip) if height > tip => None,
            _ => Some(height),
        }
    }

    fn answer(&self, state: &NetworkState, peer: &ScriptedPeer, request: &QueryRequest) -> Option<QueryResponse> {
        match request {
            QueryRequest::GetCFCheckpt(msg) => {
                let stop = Self::known_height(state, peer, &msg.stop_hash)?;
                let filter_headers = (1..=stop / self.checkpoint_interval)
                    .map(|k| self.filter_header_at(state, peer.lie_from, k * self.checkpoint_interval))
                    .collect();
                Some(QueryResponse::CFCheckpt(CFCheckpt {
                    filter_type: msg.filter_type,
                    stop_hash: msg.stop_hash,
                    filter_headers,
                }))
            }
            QueryRequest::GetCFHeaders(msg) => {
                if !peer.serves_cfheaders || msg.start_height == 0 {
                    return None;
                }
                let stop = Self::known_height(state, peer, &msg.stop_hash)?;
                if msg.start_height > stop {
                    return None;
                }
                let filter_hashes = (msg.start_height..=stop)
                    .map(|height| {
                        let block = &state.blocks[height as usize - 1];
                        filter_hash(&Self::filter_bytes(block, height, peer.lie_from))
                    })
                    .collect();
                Some(QueryResponse::CFHeaders(CFHeaders {
                    filter_type: msg.filter_type,
                    stop_hash: msg.stop_hash,
                    previous_filter_header: self.filter_header_at(
                        state,
                        peer.lie_from,
                        msg.start_height - 1,
                    ),
                    filter_hashes,
                }))
            }
            QueryRequest::GetCFilters(msg) => {
                let height = Self::known_height(state, peer, &msg.stop_hash)?;
                let block = &state.blocks[height as usize - 1];
                Some(QueryResponse::CFilter(CFilter {
                    filter_type: msg.filter_type,
                    block_hash: msg.stop_hash,
                    filter: Self::filter_bytes(block, height, peer.lie_from),
                }))
            }
        }
    }

    /// Answers from every reachable peer, in query order.
    fn collect_answers(&self, request: &QueryRequest) -> Vec<(PeerAddr, QueryResponse)> {
        let mut state = lock(&self.state);
        state.requests.push(request.clone());

        let mut answers: Vec<(PeerAddr, QueryResponse)> = state
            .peers
            .values()
            .filter(|peer| !state.banned.contains(&peer.address()) && !peer.peer.is_disconnected())
            .filter_map(|peer| Some((peer.address(), self.answer(&state, peer, request)?)))
            .collect();
        if state.reverse_order {
            answers.reverse();
        }
        answers
    }
}

#[async_trait]
impl PeerNetwork for MockPeerNetwork {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        lock(&self.state)
            .peers
            .values()
            .filter(|peer| !peer.peer.is_disconnected())
            .map(|peer| peer.peer() as Arc<dyn Peer>)
            .collect()
    }

    fn ban_peer(&self, addr: &PeerAddr, _reason: &str) {
        lock(&self.state).banned.insert(addr.clone());
    }

    async fn query_all_peers(
        &self,
        request: QueryRequest,
        _timeout: Duration,
        on_response: &mut (dyn for<'p> FnMut(&'p PeerAddr, QueryResponse) + Send),
    ) -> NetworkResult<()> {
        for (peer, response) in self.collect_answers(&request) {
            if request.matches(&response) {
                on_response(&peer, response);
            }
        }
        Ok(())
    }

    async fn query_batch(
        &self,
        requests: Vec<QueryRequest>,
        handler: &mut dyn BatchHandler,
        cancel: &CancellationToken,
    ) -> NetworkResult<()> {
        let mut requests = requests;
        if lock(&self.state).reverse_order {
            requests.reverse();
        }

        for request in &requests {
            for (peer, response) in self.collect_answers(request) {
                if cancel.is_cancelled() {
                    return Err(NetworkError::Cancelled);
                }
                if request.matches(&response) && handler.on_response(request, &peer, response).await {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn get_block(&self, hash: BlockHash) -> NetworkResult<Block> {
        let state = lock(&self.state);
        state
            .heights
            .get(&hash)
            .and_then(|height| state.blocks.get(*height as usize - 1))
            .cloned()
            .ok_or_else(|| NetworkError::BlockNotFound(hash.to_string()))
    }
}
