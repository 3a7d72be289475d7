//! Network seam for the sync engines.
//!
//! Connection management, handshakes, wire encoding and ban bookkeeping live
//! outside this crate. The engines only see connected peers through [`Peer`] and
//! the fan-out query machinery through [`PeerNetwork`].

pub mod message;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::block::Block;
use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use tokio_util::sync::CancellationToken;

use crate::error::NetworkResult;
use crate::types::PeerAddr;

pub use message::{HeaderEvent, QueryRequest, QueryResponse, FILTER_TYPE_BASIC};

/// A connected peer as seen by the header engine.
pub trait Peer: Send + Sync + fmt::Debug {
    /// Stable identity used for attributing responses.
    fn address(&self) -> PeerAddr;

    fn services(&self) -> ServiceFlags;

    /// Best height the peer has advertised so far.
    fn last_block(&self) -> u32;

    /// Height the peer advertised during the handshake.
    fn starting_height(&self) -> u32;

    fn update_last_block_height(&self, height: u32);

    fn update_last_announced_block(&self, hash: BlockHash);

    /// Most recent round-trip time, if one has been measured.
    fn last_ping(&self) -> Option<Duration>;

    /// Queue a getheaders message. Never blocks on the network.
    fn push_get_headers(&self, locator: Vec<BlockHash>, stop_hash: BlockHash) -> NetworkResult<()>;

    fn disconnect(&self);
}

/// Receives matched responses while a batch of queries is in flight.
#[async_trait]
pub trait BatchHandler: Send {
    /// Handle one response to `request` from `peer`.
    ///
    /// Returning `true` accepts the response and retires the request. Returning
    /// `false` rejects it and keeps the request open for another peer.
    async fn on_response(
        &mut self,
        request: &QueryRequest,
        peer: &PeerAddr,
        response: QueryResponse,
    ) -> bool;
}

/// The connected peer pool and its request/response machinery.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Currently connected peers.
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Ban the peer at `addr`. The caller disconnects it separately.
    fn ban_peer(&self, addr: &PeerAddr, reason: &str);

    /// Send `request` to every connected peer and call `on_response` for each
    /// matching answer, until every peer has answered or `timeout` passes.
    async fn query_all_peers(
        &self,
        request: QueryRequest,
        timeout: Duration,
        on_response: &mut (dyn for<'p> FnMut(&'p PeerAddr, QueryResponse) + Send),
    ) -> NetworkResult<()>;

    /// Pipeline `requests` across the peer set, passing each matching answer to
    /// `handler` until it accepts one per request. Returns early once `cancel` fires.
    async fn query_batch(
        &self,
        requests: Vec<QueryRequest>,
        handler: &mut dyn BatchHandler,
        cancel: &CancellationToken,
    ) -> NetworkResult<()>;

    /// Download a full block from any peer.
    async fn get_block(&self, hash: BlockHash) -> NetworkResult<Block>;

    /// Look up a connected peer by address.
    fn peer(&self, addr: &PeerAddr) -> Option<Arc<dyn Peer>> {
        self.peers().into_iter().find(|peer| &peer.address() == addr)
    }
}
