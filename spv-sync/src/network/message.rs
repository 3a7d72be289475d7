//! Typed filter requests and responses exchanged through the peer pool.
//!
//! Requests and responses are correlated by content: the stop hash of a cfheaders
//! or cfcheckpt query, the block hash of a single-block cfilter query.

use bitcoin::block::Header as BlockHeader;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_filter::{
    CFCheckpt, CFHeaders, CFilter, GetCFCheckpt, GetCFHeaders, GetCFilters,
};
use bitcoin::BlockHash;
use std::sync::Arc;

use crate::network::Peer;
use crate::types::PeerAddr;

/// BIP 158 basic filter type.
pub const FILTER_TYPE_BASIC: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    GetCFCheckpt(GetCFCheckpt),
    GetCFHeaders(GetCFHeaders),
    GetCFilters(GetCFilters),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    CFCheckpt(CFCheckpt),
    CFHeaders(CFHeaders),
    CFilter(CFilter),
}

impl QueryRequest {
    pub fn cfcheckpt(filter_type: u8, stop_hash: BlockHash) -> Self {
        Self::GetCFCheckpt(GetCFCheckpt {
            filter_type,
            stop_hash,
        })
    }

    pub fn cfheaders(filter_type: u8, start_height: u32, stop_hash: BlockHash) -> Self {
        Self::GetCFHeaders(GetCFHeaders {
            filter_type,
            start_height,
            stop_hash,
        })
    }

    /// Request the filter of the single block `block_hash` at `height`.
    pub fn cfilter(filter_type: u8, height: u32, block_hash: BlockHash) -> Self {
        Self::GetCFilters(GetCFilters {
            filter_type,
            start_height: height,
            stop_hash: block_hash,
        })
    }

    pub fn stop_hash(&self) -> BlockHash {
        match self {
            Self::GetCFCheckpt(msg) => msg.stop_hash,
            Self::GetCFHeaders(msg) => msg.stop_hash,
            Self::GetCFilters(msg) => msg.stop_hash,
        }
    }

    /// Whether `response` answers this request.
    pub fn matches(&self, response: &QueryResponse) -> bool {
        match (self, response) {
            (Self::GetCFCheckpt(req), QueryResponse::CFCheckpt(resp)) => {
                req.filter_type == resp.filter_type && req.stop_hash == resp.stop_hash
            }
            (Self::GetCFHeaders(req), QueryResponse::CFHeaders(resp)) => {
                req.filter_type == resp.filter_type && req.stop_hash == resp.stop_hash
            }
            (Self::GetCFilters(req), QueryResponse::CFilter(resp)) => {
                req.filter_type == resp.filter_type && req.stop_hash == resp.block_hash
            }
            _ => false,
        }
    }
}

/// Inbound event for the block-header engine, fed by peer tasks.
#[derive(Debug, Clone)]
pub enum HeaderEvent {
    /// A peer finished its handshake.
    NewPeer(Arc<dyn Peer>),
    /// A peer disconnected.
    DonePeer(PeerAddr),
    /// A peer announced inventory.
    Inv {
        peer: Arc<dyn Peer>,
        inventory: Vec<Inventory>,
    },
    /// A peer answered a header request.
    Headers {
        peer: Arc<dyn Peer>,
        headers: Vec<BlockHeader>,
    },
}

impl HeaderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HeaderEvent::NewPeer(_) => "new_peer",
            HeaderEvent::DonePeer(_) => "done_peer",
            HeaderEvent::Inv {
                ..
            } => "inv",
            HeaderEvent::Headers {
                ..
            } => "headers",
        }
    }
}
