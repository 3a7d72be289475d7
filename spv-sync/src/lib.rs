//! Block header and compact filter header synchronization for SPV light clients.
//!
//! This crate keeps a locally verified view of the best block-header chain and the
//! matching BIP 157 filter-header chain by querying a set of untrusted peers,
//! cross-checking their answers and recovering from disagreement, reorganization
//! and misbehaving peers.
//!
//! Two engines do the work:
//!
//! - [`sync::HeaderSyncEngine`] selects a sync peer, downloads and validates
//!   headers against proof-of-work and checkpoint rules, and resolves reorgs.
//! - [`sync::FilterHeaderSyncEngine`] negotiates filter checkpoints across peers,
//!   fetches checkpointed cfheaders in a pipelined batch, follows the tip
//!   afterwards and bans peers that serve filters inconsistent with block contents.
//!
//! Both run as tokio tasks under a [`sync::SyncCoordinator`], sharing the peer pool
//! (see [`network::PeerNetwork`]) and the header stores (see [`storage`]).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spv_sync::chain::ChainParams;
//! use spv_sync::storage::MemoryStorageManager;
//! use spv_sync::sync::SyncCoordinator;
//! use spv_sync::{SyncConfig, SystemTimeSource};
//! # use spv_sync::network::PeerNetwork;
//!
//! # async fn run(peers: Arc<dyn PeerNetwork>) -> Result<(), Box<dyn std::error::Error>> {
//! let params = ChainParams::regtest();
//! let block_store = MemoryStorageManager::with_genesis(params.genesis_header);
//! let filter_store = MemoryStorageManager::with_genesis(params.genesis_header);
//!
//! let coordinator = SyncCoordinator::start(
//!     SyncConfig::default(),
//!     params,
//!     block_store,
//!     filter_store,
//!     peers,
//!     Arc::new(SystemTimeSource),
//! )
//! .await?;
//!
//! // ... feed peer events through coordinator.header_events() ...
//!
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod storage;
pub mod sync;
pub mod types;
pub mod validation;

pub use config::SyncConfig;
pub use error::{
    FatalError, LoggingError, LoggingResult, NetworkError, SpvError, StorageError, SyncError,
    ValidationError,
};
pub use logging::{init_console_logging, init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use tracing::level_filters::LevelFilter;
pub use types::{BlockHeaderTip, FilterHeaderEntry, HeaderNode, PeerAddr, SystemTimeSource, TimeSource};

// Re-export commonly used bitcoin types
pub use bitcoin::bip158::{FilterHash, FilterHeader};
pub use bitcoin::block::Header as BlockHeader;
pub use bitcoin::hashes::Hash;
pub use bitcoin::BlockHash;

/// Current version of the spv-sync library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
