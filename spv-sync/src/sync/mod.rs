//! Synchronization engines and the state they share.

pub mod block_headers;
pub mod coordinator;
pub mod filter_headers;
pub mod progress;
pub mod signal;
pub mod status;

pub use block_headers::HeaderSyncEngine;
pub use coordinator::SyncCoordinator;
pub use filter_headers::FilterHeaderSyncEngine;
pub use progress::{BlockHeadersProgress, FilterHeadersProgress, ProgressLogger, SyncState};
pub use signal::TipSignal;
pub use status::SyncStatus;
