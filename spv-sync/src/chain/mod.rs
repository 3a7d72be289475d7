//! Chain management: the bounded in-memory header window, cumulative work,
//! checkpoints, consensus parameters and difficulty retargeting.

pub mod chain_work;
pub mod checkpoints;
pub mod difficulty;
pub mod header_chain;
pub mod params;

pub use chain_work::ChainWork;
pub use checkpoints::{Checkpoint, CheckpointManager};
pub use difficulty::{next_required_difficulty, retarget};
pub use header_chain::{HeaderChain, NodeHandle, DEFAULT_HEADER_CHAIN_CAPACITY};
pub use params::ChainParams;
