//! BIP 157 filter-header synchronization.
//!
//! The engine struct and its state machine live in `engine.rs`; checkpoint
//! negotiation, mismatch resolution, the pipelined checkpointed download and the
//! store write path are split across the sibling modules as `impl` blocks.

mod engine;
mod negotiation;
mod pipeline;
mod resolve;
mod util;
mod writer;

pub use engine::FilterHeaderSyncEngine;
pub(crate) use engine::genesis_entry;
