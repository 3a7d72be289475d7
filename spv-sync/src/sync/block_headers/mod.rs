mod engine;
mod headers;

pub use engine::HeaderSyncEngine;
