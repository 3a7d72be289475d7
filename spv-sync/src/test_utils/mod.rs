//! Fixtures and mocks shared by unit and integration tests.

mod chain;
mod filter;
mod network;

pub use chain::{
    build_branch, build_header_chain, fixture_time, header_with_bits, mine, unmined_header_chain,
    FixedTimeSource, EASY_BITS, MEDIUM_BITS,
};
pub use filter::{
    basic_filter, build_block_branch, build_block_chain, cfheaders_for, filter_hash,
    honest_filter_headers, lying_filter, test_block,
};
pub use network::{MockPeer, MockPeerNetwork, ScriptedPeer};
