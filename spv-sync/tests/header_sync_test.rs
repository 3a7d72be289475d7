//! Header sync scenarios: reorg acceptance and rejection, checkpoint enforcement.

use std::sync::Arc;
use std::time::Duration;

use spv_sync::chain::{ChainParams, Checkpoint, CheckpointManager};
use spv_sync::network::{HeaderEvent, Peer};
use spv_sync::storage::{BlockHeaderStorage, MemoryStorageManager};
use spv_sync::sync::{HeaderSyncEngine, SyncStatus};
use spv_sync::test_utils::{
    build_branch, build_header_chain, fixture_time, FixedTimeSource, MockPeer, EASY_BITS, MEDIUM_BITS,
};
use spv_sync::{BlockHeader, FilterHeaderEntry, HeaderNode, SyncConfig};
use tokio::sync::RwLock;

struct Harness {
    engine: HeaderSyncEngine<MemoryStorageManager>,
    storage: Arc<RwLock<MemoryStorageManager>>,
    status: Arc<SyncStatus>,
}

async fn harness(params: ChainParams, stored: &[HeaderNode]) -> Harness {
    let mut store = MemoryStorageManager::with_genesis(params.genesis_header);
    store.write_headers(stored).await.unwrap();
    let tip = HeaderNode::from(store.chain_tip().await.unwrap());

    let status = Arc::new(SyncStatus::new(
        tip,
        FilterHeaderEntry {
            filter_header: params.genesis_filter_header,
            height: 0,
            block_hash: params.genesis_hash(),
        },
        CheckpointManager::new(params.checkpoints.clone(), params.genesis_hash()),
        Arc::new(FixedTimeSource::new(fixture_time(tip.height))),
        Duration::from_secs(24 * 60 * 60),
    ));
    let storage = Arc::new(RwLock::new(store));
    let engine = HeaderSyncEngine::new(
        SyncConfig::default(),
        Arc::new(params),
        Arc::clone(&storage),
        Arc::clone(&status),
    )
    .await
    .unwrap();

    Harness {
        engine,
        storage,
        status,
    }
}

fn headers_event(peer: &Arc<MockPeer>, nodes: &[HeaderNode]) -> HeaderEvent {
    HeaderEvent::Headers {
        peer: peer.clone() as Arc<dyn Peer>,
        headers: nodes.iter().map(|n| n.header).collect::<Vec<BlockHeader>>(),
    }
}

async fn store_tip(storage: &Arc<RwLock<MemoryStorageManager>>) -> HeaderNode {
    HeaderNode::from(storage.read().await.chain_tip().await.unwrap())
}

#[tokio::test]
async fn test_lighter_branch_is_rejected() {
    let params = ChainParams::regtest();
    let mut known = build_header_chain(params.genesis_hash(), 1, 5);
    known.extend(build_branch(known[4].hash(), 6, 5, MEDIUM_BITS, 0));
    let Harness {
        mut engine,
        storage,
        status,
    } = harness(params, &known).await;

    let competing = build_branch(known[4].hash(), 6, 5, EASY_BITS, 1);
    let peer = Arc::new(MockPeer::new("10.0.0.5:8333", 10));
    engine.handle_event(headers_event(&peer, &competing)).await.unwrap();

    assert!(peer.is_disconnected());
    assert_eq!(store_tip(&storage).await, known[9]);
    assert_eq!(status.header_tip(), known[9]);
    assert_eq!(engine.progress().reorgs(), 0);
}

#[tokio::test]
async fn test_equal_work_branch_keeps_known_chain() {
    let params = ChainParams::regtest();
    let known = build_header_chain(params.genesis_hash(), 1, 10);
    let Harness {
        mut engine,
        storage,
        ..
    } = harness(params, &known).await;

    let competing = build_branch(known[4].hash(), 6, 5, EASY_BITS, 1);
    let peer = Arc::new(MockPeer::new("10.0.0.5:8333", 10));
    engine.handle_event(headers_event(&peer, &competing)).await.unwrap();

    assert_eq!(store_tip(&storage).await, known[9]);
    assert_eq!(engine.progress().reorgs(), 0);
}

#[tokio::test]
async fn test_heavier_branch_reorganizes_store() {
    let params = ChainParams::regtest();
    let known = build_header_chain(params.genesis_hash(), 1, 10);
    let Harness {
        mut engine,
        storage,
        status,
    } = harness(params, &known).await;

    let sync_peer = Arc::new(MockPeer::new("10.0.0.1:8333", 10));
    engine.handle_event(HeaderEvent::NewPeer(sync_peer.clone())).await.unwrap();
    assert_eq!(status.sync_peer().map(|p| p.address()), Some(sync_peer.address()));

    // Rooted three blocks back, four harder headers
    let branch = build_branch(known[6].hash(), 8, 4, MEDIUM_BITS, 1);
    let peer = Arc::new(MockPeer::new("10.0.0.7:8333", 11));
    engine.handle_event(headers_event(&peer, &branch)).await.unwrap();

    assert!(!peer.is_disconnected());
    assert_eq!(store_tip(&storage).await, branch[3]);
    assert_eq!(status.header_tip(), branch[3]);
    assert_eq!(status.sync_peer().map(|p| p.address()), Some(peer.address()));
    assert_eq!(engine.progress().reorgs(), 1);

    let stored = storage.read().await;
    assert_eq!(stored.get_header(7).await.unwrap(), Some(known[6].header));
    assert_eq!(stored.get_header(8).await.unwrap(), Some(branch[0].header));
    assert_eq!(stored.get_header_height_by_hash(&known[9].hash()).await.unwrap(), None);
}

#[tokio::test]
async fn test_reorg_below_checkpoint_is_rejected() {
    let known = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 10);
    let params = ChainParams::regtest().with_checkpoints(vec![Checkpoint::new(6, known[5].hash())]);
    let Harness {
        mut engine,
        storage,
        ..
    } = harness(params, &known).await;

    let branch = build_branch(known[2].hash(), 4, 8, MEDIUM_BITS, 3);
    let peer = Arc::new(MockPeer::new("10.0.0.7:8333", 11));
    engine.handle_event(headers_event(&peer, &branch)).await.unwrap();

    assert!(peer.is_disconnected());
    assert_eq!(store_tip(&storage).await, known[9]);
}

#[tokio::test]
async fn test_wrong_checkpoint_hash_rolls_back_to_previous_checkpoint() {
    let honest = build_header_chain(ChainParams::regtest().genesis_hash(), 1, 10);
    let params = ChainParams::regtest().with_checkpoints(vec![
        Checkpoint::new(3, honest[2].hash()),
        Checkpoint::new(8, honest[7].hash()),
    ]);
    let Harness {
        mut engine,
        storage,
        status,
    } = harness(params, &honest[..5]).await;

    let peer = Arc::new(MockPeer::new("10.0.0.9:8333", 10));
    engine.handle_event(HeaderEvent::NewPeer(peer.clone())).await.unwrap();

    let forged = build_branch(honest[4].hash(), 6, 4, EASY_BITS, 9);
    engine.handle_event(headers_event(&peer, &forged)).await.unwrap();

    assert!(peer.is_disconnected());
    assert_eq!(store_tip(&storage).await, honest[2]);
    assert_eq!(status.header_tip(), honest[2]);
    assert!(status.sync_peer().is_none());
}

#[tokio::test]
async fn test_empty_headers_message_changes_nothing() {
    let params = ChainParams::regtest();
    let known = build_header_chain(params.genesis_hash(), 1, 4);
    let Harness {
        mut engine,
        storage,
        status,
    } = harness(params, &known).await;

    let peer = Arc::new(MockPeer::new("10.0.0.1:8333", 4));
    engine.handle_event(headers_event(&peer, &[])).await.unwrap();

    assert!(!peer.is_disconnected());
    assert_eq!(store_tip(&storage).await, known[3]);
    assert_eq!(status.header_tip(), known[3]);
    assert!(peer.get_headers_requests().is_empty());
}

#[tokio::test]
async fn test_single_peer_syncs_whole_chain() {
    let params = ChainParams::regtest();
    let chain = build_header_chain(params.genesis_hash(), 1, 30);
    let Harness {
        mut engine,
        storage,
        status,
    } = harness(params, &[]).await;

    let peer = Arc::new(MockPeer::new("10.0.0.1:8333", 30));
    engine.handle_event(HeaderEvent::NewPeer(peer.clone())).await.unwrap();
    for batch in chain.chunks(10) {
        engine.handle_event(headers_event(&peer, batch)).await.unwrap();
    }

    assert_eq!(store_tip(&storage).await, chain[29]);
    assert_eq!(status.header_tip(), chain[29]);
    assert_eq!(engine.progress().processed(), 30);
    assert!(!peer.is_disconnected());
}
