//! End-to-end filter-header sync against scripted peer sets.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::block::Block;
use spv_sync::chain::{ChainParams, CheckpointManager};
use spv_sync::network::QueryRequest;
use spv_sync::storage::{BlockHeaderStorage, FilterHeaderStorage, MemoryStorageManager};
use spv_sync::sync::{FilterHeaderSyncEngine, SyncStatus};
use spv_sync::test_utils::{
    build_block_chain, fixture_time, honest_filter_headers, FixedTimeSource, MockPeerNetwork, ScriptedPeer,
};
use spv_sync::{FilterHeaderEntry, HeaderNode, SyncConfig, SyncError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const INTERVAL: u32 = 5;

struct Scenario {
    params: ChainParams,
    blocks: Vec<Block>,
    block_store: Arc<RwLock<MemoryStorageManager>>,
    filter_store: Arc<RwLock<MemoryStorageManager>>,
    network: Arc<MockPeerNetwork>,
    status: Arc<SyncStatus>,
}

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_filter_checkpoint_interval(INTERVAL)
        .with_max_cfheaders_per_msg(10)
        .with_query_timeout(Duration::from_millis(200))
        .with_negotiation_retry(2, Duration::from_millis(10))
}

fn genesis_entry(params: &ChainParams) -> FilterHeaderEntry {
    FilterHeaderEntry {
        filter_header: params.genesis_filter_header,
        height: 0,
        block_hash: params.genesis_hash(),
    }
}

fn nodes(blocks: &[Block], first_height: u32) -> Vec<HeaderNode> {
    blocks.iter().zip(first_height..).map(|(block, height)| HeaderNode::new(block.header, height)).collect()
}

/// `count` blocks stored and served, the filter store holding `filter_height + 1`
/// honest entries.
async fn scenario(count: u32, filter_height: u32, network: MockPeerNetwork) -> Scenario {
    let params = ChainParams::regtest();
    let blocks = build_block_chain(params.genesis_hash(), 1, count as usize);

    let mut block_store = MemoryStorageManager::with_genesis(params.genesis_header);
    block_store.write_headers(&nodes(&blocks, 1)).await.unwrap();
    let header_tip = HeaderNode::from(block_store.chain_tip().await.unwrap());

    let mut filter_store = MemoryStorageManager::with_genesis(params.genesis_header);
    let honest = honest_filter_headers(params.genesis_filter_header, &blocks);
    let mut entries = vec![genesis_entry(&params)];
    for height in 1..=filter_height {
        entries.push(FilterHeaderEntry {
            filter_header: honest[height as usize],
            height,
            block_hash: blocks[height as usize - 1].block_hash(),
        });
    }
    filter_store.write_filter_headers(&entries).await.unwrap();
    let filter_tip = entries[entries.len() - 1];

    let network = Arc::new(network.with_blocks(blocks.clone()));
    let status = Arc::new(SyncStatus::new(
        header_tip,
        filter_tip,
        CheckpointManager::new(params.checkpoints.clone(), params.genesis_hash()),
        Arc::new(FixedTimeSource::new(fixture_time(count))),
        Duration::from_secs(24 * 60 * 60),
    ));

    Scenario {
        params,
        blocks,
        block_store: Arc::new(RwLock::new(block_store)),
        filter_store: Arc::new(RwLock::new(filter_store)),
        network,
        status,
    }
}

fn network_with(peers: Vec<ScriptedPeer>) -> MockPeerNetwork {
    let params = ChainParams::regtest();
    peers
        .into_iter()
        .fold(MockPeerNetwork::new(params.genesis_filter_header, INTERVAL), |network, peer| network.with_peer(peer))
}

impl Scenario {
    /// Run the engine until the filter tip reaches `height`.
    async fn sync_to(&self, height: u32) -> FilterHeaderEntry {
        let engine = FilterHeaderSyncEngine::new(
            config(),
            Arc::new(self.params.clone()),
            Arc::clone(&self.block_store),
            Arc::clone(&self.filter_store),
            self.network.clone(),
            Arc::clone(&self.status),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        let reached = tokio::time::timeout(
            Duration::from_secs(10),
            self.status.filter_tip_signal().wait_for(&cancel, |tip| tip.height >= height),
        )
        .await
        .expect("filter headers did not sync in time")
        .unwrap();

        // Give a trailing tip-follow round the chance to misbehave.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        match task.await.unwrap() {
            Ok(()) | Err(SyncError::Cancelled) => {}
            Err(e) => panic!("engine failed: {}", e),
        }
        reached
    }

    async fn stored_filter_header(&self, height: u32) -> FilterHeaderEntry {
        self.filter_store.read().await.get_filter_entry(height).await.unwrap().unwrap()
    }
}

fn cfheaders_starts(network: &MockPeerNetwork) -> Vec<u32> {
    network
        .requests()
        .iter()
        .filter_map(|request| match request {
            QueryRequest::GetCFHeaders(get) => Some(get.start_height),
            _ => None,
        })
        .collect()
}

fn cfcheckpt_requests(network: &MockPeerNetwork) -> usize {
    network.requests().iter().filter(|r| matches!(r, QueryRequest::GetCFCheckpt(_))).count()
}

#[tokio::test]
async fn test_honest_peers_sync_without_filter_fetches() {
    let scenario = scenario(
        12,
        0,
        network_with(vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b"), ScriptedPeer::honest("c")]),
    )
    .await;

    let tip = scenario.sync_to(12).await;

    assert_eq!(tip.height, 12);
    assert_eq!(tip.block_hash, scenario.blocks[11].block_hash());
    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(12));
    assert_eq!(scenario.network.cfilter_queries(), 0);
    assert!(scenario.network.banned_peers().is_empty());

    for height in [5, 10, 11] {
        let entry = scenario.stored_filter_header(height).await;
        assert_eq!(entry.filter_header, scenario.network.honest_filter_header(height));
        assert_eq!(entry.block_hash, scenario.blocks[height as usize - 1].block_hash());
    }
}

#[tokio::test]
async fn test_lying_peer_is_banned() {
    let scenario = scenario(
        12,
        0,
        network_with(vec![
            ScriptedPeer::honest("a"),
            ScriptedPeer::honest("b"),
            ScriptedPeer::lying_from("c", 6),
        ]),
    )
    .await;

    let tip = scenario.sync_to(12).await;

    assert_eq!(scenario.network.banned_peers(), vec!["c".to_string()]);
    assert!(scenario.network.cfilter_queries() > 0);
    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(12));
    assert_eq!(
        scenario.stored_filter_header(10).await.filter_header,
        scenario.network.honest_filter_header(10)
    );
}

#[tokio::test]
async fn test_ban_outcome_does_not_depend_on_answer_order() {
    let peers = || {
        vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b"), ScriptedPeer::lying_from("c", 6)]
    };

    let forward = scenario(12, 0, network_with(peers())).await;
    let forward_tip = forward.sync_to(12).await;

    let reversed = scenario(12, 0, network_with(peers()).with_reversed_order()).await;
    let reversed_tip = reversed.sync_to(12).await;

    assert_eq!(forward.network.banned_peers(), reversed.network.banned_peers());
    assert_eq!(forward_tip, reversed_tip);
}

#[tokio::test]
async fn test_near_tip_store_skips_checkpoint_negotiation() {
    let scenario = scenario(
        12,
        10,
        network_with(vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b")]),
    )
    .await;

    let tip = scenario.sync_to(12).await;

    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(12));
    assert_eq!(cfcheckpt_requests(&scenario.network), 0);
    let starts = cfheaders_starts(&scenario.network);
    assert!(!starts.is_empty());
    assert!(starts.iter().all(|start| *start == 11));
}

#[tokio::test]
async fn test_interval_aligned_chain_needs_no_tip_fetch() {
    let scenario = scenario(
        10,
        0,
        network_with(vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b")]),
    )
    .await;

    let tip = scenario.sync_to(10).await;

    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(10));
    assert!(!cfheaders_starts(&scenario.network).contains(&11));
}

#[tokio::test]
async fn test_single_peer_syncs() {
    let scenario = scenario(7, 0, network_with(vec![ScriptedPeer::honest("solo")])).await;

    let tip = scenario.sync_to(7).await;

    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(7));
    assert!(scenario.network.banned_peers().is_empty());
}

#[tokio::test]
async fn test_follows_new_blocks() {
    let scenario = scenario(
        10,
        10,
        network_with(vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b")]),
    )
    .await;

    let engine = FilterHeaderSyncEngine::new(
        config(),
        Arc::new(scenario.params.clone()),
        Arc::clone(&scenario.block_store),
        Arc::clone(&scenario.filter_store),
        scenario.network.clone(),
        Arc::clone(&scenario.status),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(engine.run(cancel.clone()));

    let extension = build_block_chain(scenario.blocks[9].block_hash(), 11, 2);
    scenario.network.push_blocks(&extension);
    let extension_nodes = nodes(&extension, 11);
    scenario.block_store.write().await.write_headers(&extension_nodes).await.unwrap();
    scenario.status.header_tip_signal().publish(extension_nodes[1]);

    let tip = tokio::time::timeout(
        Duration::from_secs(10),
        scenario.status.filter_tip_signal().wait_for(&cancel, |tip| tip.height >= 12),
    )
    .await
    .expect("filter tip did not follow the block tip")
    .unwrap();

    cancel.cancel();
    let _ = task.await.unwrap();

    assert_eq!(tip.block_hash, extension[1].block_hash());
    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(12));
}

#[tokio::test]
async fn test_resume_mid_interval() {
    let scenario = scenario(
        17,
        3,
        network_with(vec![ScriptedPeer::honest("a"), ScriptedPeer::honest("b")]),
    )
    .await;

    let tip = scenario.sync_to(17).await;

    assert_eq!(tip.block_hash, scenario.blocks[16].block_hash());
    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(17));
    assert!(scenario.network.banned_peers().is_empty());
    for height in [3, 4, 5, 15] {
        assert_eq!(
            scenario.stored_filter_header(height).await.filter_header,
            scenario.network.honest_filter_header(height)
        );
    }
    // The first interval is refetched whole and trimmed to the stored tip.
    assert!(cfheaders_starts(&scenario.network).contains(&1));
}

#[tokio::test]
async fn test_resume_mid_interval_with_liar() {
    let scenario = scenario(
        17,
        3,
        network_with(vec![
            ScriptedPeer::honest("a"),
            ScriptedPeer::honest("b"),
            ScriptedPeer::lying_from("c", 12),
        ]),
    )
    .await;

    let tip = scenario.sync_to(17).await;

    assert_eq!(scenario.network.banned_peers(), vec!["c".to_string()]);
    assert_eq!(tip.filter_header, scenario.network.honest_filter_header(17));
    assert_eq!(
        scenario.stored_filter_header(15).await.filter_header,
        scenario.network.honest_filter_header(15)
    );
}
