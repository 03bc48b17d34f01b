// Coordinator behavior against recording collaborators: event handling,
// template rebuild ordering, found-block bookkeeping, telemetry snapshots.

use p2pool::config::Params;
use p2pool::coordinator::Coordinator;
use p2pool::hasher::SeedTracker;
use p2pool::mempool::Mempool;
use p2pool::sidechain::{ShareChain, SideChain};
use p2pool::stratum::StratumServer;
use p2pool::template::{BlockTemplate, TemplateBlob};
use p2pool::types::{
    BlockId, ChainMain, Difficulty, MinerData, NetworkType, TxMempoolData, HASH_SIZE,
};
use p2pool::wallet::{self, WalletAddress};

use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingTemplate {
    updates: Mutex<Vec<(MinerData, Vec<BlockId>)>>,
}

impl RecordingTemplate {
    fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    fn last_update(&self) -> (MinerData, Vec<BlockId>) {
        self.updates.lock().unwrap().last().cloned().unwrap()
    }
}

impl BlockTemplate for RecordingTemplate {
    fn update(&self, miner_data: &MinerData, mempool: &Mempool, _wallet: &WalletAddress) {
        let txs = mempool.snapshot().iter().map(|tx| tx.id).collect();
        self.updates
            .lock()
            .unwrap()
            .push((miner_data.clone(), txs));
    }

    fn height(&self) -> u64 {
        self.updates
            .lock()
            .unwrap()
            .last()
            .map(|(d, _)| d.height)
            .unwrap_or(0)
    }

    fn difficulty(&self) -> Difficulty {
        self.updates
            .lock()
            .unwrap()
            .last()
            .map(|(d, _)| d.difficulty)
            .unwrap_or_default()
    }

    fn current_template_id(&self) -> u32 {
        self.update_count() as u32
    }

    fn template_blob(&self, template_id: u32) -> Option<TemplateBlob> {
        if template_id == 0 || template_id > self.current_template_id() {
            return None;
        }
        Some(TemplateBlob {
            blob: vec![0u8; 32],
            nonce_offset: 8,
            extra_nonce_offset: 12,
        })
    }

    fn submit_sidechain_block(&self, _template_id: u32, _nonce: u32, _extra_nonce: u32) {}
}

#[derive(Default)]
struct CountingSideChain {
    calls: AtomicUsize,
}

impl SideChain for CountingSideChain {
    fn network_type(&self) -> NetworkType {
        NetworkType::Mainnet
    }

    fn has_block(&self, _id: &BlockId) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn watch_mainchain_block(&self, _data: &ChainMain, _sidechain_id: &BlockId) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn difficulty(&self) -> Difficulty {
        Difficulty::from_u128(100_000)
    }

    fn block_time(&self) -> u64 {
        10
    }

    fn miner_count(&self) -> u64 {
        0
    }

    fn total_hashes(&self) -> Difficulty {
        Difficulty::default()
    }
}

#[derive(Default)]
struct CountingStratum {
    jobs: AtomicUsize,
}

impl StratumServer for CountingStratum {
    fn on_block(&self, _template: &dyn BlockTemplate) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_wallet() -> WalletAddress {
    WalletAddress::new(NetworkType::Mainnet, [0x11; 32], [0x22; 32])
}

fn test_params(dir: &std::path::Path, with_api: bool) -> Params {
    let mut params = Params::default();
    params.blocks_file = dir.join("p2pool.blocks");
    if with_api {
        params.api_path = dir.join("api").to_string_lossy().into_owned();
    }
    params
}

fn header(height: u64, id_byte: u8) -> ChainMain {
    ChainMain {
        height,
        id: BlockId([id_byte; HASH_SIZE]),
        prev_id: BlockId::default(),
        timestamp: 1_700_000_000 + height,
        reward: 600_000_000_000,
        difficulty: Difficulty::from_u128(250_000_000_000),
    }
}

fn miner_data(height: u64, backlog: Vec<TxMempoolData>) -> MinerData {
    MinerData {
        major_version: 16,
        height,
        prev_id: BlockId([0x77; HASH_SIZE]),
        seed_hash: BlockId([0x88; HASH_SIZE]),
        median_weight: 300_000,
        already_generated_coins: 18_000_000,
        difficulty: Difficulty::from_u128(250_000_000_000),
        tx_backlog: backlog,
        ..Default::default()
    }
}

fn tx(n: u8, weight: u64, fee: u64) -> TxMempoolData {
    TxMempoolData {
        id: BlockId([n; HASH_SIZE]),
        blob_size: 100,
        weight,
        fee,
    }
}

#[tokio::test]
async fn rejected_txs_never_reach_the_mempool() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    coordinator.handle_tx(tx(1, 0, 1000));
    coordinator.handle_tx(tx(2, 1000, 0));
    assert!(coordinator.mempool().is_empty());

    coordinator.handle_tx(tx(3, 1000, 1000));
    assert_eq!(coordinator.mempool().len(), 1);
    assert!(coordinator.zmq_last_active() > 0);
}

#[tokio::test]
async fn template_rebuild_sees_exactly_the_latest_miner_data() {
    let dir = tempfile::tempdir().unwrap();
    let template = Arc::new(RecordingTemplate::default());
    let hasher = Arc::new(SeedTracker::new());
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        hasher.clone(),
        Arc::new(CountingSideChain::default()),
        template.clone(),
    )
    .unwrap();

    // two snapshots arrive before the loop gets to rebuild; latest wins
    coordinator.handle_miner_data(miner_data(5000, vec![tx(1, 10, 10)]));
    coordinator.handle_miner_data(miner_data(5001, vec![tx(2, 20, 20), tx(3, 30, 30)]));

    coordinator.update_block_template();

    assert_eq!(template.update_count(), 1);
    let (seen, txs) = template.last_update();
    assert_eq!(seen.height, 5001);
    assert_eq!(
        txs,
        vec![BlockId([2; HASH_SIZE]), BlockId([3; HASH_SIZE])]
    );
    // backlog was moved into the mempool, replacing the previous refresh
    assert_eq!(coordinator.mempool().len(), 2);
    // the hasher got the new epoch seed exactly once
    assert_eq!(hasher.current_seed(), Some(BlockId([0x88; HASH_SIZE])));

    // no seed change in between: second rebuild doesn't re-seed
    coordinator.update_block_template();
    assert_eq!(template.update_count(), 2);
    assert_eq!(hasher.previous_seed(), None);
}

#[tokio::test]
async fn rebuilds_fan_out_to_stratum() {
    let dir = tempfile::tempdir().unwrap();
    let stratum = Arc::new(CountingStratum::default());
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    // before the servers exist, fan-out is a no-op
    coordinator.update_block_template();
    assert_eq!(stratum.jobs.load(Ordering::SeqCst), 0);

    coordinator.attach_stratum(stratum.clone());
    coordinator.update_block_template();
    assert_eq!(stratum.jobs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chain_main_without_extra_never_touches_the_side_chain() {
    let dir = tempfile::tempdir().unwrap();
    let side_chain = Arc::new(CountingSideChain::default());
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        side_chain.clone(),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    coordinator.handle_chain_main(header(2_800_000, 0xaa), None);
    assert_eq!(side_chain.calls.load(Ordering::SeqCst), 0);

    // a foreign side-chain tag goes to watch_mainchain_block
    let tag = "ef".repeat(32);
    coordinator.handle_chain_main(header(2_800_001, 0xab), Some(&tag));
    assert_eq!(side_chain.calls.load(Ordering::SeqCst), 2); // has_block + watch
}

#[tokio::test]
async fn found_block_is_recorded_announced_and_clears_key_cache() {
    let dir = tempfile::tempdir().unwrap();
    let share_chain = Arc::new(ShareChain::new(NetworkType::Mainnet));
    let wallet = test_wallet();
    let coordinator = Coordinator::new(
        test_params(dir.path(), true),
        wallet.clone(),
        Arc::new(SeedTracker::new()),
        share_chain.clone(),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    // the tip being observed, with known difficulty
    let tip = header(2_800_000, 0xaa);
    coordinator.mainchain().insert_header(tip.clone());

    // our side chain claims the id carried by the coinbase tag
    let sidechain_id = BlockId([0xcd; HASH_SIZE]);
    share_chain.insert_block(sidechain_id, Difficulty::from_u128(1_000_000));

    // prime the key-derivation cache so the rollover is observable
    wallet.eph_public_key(&[0x33; 32], 0);
    assert!(wallet::crypto_cache_len() > 0);

    let mut observed = tip.clone();
    observed.id = BlockId::default();
    coordinator.handle_chain_main(observed, Some(&sidechain_id.to_string()));

    assert_eq!(wallet::crypto_cache_len(), 0);
    assert_eq!(coordinator.found_blocks().len(), 1);
    let found = coordinator.found_blocks().last().unwrap();
    assert_eq!(found.height, 2_800_000);
    assert_eq!(found.id, tip.id);
    assert_eq!(found.block_diff, tip.difficulty);

    // one complete record on disk
    let ledger = std::fs::read_to_string(dir.path().join("p2pool.blocks")).unwrap();
    assert_eq!(ledger.lines().count(), 1);
    assert!(ledger.contains(&tip.id.to_string()));

    // pool/blocks snapshot, newest first
    let blocks: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("api/pool/blocks")).unwrap(),
    )
    .unwrap();
    let blocks = blocks.as_array().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["height"], 2_800_000);
    assert_eq!(blocks[0]["hash"], tip.id.to_string());

    // stats_mod reflects the find
    let stats_mod: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("api/global/stats_mod")).unwrap(),
    )
    .unwrap();
    assert!(stats_mod["pool"]["stats"]["lastBlockFound"]
        .as_str()
        .unwrap()
        .ends_with("000"));
}

#[tokio::test]
async fn network_stats_snapshot_tracks_the_tip() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_params(dir.path(), true),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    // the tip is resolved through miner data's prev_id
    let tip = header(2_799_999, 0x77);
    coordinator.mainchain().insert_header(tip.clone());
    coordinator.handle_miner_data(miner_data(2_800_000, Vec::new()));

    coordinator.api_update_network_stats();

    let stats: Value = serde_json::from_slice(
        &std::fs::read(dir.path().join("api/network/stats")).unwrap(),
    )
    .unwrap();
    assert_eq!(stats["height"], 2_799_999);
    assert_eq!(stats["hash"], tip.id.to_string());
    assert_eq!(stats["reward"], 600_000_000_000u64);
    assert_eq!(stats["difficulty"], 250_000_000_000u64);
}

#[tokio::test]
async fn pending_submission_is_latest_wins_and_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    coordinator.submit_block_async(7, 123, 456);
    let p = coordinator.pending_submit();
    assert!(!p.is_external());
    assert_eq!((p.template_id, p.nonce, p.extra_nonce), (7, 123, 456));

    coordinator.submit_external_block_async(vec![0xab; 500]);
    let p = coordinator.pending_submit();
    assert!(p.is_external());
    assert_eq!((p.template_id, p.nonce, p.extra_nonce), (0, 0, 0));
    assert_eq!(p.blob.len(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_loop_coalesces_template_wakes_and_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let template = Arc::new(RecordingTemplate::default());
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        template.clone(),
    )
    .unwrap();

    // burst of signals before the loop runs: they collapse to one rebuild
    for _ in 0..5 {
        coordinator.update_block_template_async();
    }

    let loop_coordinator = Arc::clone(&coordinator);
    let handle = tokio::spawn(async move { loop_coordinator.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(template.update_count(), 1);

    coordinator.stop();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("event loop should stop")
        .unwrap();
    assert!(coordinator.is_stopped());
}

#[tokio::test]
async fn median_timestamp_flows_into_miner_data() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        test_params(dir.path(), false),
        test_wallet(),
        Arc::new(SeedTracker::new()),
        Arc::new(CountingSideChain::default()),
        Arc::new(RecordingTemplate::default()),
    )
    .unwrap();

    let base = 2_800_000u64;
    for i in 0..=p2pool::mainchain::TIMESTAMP_WINDOW as u64 {
        coordinator
            .mainchain()
            .insert_header(header(base + i, (i % 250) as u8 + 1));
    }

    coordinator.handle_miner_data(miner_data(base + 61, Vec::new()));
    assert!(coordinator.miner_data().median_timestamp > 0);
}
