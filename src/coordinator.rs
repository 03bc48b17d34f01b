/// The coordinator: single event-loop owner of all pool state
///
/// One tokio task runs the event loop and owns template rebuilds and block
/// submissions. Every other thread (ZMQ subscriber, RPC completions, miner
/// and peer I/O) posts work through the coalescing wakes below; many rapid
/// signals collapse into one dispatch, which keeps template rebuilds totally
/// ordered and each rebuild on a consistent (miner data, mempool) pair.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::api::{Api, Category};
use crate::config::Params;
use crate::daemon::rpc_client::{DaemonRpc, RpcFailure, RpcResponse};
use crate::hasher::Hasher;
use crate::ledger::FoundBlocks;
use crate::mainchain::MainChain;
use crate::mempool::Mempool;
use crate::metrics;
use crate::p2p::{P2PServer, PeerRegistry};
use crate::sidechain::SideChain;
use crate::stratum::{JobFeed, StratumServer};
use crate::template::BlockTemplate;
use crate::types::{
    BlockId, ChainMain, Difficulty, FoundBlock, MinerData, SubmitBlockData, TxMempoolData,
    HASH_SIZE,
};
use crate::wallet::{self, WalletAddress};
use crate::zmq_reader::ZmqReader;

const BLOCK_FOUND_BANNER: &str = "\n\
================================================================\n\
                        BLOCK  FOUND\n\
================================================================";

/// Tracks in-flight background work (header backfill RPCs) so teardown can
/// drain it before dropping the servers.
pub struct BackgroundJobs {
    active: AtomicUsize,
    changed: Notify,
}

pub struct JobGuard(Arc<BackgroundJobs>);

impl BackgroundJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            changed: Notify::new(),
        })
    }

    pub fn enter(self: &Arc<Self>) -> JobGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        JobGuard(Arc::clone(self))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while self.active() > 0 {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.changed.notified()).await;
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

/// Outcome of a `submit_block` reply, split out so the log-severity policy
/// is testable without a daemon.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    DaemonError(String),
    Unrecognized,
}

pub fn classify_submit_response(resp: &RpcResponse) -> SubmitOutcome {
    if let Some(err) = &resp.error {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return SubmitOutcome::DaemonError(msg.to_string());
    }
    if let Some(result) = &resp.result {
        if result.get("status").and_then(Value::as_str) == Some("OK") {
            return SubmitOutcome::Accepted;
        }
    }
    SubmitOutcome::Unrecognized
}

/// Hex-render a block blob, splicing the little-endian nonce fields in at
/// their recorded offsets. Offset 0 means "don't splice" (external blobs).
pub fn render_submit_blob(
    blob: &[u8],
    nonce_offset: usize,
    extra_nonce_offset: usize,
    nonce: u32,
    extra_nonce: u32,
) -> String {
    let mut out = blob.to_vec();
    if nonce_offset != 0 && nonce_offset + 4 <= out.len() {
        out[nonce_offset..nonce_offset + 4].copy_from_slice(&nonce.to_le_bytes());
    }
    if extra_nonce_offset != 0 && extra_nonce_offset + 4 <= out.len() {
        out[extra_nonce_offset..extra_nonce_offset + 4].copy_from_slice(&extra_nonce.to_le_bytes());
    }
    hex::encode(out)
}

/// Trailing 32-byte hex id appended to a main-chain coinbase tag, if any.
pub fn decode_sidechain_id(extra: &str) -> Option<BlockId> {
    let tail = extra.get(extra.len().checked_sub(HASH_SIZE * 2)?..)?;
    BlockId::from_hex(tail)
}

pub struct Coordinator {
    params: Params,
    wallet: WalletAddress,
    start_time: i64,
    rpc: DaemonRpc,
    mainchain: MainChain,
    mempool: Mempool,
    miner_data: RwLock<MinerData>,
    update_seed: AtomicBool,
    pending_submit: Mutex<SubmitBlockData>,
    submit_wake: Notify,
    template_wake: Notify,
    stop_wake: Notify,
    stopped: AtomicBool,
    servers_started: AtomicBool,
    zmq_last_active: AtomicI64,
    found_blocks: FoundBlocks,
    api: Option<Api>,
    hasher: Arc<dyn Hasher>,
    side_chain: Arc<dyn SideChain>,
    block_template: Arc<dyn BlockTemplate>,
    stratum: RwLock<Option<Arc<dyn StratumServer>>>,
    p2p: RwLock<Option<Arc<dyn P2PServer>>>,
    zmq_reader: Mutex<Option<ZmqReader>>,
    bkg_jobs: Arc<BackgroundJobs>,
    rt: tokio::runtime::Handle,
}

impl Coordinator {
    pub fn new(
        params: Params,
        wallet: WalletAddress,
        hasher: Arc<dyn Hasher>,
        side_chain: Arc<dyn SideChain>,
        block_template: Arc<dyn BlockTemplate>,
    ) -> Result<Arc<Self>> {
        let api = match params.api_path() {
            Some(path) => Some(Api::new(path)?),
            None => None,
        };
        let rpc = DaemonRpc::new(
            &params.daemon_host,
            params.rpc_port,
            Duration::from_secs(params.rpc_timeout_secs),
        );
        let found_blocks = FoundBlocks::open(&params.blocks_file);

        Ok(Arc::new(Self {
            params,
            wallet,
            start_time: chrono::Utc::now().timestamp(),
            rpc,
            mainchain: MainChain::new(),
            mempool: Mempool::new(),
            miner_data: RwLock::new(MinerData::default()),
            update_seed: AtomicBool::new(true),
            pending_submit: Mutex::new(SubmitBlockData::default()),
            submit_wake: Notify::new(),
            template_wake: Notify::new(),
            stop_wake: Notify::new(),
            stopped: AtomicBool::new(false),
            servers_started: AtomicBool::new(false),
            zmq_last_active: AtomicI64::new(0),
            found_blocks,
            api,
            hasher,
            side_chain,
            block_template,
            stratum: RwLock::new(None),
            p2p: RwLock::new(None),
            zmq_reader: Mutex::new(None),
            bkg_jobs: BackgroundJobs::new(),
            rt: tokio::runtime::Handle::current(),
        }))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn wallet(&self) -> &WalletAddress {
        &self.wallet
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn rpc(&self) -> &DaemonRpc {
        &self.rpc
    }

    pub fn mainchain(&self) -> &MainChain {
        &self.mainchain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn hasher(&self) -> &Arc<dyn Hasher> {
        &self.hasher
    }

    pub fn side_chain(&self) -> &Arc<dyn SideChain> {
        &self.side_chain
    }

    pub fn block_template(&self) -> &Arc<dyn BlockTemplate> {
        &self.block_template
    }

    pub fn found_blocks(&self) -> &FoundBlocks {
        &self.found_blocks
    }

    pub fn miner_data(&self) -> MinerData {
        self.miner_data.read().unwrap().clone()
    }

    pub fn servers_started(&self) -> bool {
        self.servers_started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Unix timestamp of the last handled ZMQ event, for the stall watchdog.
    pub fn zmq_last_active(&self) -> i64 {
        self.zmq_last_active.load(Ordering::Relaxed)
    }

    fn touch_zmq(&self) {
        self.zmq_last_active
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        metrics::inc_zmq_events();
    }

    // ── event handlers ──────────────────────────────────────────────────

    /// Mempool add from the ZMQ txpool stream.
    pub fn handle_tx(&self, tx: TxMempoolData) {
        if tx.weight == 0 || tx.fee == 0 {
            tracing::warn!(
                "invalid transaction: tx id = {}, size = {}, weight = {}, fee = {}",
                tx.id,
                tx.blob_size,
                tx.weight,
                tx.fee
            );
            return;
        }

        tracing::debug!(
            "new tx id = {}, size = {}, weight = {}, fee = {}",
            tx.id,
            tx.blob_size,
            tx.weight,
            tx.fee
        );
        self.mempool.add(tx);
        metrics::set_mempool_size(self.mempool.len());

        self.touch_zmq();
    }

    /// Full miner-data refresh, from ZMQ or the bootstrap RPC.
    pub fn handle_miner_data(self: &Arc<Self>, mut data: MinerData) {
        if data.height == 0 {
            tracing::warn!("ignoring miner data with height 0");
            return;
        }

        self.mempool.swap(&mut data.tx_backlog);
        metrics::set_mempool_size(self.mempool.len());

        self.mainchain.record_miner_data(&data);

        data.time_received = Some(Instant::now());
        let height = data.height;

        tracing::info!(
            "new miner data: major_version = {}, height = {}, prev_id = {}, seed_hash = {}, difficulty = {}, median_weight = {}, transactions = {}",
            data.major_version,
            data.height,
            data.prev_id,
            data.seed_hash,
            data.difficulty,
            data.median_weight,
            self.mempool.len()
        );

        *self.miner_data.write().unwrap() = data;
        self.update_seed.store(true, Ordering::Release);
        self.update_median_timestamp();

        self.update_block_template_async();
        self.touch_zmq();

        if self.servers_started() {
            for h in self.mainchain.missing_heights(height) {
                tracing::warn!(
                    "main-chain data for height {} is missing, requesting it from the daemon again",
                    h
                );
                let this = Arc::clone(self);
                let guard = this.bkg_jobs.enter();
                self.rt.spawn(async move {
                    let _guard = guard;
                    this.fetch_header(h).await;
                });
            }
        }
    }

    /// Tip observation from the ZMQ chain stream. `extra` carries the
    /// coinbase tag, whose trailing 32 hex bytes may name a side-chain block.
    pub fn handle_chain_main(&self, mut data: ChainMain, extra: Option<&str>) {
        self.mainchain.record_tip(&mut data);
        self.update_median_timestamp();

        tracing::info!(
            "new main chain block: height = {}, id = {}, timestamp = {}, reward = {}",
            data.height,
            data.id,
            data.timestamp,
            data.reward
        );

        if let Some(sidechain_id) = extra.and_then(decode_sidechain_id) {
            if self.side_chain.has_block(&sidechain_id) {
                tracing::info!(
                    "🎉 BLOCK FOUND: main chain block at height {} was mined by this pool{}",
                    data.height,
                    BLOCK_FOUND_BANNER
                );
                self.on_block_found(Some(&data));
            } else {
                self.side_chain.watch_mainchain_block(&data, &sidechain_id);
            }
        }

        self.api_update_network_stats();
        self.touch_zmq();
    }

    pub fn update_median_timestamp(&self) {
        let median = self.mainchain.median_timestamp();
        self.miner_data.write().unwrap().median_timestamp = median;
        tracing::debug!("median timestamp updated to {}", median);
    }

    // ── submit path ─────────────────────────────────────────────────────

    /// Queue an internal submission (a share that met main-chain difficulty).
    pub fn submit_block_async(&self, template_id: u32, nonce: u32, extra_nonce: u32) {
        *self.pending_submit.lock().unwrap() = SubmitBlockData {
            template_id,
            nonce,
            extra_nonce,
            blob: Vec::new(),
        };
        self.submit_wake.notify_one();
    }

    /// Queue an external blob relayed by a peer.
    pub fn submit_external_block_async(&self, blob: Vec<u8>) {
        *self.pending_submit.lock().unwrap() = SubmitBlockData {
            blob,
            ..Default::default()
        };
        self.submit_wake.notify_one();
    }

    /// Snapshot of the queued submission; at most one exists between wake
    /// drains (the latest request overwrites).
    pub fn pending_submit(&self) -> SubmitBlockData {
        self.pending_submit.lock().unwrap().clone()
    }

    /// Send the pending submission to the daemon. Runs on the event loop;
    /// never retried — by the time a reply comes back the template that
    /// produced the share is already stale.
    pub async fn submit_block(&self) {
        let submit_data = self.pending_submit();

        let height = self.block_template.height();
        let diff = self.block_template.difficulty();

        let (blob, nonce_offset, extra_nonce_offset, is_external) = if !submit_data.is_external() {
            tracing::info!(
                "submit_block: height = {}, template id = {}, nonce = {}, extra_nonce = {}",
                height,
                submit_data.template_id,
                submit_data.nonce,
                submit_data.extra_nonce
            );
            match self.block_template.template_blob(submit_data.template_id) {
                Some(t) => (t.blob, t.nonce_offset, t.extra_nonce_offset, false),
                None => {
                    tracing::error!(
                        "submit_block: couldn't find block template with id {}",
                        submit_data.template_id
                    );
                    return;
                }
            }
        } else {
            tracing::info!(
                "submit_block: height = {}, external blob ({} bytes)",
                height,
                submit_data.blob.len()
            );
            (submit_data.blob.clone(), 0, 0, true)
        };

        let hex_blob = render_submit_blob(
            &blob,
            nonce_offset,
            extra_nonce_offset,
            submit_data.nonce,
            submit_data.extra_nonce,
        );

        metrics::inc_block_submit_attempts();

        match self.rpc.call_response("submit_block", json!([hex_blob])).await {
            Ok(resp) => match classify_submit_response(&resp) {
                SubmitOutcome::Accepted => {
                    tracing::info!(
                        "submit_block: BLOCK ACCEPTED at height {} and difficulty = {}",
                        height,
                        diff
                    );
                }
                SubmitOutcome::DaemonError(msg) => {
                    if is_external {
                        tracing::warn!("submit_block (external blob): daemon returned error: {}", msg);
                    } else {
                        tracing::error!(
                            "submit_block: daemon returned error: {:?}, template id = {}, nonce = {}, extra_nonce = {}",
                            msg,
                            submit_data.template_id,
                            submit_data.nonce,
                            submit_data.extra_nonce
                        );
                    }
                }
                SubmitOutcome::Unrecognized => {
                    tracing::warn!("submit_block: daemon sent an unrecognizable reply");
                }
            },
            Err(RpcFailure::Parse(e)) => {
                tracing::warn!("submit_block: {}", RpcFailure::Parse(e));
            }
            Err(RpcFailure::Transport(e)) => {
                let failure = RpcFailure::Transport(e);
                if is_external {
                    tracing::warn!("submit_block (external blob): {}", failure);
                } else {
                    tracing::error!("submit_block: {}", failure);
                }
            }
        }
    }

    /// A share met side-chain difficulty only; pass it through to the
    /// template builder for the share chain.
    pub fn submit_sidechain_block(&self, template_id: u32, nonce: u32, extra_nonce: u32) {
        tracing::info!(
            "submit_sidechain_block: template id = {}, nonce = {}, extra_nonce = {}",
            template_id,
            nonce,
            extra_nonce
        );
        self.block_template
            .submit_sidechain_block(template_id, nonce, extra_nonce);
    }

    // ── template orchestrator ───────────────────────────────────────────

    pub fn update_block_template_async(&self) {
        self.template_wake.notify_one();
    }

    /// Rebuild the template and fan it out. Serialized on the event loop;
    /// the coalescing wake collapses event bursts into one rebuild.
    pub fn update_block_template(&self) {
        if self.update_seed.swap(false, Ordering::AcqRel) {
            let seed = self.miner_data.read().unwrap().seed_hash;
            self.hasher.set_seed_async(seed);
        }

        let miner_data = self.miner_data();
        self.block_template
            .update(&miner_data, &self.mempool, &self.wallet);
        metrics::inc_template_updates();

        let stratum = self.stratum.read().unwrap().clone();
        if let Some(stratum) = stratum {
            stratum.on_block(self.block_template.as_ref());
        }

        self.api_update_pool_stats();
    }

    // ── header backfill ─────────────────────────────────────────────────

    async fn fetch_header(&self, height: u64) {
        match self
            .rpc
            .call("get_block_header_by_height", json!({ "height": height }))
            .await
        {
            Ok(result) => match crate::daemon::parse_block_header(&result) {
                Some(header) => {
                    self.mainchain.insert_header(header);
                    tracing::debug!("backfilled block header for height {}", height);
                }
                None => tracing::error!("couldn't download block header for height {}", height),
            },
            Err(e) => tracing::error!(
                "couldn't download block header for height {}: {}",
                height,
                e
            ),
        }
    }

    // ── server lifecycle ────────────────────────────────────────────────

    /// Start the ZMQ reader, stratum fan-out, and peer layer, exactly once.
    pub fn start_servers(self: &Arc<Self>) -> Result<()> {
        if self
            .servers_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let reader = ZmqReader::start(
            &self.params.daemon_host,
            self.params.zmq_port,
            Arc::clone(self),
        )?;
        *self.zmq_reader.lock().unwrap() = Some(reader);

        {
            let mut stratum = self.stratum.write().unwrap();
            if stratum.is_none() {
                *stratum = Some(Arc::new(JobFeed::new()));
            }
        }
        {
            let mut p2p = self.p2p.write().unwrap();
            if p2p.is_none() {
                *p2p = Some(Arc::new(PeerRegistry::new()));
            }
        }

        tracing::info!(
            "🌐 servers started: stratum on port {}, p2p on port {}",
            self.params.stratum_port,
            self.params.p2p_port
        );

        self.api_update_network_stats();
        Ok(())
    }

    /// Install a miner-facing server implementation ahead of
    /// `start_servers`; otherwise the in-process job feed is used.
    pub fn attach_stratum(&self, stratum: Arc<dyn StratumServer>) {
        *self.stratum.write().unwrap() = Some(stratum);
    }

    /// Install a peer-gossip implementation ahead of `start_servers`.
    pub fn attach_p2p(&self, p2p: Arc<dyn P2PServer>) {
        *self.p2p.write().unwrap() = Some(p2p);
    }

    pub fn stop(&self) {
        self.stop_wake.notify_one();
    }

    /// The event loop. Owns template rebuilds and submissions; suspends only
    /// in the wake poll.
    pub async fn run(&self) {
        tracing::info!("event loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.stop_wake.notified() => {
                    tracing::info!("stopping");
                    break;
                }
                _ = self.submit_wake.notified() => {
                    self.submit_block().await;
                }
                _ = self.template_wake.notified() => {
                    self.update_block_template();
                }
            }
        }
        self.stopped.store(true, Ordering::Release);
    }

    /// Teardown in dependency order: no more ZMQ ingress, drain background
    /// RPCs, then stratum, then p2p (p2p depends on the side chain, which
    /// reads miner data).
    pub async fn shutdown(&self) {
        if let Some(reader) = self.zmq_reader.lock().unwrap().take() {
            reader.stop();
        }
        self.bkg_jobs.wait().await;
        *self.stratum.write().unwrap() = None;
        *self.p2p.write().unwrap() = None;
        tracing::info!("stopped");
    }

    // ── telemetry ───────────────────────────────────────────────────────

    fn pool_hashrate(&self) -> u64 {
        let diff = self.side_chain.difficulty();
        (diff.as_u128() / self.side_chain.block_time().max(1) as u128) as u64
    }

    fn pool_miners(&self) -> u64 {
        let peers = self
            .p2p
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.peer_list_size())
            .unwrap_or(0);
        self.side_chain.miner_count().max(peers)
    }

    fn mainnet_tip(&self) -> ChainMain {
        let prev_id = self.miner_data.read().unwrap().prev_id;
        self.mainchain.header_by_hash(&prev_id).unwrap_or_default()
    }

    pub fn api_update_network_stats(&self) {
        let tip = self.mainnet_tip();
        metrics::set_mainchain_height(tip.height);

        let Some(api) = &self.api else { return };
        api.set(
            Category::Network,
            "stats",
            &json!({
                "difficulty": tip.difficulty.to_json(),
                "hash": tip.id.to_string(),
                "height": tip.height,
                "reward": tip.reward,
                "timestamp": tip.timestamp,
            }),
        );

        self.api_update_stats_mod();
    }

    pub fn api_update_pool_stats(&self) {
        let Some(api) = &self.api else { return };

        let (last_time, last_height) = self
            .found_blocks
            .last()
            .map(|b| (b.timestamp, b.height))
            .unwrap_or((0, 0));

        api.set(
            Category::Pool,
            "stats",
            &json!({
                "pool_list": ["pplns"],
                "pool_statistics": {
                    "hashRate": self.pool_hashrate(),
                    "miners": self.pool_miners(),
                    "totalHashes": self.side_chain.total_hashes().to_json(),
                    "lastBlockFoundTime": last_time,
                    "lastBlockFound": last_height,
                    "totalBlocksFound": self.found_blocks.len(),
                }
            }),
        );

        self.api_update_stats_mod();
    }

    fn api_update_stats_mod(&self) {
        let Some(api) = &self.api else { return };

        let tip = self.mainnet_tip();

        let (last_time, last_height, last_hash, last_total) = self
            .found_blocks
            .last()
            .map(|b| (b.timestamp, b.height, b.id, b.total_hashes))
            .unwrap_or((0, 0, BlockId::default(), Difficulty::default()));

        let total_hashes = self.side_chain.total_hashes();
        if total_hashes < last_total {
            return;
        }
        let round_hashes = total_hashes.lo.wrapping_sub(last_total.lo);

        let hash_hex = last_hash.to_string();
        let short_hash = format!("{}...{}", &hash_hex[..4], &hash_hex[hash_hex.len() - 4..]);

        api.set(
            Category::Global,
            "stats_mod",
            &json!({
                "config": {
                    "ports": [{"port": self.params.stratum_port, "tls": false}],
                    "fee": 0,
                    "minPaymentThreshold": 400000000,
                },
                "network": {"height": tip.height},
                "pool": {
                    "stats": {"lastBlockFound": format!("{}000", last_time)},
                    "blocks": [format!("{}:{}", short_hash, last_time), format!("{}", last_height)],
                    "miners": self.pool_miners(),
                    "hashrate": self.pool_hashrate(),
                    "roundHashes": round_hashes,
                }
            }),
        );
    }

    /// A main-chain block credited to this pool (or `None` to republish the
    /// snapshots, e.g. right after the ledger loads on startup).
    pub fn on_block_found(&self, data: Option<&ChainMain>) {
        // The coinbase key schedule starts over with the next block.
        wallet::clear_crypto_cache();

        if let Some(d) = data {
            match self.mainchain.difficulty_at(d.height) {
                Some(diff) => {
                    self.found_blocks.append(FoundBlock {
                        timestamp: chrono::Utc::now().timestamp(),
                        height: d.height,
                        id: d.id,
                        block_diff: diff,
                        total_hashes: self.side_chain.total_hashes(),
                    });
                    metrics::inc_blocks_found();
                }
                None => tracing::warn!(
                    "difficulty for found block at height {} is unknown, not recording it",
                    d.height
                ),
            }
        }

        if let Some(api) = &self.api {
            let blocks: Vec<Value> = self
                .found_blocks
                .recent(51)
                .iter()
                .rev()
                .map(|b| {
                    json!({
                        "height": b.height,
                        "hash": b.id.to_string(),
                        "difficulty": b.block_diff.to_json(),
                        "totalHashes": b.total_hashes.to_json(),
                        "ts": b.timestamp,
                    })
                })
                .collect();
            api.set(Category::Pool, "blocks", &json!(blocks));
        }

        self.api_update_stats_mod();
    }
}
