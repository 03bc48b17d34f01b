/// Block template seam
///
/// The full template builder (coinbase construction, tx selection, side-chain
/// extra fields) is an external collaborator. The coordinator contract is:
/// rebuild from a consistent (miner data, mempool) pair, expose the latest
/// height/difficulty, and hand back a template blob by id with the nonce
/// offsets the submit path splices into.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use sha3::{Digest, Keccak256};

use crate::mempool::Mempool;
use crate::types::{Difficulty, MinerData};
use crate::wallet::WalletAddress;

/// A template blob plus the byte offsets of the nonce fields inside it.
/// An offset of 0 means the field is not spliceable (external blobs).
#[derive(Clone, Debug, Default)]
pub struct TemplateBlob {
    pub blob: Vec<u8>,
    pub nonce_offset: usize,
    pub extra_nonce_offset: usize,
}

pub trait BlockTemplate: Send + Sync {
    /// Rebuild from the given miner data and mempool. Callers guarantee the
    /// pair is consistent and rebuilds are serialized.
    fn update(&self, miner_data: &MinerData, mempool: &Mempool, wallet: &WalletAddress);

    /// Height of the most recent template.
    fn height(&self) -> u64;

    /// Main-chain difficulty of the most recent template.
    fn difficulty(&self) -> Difficulty;

    /// Id of the most recent template.
    fn current_template_id(&self) -> u32;

    /// Blob for a cached template, or `None` if the id has been evicted.
    fn template_blob(&self, template_id: u32) -> Option<TemplateBlob>;

    /// A share met side-chain difficulty only; hand it to the share chain.
    fn submit_sidechain_block(&self, template_id: u32, nonce: u32, extra_nonce: u32);
}

struct TemplateState {
    height: u64,
    difficulty: Difficulty,
    blobs: HashMap<u32, TemplateBlob>,
    order: VecDeque<u32>,
}

/// In-process template assembly over the collaborator contract.
pub struct PoolBlockTemplate {
    coinbase_secret: [u8; 32],
    next_id: AtomicU32,
    state: RwLock<TemplateState>,
}

impl PoolBlockTemplate {
    const CACHE_LIMIT: usize = 256;

    pub fn new(coinbase_secret: [u8; 32]) -> Self {
        Self {
            coinbase_secret,
            // id 0 is reserved for "no template" in submit requests
            next_id: AtomicU32::new(1),
            state: RwLock::new(TemplateState {
                height: 0,
                difficulty: Difficulty::default(),
                blobs: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn assemble(&self, miner_data: &MinerData, mempool: &Mempool, wallet: &WalletAddress) -> TemplateBlob {
        let txs = mempool.snapshot();
        let eph_key = wallet.eph_public_key(&self.coinbase_secret, 0);

        let mut blob = Vec::with_capacity(128 + txs.len() * 32);
        blob.push(miner_data.major_version);
        blob.extend_from_slice(&miner_data.height.to_le_bytes());
        blob.extend_from_slice(&miner_data.prev_id.0);
        blob.extend_from_slice(&miner_data.median_timestamp.to_le_bytes());

        let nonce_offset = blob.len();
        blob.extend_from_slice(&0u32.to_le_bytes());
        let extra_nonce_offset = blob.len();
        blob.extend_from_slice(&0u32.to_le_bytes());

        blob.extend_from_slice(&eph_key);

        blob.extend_from_slice(&(txs.len() as u32).to_le_bytes());
        let mut tx_hasher = Keccak256::new();
        for tx in &txs {
            tx_hasher.update(tx.id.0);
        }
        blob.extend_from_slice(&tx_hasher.finalize());
        for tx in &txs {
            blob.extend_from_slice(&tx.id.0);
        }

        TemplateBlob {
            blob,
            nonce_offset,
            extra_nonce_offset,
        }
    }
}

impl BlockTemplate for PoolBlockTemplate {
    fn update(&self, miner_data: &MinerData, mempool: &Mempool, wallet: &WalletAddress) {
        let blob = self.assemble(miner_data, mempool, wallet);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().unwrap();
        state.height = miner_data.height;
        state.difficulty = miner_data.difficulty;
        state.blobs.insert(id, blob);
        state.order.push_back(id);
        while state.order.len() > Self::CACHE_LIMIT {
            if let Some(evicted) = state.order.pop_front() {
                state.blobs.remove(&evicted);
            }
        }

        tracing::debug!(
            "template {} assembled: height = {}, difficulty = {}",
            id,
            miner_data.height,
            miner_data.difficulty
        );
    }

    fn height(&self) -> u64 {
        self.state.read().unwrap().height
    }

    fn difficulty(&self) -> Difficulty {
        self.state.read().unwrap().difficulty
    }

    fn current_template_id(&self) -> u32 {
        let state = self.state.read().unwrap();
        state.order.back().copied().unwrap_or(0)
    }

    fn template_blob(&self, template_id: u32) -> Option<TemplateBlob> {
        self.state.read().unwrap().blobs.get(&template_id).cloned()
    }

    fn submit_sidechain_block(&self, template_id: u32, nonce: u32, extra_nonce: u32) {
        tracing::info!(
            "side-chain share: template id = {}, nonce = {}, extra_nonce = {}",
            template_id,
            nonce,
            extra_nonce
        );
    }
}
