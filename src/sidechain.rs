/// Side-chain seam
///
/// The gossip-replicated share chain is an external collaborator; the
/// coordinator only needs the narrow read surface below plus the two
/// main-chain observation hooks. Implementations must never call back into
/// the coordinator type.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::types::{BlockId, ChainMain, Difficulty, NetworkType};

pub trait SideChain: Send + Sync {
    fn network_type(&self) -> NetworkType;

    /// Does the share chain contain this block id?
    fn has_block(&self, id: &BlockId) -> bool;

    /// A main-chain block advertised a side-chain id we don't have; the
    /// share chain may decide it belongs to a peer worth following.
    fn watch_mainchain_block(&self, data: &ChainMain, sidechain_id: &BlockId);

    fn difficulty(&self) -> Difficulty;

    /// Target seconds between share-chain blocks.
    fn block_time(&self) -> u64;

    fn miner_count(&self) -> u64;

    /// Cumulative work across the whole share chain.
    fn total_hashes(&self) -> Difficulty;
}

struct ShareChainState {
    blocks: HashSet<BlockId>,
    watched: Vec<(u64, BlockId)>,
    difficulty: Difficulty,
    total_hashes: Difficulty,
    miner_count: u64,
}

/// In-process share-chain state fed by the gossip layer.
pub struct ShareChain {
    network: NetworkType,
    block_time: u64,
    state: RwLock<ShareChainState>,
}

impl ShareChain {
    pub const BLOCK_TIME: u64 = 10;

    pub fn new(network: NetworkType) -> Self {
        Self {
            network,
            block_time: Self::BLOCK_TIME,
            state: RwLock::new(ShareChainState {
                blocks: HashSet::new(),
                watched: Vec::new(),
                difficulty: Difficulty::from_u128(100_000),
                total_hashes: Difficulty::default(),
                miner_count: 0,
            }),
        }
    }

    /// Called by the gossip layer when a share lands on the chain.
    pub fn insert_block(&self, id: BlockId, work: Difficulty) {
        let mut state = self.state.write().unwrap();
        if state.blocks.insert(id) {
            state.total_hashes =
                Difficulty::from_u128(state.total_hashes.as_u128() + work.as_u128());
        }
    }

    pub fn set_miner_count(&self, count: u64) {
        self.state.write().unwrap().miner_count = count;
    }

    pub fn set_difficulty(&self, difficulty: Difficulty) {
        self.state.write().unwrap().difficulty = difficulty;
    }

    pub fn watched_blocks(&self) -> Vec<(u64, BlockId)> {
        self.state.read().unwrap().watched.clone()
    }
}

impl SideChain for ShareChain {
    fn network_type(&self) -> NetworkType {
        self.network
    }

    fn has_block(&self, id: &BlockId) -> bool {
        self.state.read().unwrap().blocks.contains(id)
    }

    fn watch_mainchain_block(&self, data: &ChainMain, sidechain_id: &BlockId) {
        tracing::debug!(
            "main-chain block at height {} references side-chain block {}",
            data.height,
            sidechain_id
        );
        self.state
            .write()
            .unwrap()
            .watched
            .push((data.height, *sidechain_id));
    }

    fn difficulty(&self) -> Difficulty {
        self.state.read().unwrap().difficulty
    }

    fn block_time(&self) -> u64 {
        self.block_time
    }

    fn miner_count(&self) -> u64 {
        self.state.read().unwrap().miner_count
    }

    fn total_hashes(&self) -> Difficulty {
        self.state.read().unwrap().total_hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_SIZE;

    #[test]
    fn inserted_blocks_are_visible_and_accumulate_work() {
        let chain = ShareChain::new(NetworkType::Mainnet);
        let id = BlockId([5; HASH_SIZE]);

        assert!(!chain.has_block(&id));
        chain.insert_block(id, Difficulty::from_u128(1000));
        chain.insert_block(id, Difficulty::from_u128(1000)); // duplicate ignored

        assert!(chain.has_block(&id));
        assert_eq!(chain.total_hashes().as_u128(), 1000);
    }

    #[test]
    fn watching_records_the_observation() {
        let chain = ShareChain::new(NetworkType::Testnet);
        let data = ChainMain {
            height: 77,
            ..Default::default()
        };
        let foreign = BlockId([8; HASH_SIZE]);
        chain.watch_mainchain_block(&data, &foreign);
        assert_eq!(chain.watched_blocks(), vec![(77, foreign)]);
    }
}
