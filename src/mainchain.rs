/// Main-chain header index
///
/// Two mirrored maps (by height, by hash) behind one reader-writer lock.
/// Readers run on the template, telemetry, and side-chain paths; writers are
/// the ZMQ tip stream, miner-data records, and RPC header backfill. The lock
/// is held for whole batch insertions so both maps move together.
///
/// Pruning keeps a 720-block trailing window plus the three most recent
/// RandomX seed heights needed for rolling epoch transitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::types::{BlockId, ChainMain, Difficulty, MinerData};

pub const BLOCK_HEADERS_REQUIRED: u64 = 720;
pub const SEEDHASH_EPOCH_BLOCKS: u64 = 2048;
pub const SEEDHASH_EPOCH_LAG: u64 = 64;
pub const TIMESTAMP_WINDOW: usize = 60;

/// Height of the block whose hash seeds the RandomX dataset used at `height`.
pub fn seed_height(height: u64) -> u64 {
    if height > SEEDHASH_EPOCH_LAG {
        (height - SEEDHASH_EPOCH_LAG - 1) & !(SEEDHASH_EPOCH_BLOCKS - 1)
    } else {
        0
    }
}

#[derive(Default)]
struct Maps {
    by_height: BTreeMap<u64, ChainMain>,
    by_hash: HashMap<BlockId, ChainMain>,
}

impl Maps {
    fn mirror(&mut self, c: &ChainMain) {
        if !c.id.is_zero() {
            self.by_hash.insert(c.id, c.clone());
        }
    }

    /// Insert keeping both maps consistent: a height re-indexed under a new
    /// id (reorg) drops the stale hash entry.
    fn insert(&mut self, c: ChainMain) {
        if let Some(old) = self.by_height.get(&c.height) {
            if old.id != c.id {
                self.by_hash.remove(&old.id);
            }
        }
        self.mirror(&c);
        self.by_height.insert(c.height, c);
    }

    fn cleanup(&mut self, tip_height: u64) {
        let seed = seed_height(tip_height);
        let keep = [
            seed,
            seed.wrapping_sub(SEEDHASH_EPOCH_BLOCKS),
            seed.wrapping_sub(SEEDHASH_EPOCH_BLOCKS * 2),
        ];

        let cutoff = tip_height.saturating_sub(BLOCK_HEADERS_REQUIRED);
        let doomed: Vec<u64> = self
            .by_height
            .range(..cutoff)
            .map(|(h, _)| *h)
            .filter(|h| !keep.contains(h))
            .collect();

        for h in doomed {
            if let Some(c) = self.by_height.remove(&h) {
                self.by_hash.remove(&c.id);
            }
        }
    }
}

#[derive(Default)]
pub struct MainChain {
    maps: RwLock<Maps>,
}

impl MainChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap().by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed hash for the epoch that `height` falls in, if the seed header is
    /// indexed.
    pub fn get_seed(&self, height: u64) -> Option<BlockId> {
        let maps = self.maps.read().unwrap();
        maps.by_height.get(&seed_height(height)).map(|c| c.id)
    }

    pub fn header_by_hash(&self, id: &BlockId) -> Option<ChainMain> {
        self.maps.read().unwrap().by_hash.get(id).cloned()
    }

    pub fn header_by_height(&self, height: u64) -> Option<ChainMain> {
        self.maps.read().unwrap().by_height.get(&height).cloned()
    }

    pub fn difficulty_at(&self, height: u64) -> Option<Difficulty> {
        let maps = self.maps.read().unwrap();
        maps.by_height.get(&height).map(|c| c.difficulty)
    }

    /// Last `TIMESTAMP_WINDOW` timestamps in height-descending order. Needs
    /// strictly more than `TIMESTAMP_WINDOW` indexed heights, because the
    /// newest entry (the height being mined) has no final timestamp yet.
    pub fn timestamps(&self) -> Option<[u64; TIMESTAMP_WINDOW]> {
        let maps = self.maps.read().unwrap();
        if maps.by_height.len() <= TIMESTAMP_WINDOW {
            return None;
        }
        let mut out = [0u64; TIMESTAMP_WINDOW];
        for (slot, (_, c)) in out.iter_mut().zip(maps.by_height.iter().rev()) {
            *slot = c.timestamp;
        }
        Some(out)
    }

    /// Median of the timestamp window, or 0 while the window is short.
    ///
    /// Shifted +1 block relative to the canonical chain median: miner data
    /// for a block arrives before that block's final form exists.
    pub fn median_timestamp(&self) -> u64 {
        let Some(mut timestamps) = self.timestamps() else {
            return 0;
        };
        timestamps.sort_unstable();
        (timestamps[TIMESTAMP_WINDOW / 2] + timestamps[TIMESTAMP_WINDOW / 2 + 1]) / 2
    }

    /// Insert one fully-populated header (RPC backfill path).
    pub fn insert_header(&self, c: ChainMain) {
        self.maps.write().unwrap().insert(c);
    }

    /// Insert a whole header range under one write lock so the mirror maps
    /// never expose a partial batch.
    pub fn insert_headers(&self, headers: Vec<ChainMain>) -> usize {
        let mut maps = self.maps.write().unwrap();
        let mut inserted = 0;
        for c in headers {
            maps.insert(c);
            inserted += 1;
        }
        inserted
    }

    /// Record what a fresh miner-data snapshot tells us: the difficulty of
    /// the height being mined, and the id of its parent. Fields a previous
    /// source already filled in (timestamp, reward) are kept.
    pub fn record_miner_data(&self, data: &MinerData) {
        let mut maps = self.maps.write().unwrap();

        maps.by_height.entry(data.height).or_default().difficulty = data.difficulty;

        let parent = maps.by_height.entry(data.height - 1).or_default();
        parent.height = data.height - 1;
        let old_id = parent.id;
        parent.id = data.prev_id;
        let parent = parent.clone();
        if old_id != parent.id {
            maps.by_hash.remove(&old_id);
        }
        maps.mirror(&parent);

        maps.cleanup(data.height);
    }

    /// Upsert a tip observation. The entry's pre-existing id (if any) is
    /// copied back into `data` so callers log whatever the index carries.
    pub fn record_tip(&self, data: &mut ChainMain) {
        let mut maps = self.maps.write().unwrap();

        let c = maps.by_height.entry(data.height).or_default();
        c.height = data.height;
        if data.timestamp != 0 {
            c.timestamp = data.timestamp;
        }
        if data.reward != 0 {
            c.reward = data.reward;
        }
        data.id = c.id;
        let c = c.clone();
        maps.mirror(&c);
    }

    /// Drop entries older than the trailing window, keeping the three most
    /// recent seed heights.
    pub fn cleanup(&self, tip_height: u64) {
        self.maps.write().unwrap().cleanup(tip_height);
    }

    /// Heights in `(tip - BLOCK_HEADERS_REQUIRED, tip]` with no index entry.
    pub fn missing_heights(&self, tip: u64) -> Vec<u64> {
        let maps = self.maps.read().unwrap();
        let mut missing = Vec::new();
        let mut h = tip;
        while h > 0 && h + BLOCK_HEADERS_REQUIRED > tip {
            if !maps.by_height.contains_key(&h) {
                missing.push(h);
            }
            h -= 1;
        }
        missing
    }

    #[cfg(test)]
    fn check_mirror_invariant(&self) {
        let maps = self.maps.read().unwrap();
        for (id, c) in &maps.by_hash {
            let by_height = maps
                .by_height
                .get(&c.height)
                .unwrap_or_else(|| panic!("hash entry {} has no height entry", id));
            assert_eq!(by_height.id, *id);
        }
        for (h, c) in &maps.by_height {
            if !c.id.is_zero() {
                assert_eq!(
                    maps.by_hash.get(&c.id).map(|e| e.height),
                    Some(*h),
                    "height {} not mirrored",
                    h
                );
            }
        }
    }
}
