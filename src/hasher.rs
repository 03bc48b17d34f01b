/// RandomX hasher seam
///
/// The coordinator only schedules seed changes; dataset allocation and the
/// hash function itself live in the external RandomX integration. This seam
/// tracks the current and previous epoch seeds so the template builder and
/// stratum layer can label work by epoch.

use std::sync::RwLock;

use crate::types::BlockId;

pub trait Hasher: Send + Sync {
    /// Hand the hasher the seed for the epoch now being mined. Dataset
    /// swapping happens on the hasher's own schedule; this must not block.
    fn set_seed_async(&self, seed: BlockId);

    /// Set the previous epoch's seed during bootstrap, before any server
    /// starts handing out work.
    fn set_old_seed(&self, seed: BlockId);
}

#[derive(Default)]
struct Seeds {
    current: Option<BlockId>,
    previous: Option<BlockId>,
}

/// Seed bookkeeping for the RandomX epochs.
#[derive(Default)]
pub struct SeedTracker {
    seeds: RwLock<Seeds>,
}

impl SeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_seed(&self) -> Option<BlockId> {
        self.seeds.read().unwrap().current
    }

    pub fn previous_seed(&self) -> Option<BlockId> {
        self.seeds.read().unwrap().previous
    }
}

impl Hasher for SeedTracker {
    fn set_seed_async(&self, seed: BlockId) {
        let mut seeds = self.seeds.write().unwrap();
        if seeds.current == Some(seed) {
            return;
        }
        tracing::info!("new RandomX seed {}", seed);
        seeds.previous = seeds.current;
        seeds.current = Some(seed);
    }

    fn set_old_seed(&self, seed: BlockId) {
        tracing::info!("previous RandomX seed {}", seed);
        self.seeds.write().unwrap().previous = Some(seed);
    }
}
