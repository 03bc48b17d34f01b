/// Thread-safe mempool mirror
///
/// Holds the transactions the coordinator currently considers for templates.
/// Individual adds come from the ZMQ txpool stream; the whole set is replaced
/// in bulk whenever new miner data arrives with its own backlog.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{BlockId, TxMempoolData};

#[derive(Default)]
pub struct Mempool {
    transactions: Mutex<HashMap<BlockId, TxMempoolData>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tx: TxMempoolData) {
        let mut txs = self.transactions.lock().unwrap();
        txs.entry(tx.id).or_insert(tx);
    }

    /// Replace the whole mempool with the daemon's backlog. This is the only
    /// bulk-refresh path; it drains the supplied vector.
    pub fn swap(&self, backlog: &mut Vec<TxMempoolData>) {
        let mut txs = self.transactions.lock().unwrap();
        txs.clear();
        for tx in backlog.drain(..) {
            txs.insert(tx.id, tx);
        }
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.transactions.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for the template builder.
    pub fn snapshot(&self) -> Vec<TxMempoolData> {
        let mut txs: Vec<TxMempoolData> =
            self.transactions.lock().unwrap().values().cloned().collect();
        txs.sort_by_key(|tx| tx.id);
        txs
    }
}
