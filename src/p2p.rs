/// Peer gossip seam
///
/// Peer I/O and block relay live in the external gossip layer; the
/// coordinator only reads the peer count for telemetry and relays externally
/// received block blobs through its submit path.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::RwLock;

pub trait P2PServer: Send + Sync {
    fn peer_list_size(&self) -> u64;
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashSet<SocketAddr>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, addr: SocketAddr) {
        self.peers.write().unwrap().insert(addr);
    }

    pub fn remove_peer(&self, addr: &SocketAddr) {
        self.peers.write().unwrap().remove(addr);
    }
}

impl P2PServer for PeerRegistry {
    fn peer_list_size(&self) -> u64 {
        self.peers.read().unwrap().len() as u64
    }
}
