pub mod api;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod hasher;
pub mod ledger;
pub mod mainchain;
pub mod mempool;
pub mod metrics;
pub mod p2p;
pub mod sidechain;
pub mod stratum;
pub mod template;
pub mod types;
pub mod wallet;
pub mod zmq_reader;
