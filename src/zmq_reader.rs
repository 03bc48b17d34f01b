/// ZMQ ingest adapter
///
/// Subscribes to the daemon's pub socket on a dedicated thread (libzmq is
/// blocking) and turns the three event streams into coordinator calls. The
/// daemon publishes single-frame messages of the form `<topic>:<json>`.
///
/// The chain-main stream has two observed encodings: the minimal form
/// (`{first_height, first_prev_id, ids[]}`) with no per-block detail, and a
/// full form carrying header fields and the coinbase tag. Both are accepted;
/// only the full form can deliver the side-chain tag.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::coordinator::Coordinator;
use crate::types::{BlockId, ChainMain, TxMempoolData};

pub const TOPIC_TXPOOL_ADD: &str = "json-full-txpool_add";
pub const TOPIC_CHAIN_MAIN: &str = "json-minimal-chain_main";
pub const TOPIC_MINER_DATA: &str = "json-full-miner_data";

const RECV_TIMEOUT_MS: i32 = 1000;

pub struct ZmqReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ZmqReader {
    pub fn start(host: &str, port: u16, coordinator: Arc<Coordinator>) -> Result<Self> {
        let endpoint = if host.contains(':') && !host.starts_with('[') {
            format!("tcp://[{}]:{}", host, port)
        } else {
            format!("tcp://{}:{}", host, port)
        };

        let context = zmq::Context::new();
        let socket = context
            .socket(zmq::SUB)
            .context("couldn't create ZMQ SUB socket")?;
        socket
            .set_rcvtimeo(RECV_TIMEOUT_MS)
            .context("couldn't set ZMQ receive timeout")?;
        socket
            .connect(&endpoint)
            .with_context(|| format!("couldn't connect ZMQ socket to {}", endpoint))?;
        for topic in [TOPIC_TXPOOL_ADD, TOPIC_CHAIN_MAIN, TOPIC_MINER_DATA] {
            socket
                .set_subscribe(topic.as_bytes())
                .with_context(|| format!("couldn't subscribe to {}", topic))?;
        }

        tracing::info!("ZMQ reader connected to {}", endpoint);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("zmq-reader".to_string())
            .spawn(move || read_loop(socket, coordinator, thread_stop))
            .context("couldn't spawn ZMQ reader thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the reader thread and wait for it to exit. The receive
    /// timeout bounds how long this blocks.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ZmqReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(socket: zmq::Socket, coordinator: Arc<Coordinator>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        let frame = match socket.recv_bytes(0) {
            Ok(frame) => frame,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                tracing::error!("ZMQ receive failed: {}", e);
                continue;
            }
        };
        dispatch(&coordinator, &frame);
    }
    tracing::info!("ZMQ reader stopped");
}

fn dispatch(coordinator: &Arc<Coordinator>, frame: &[u8]) {
    let Some(colon) = frame.iter().position(|b| *b == b':') else {
        tracing::warn!("malformed ZMQ frame without topic separator");
        return;
    };
    let (topic, body) = (&frame[..colon], &frame[colon + 1..]);

    match topic {
        t if t == TOPIC_TXPOOL_ADD.as_bytes() => match parse_txpool_add(body) {
            Ok(txs) => {
                for tx in txs {
                    coordinator.handle_tx(tx);
                }
            }
            Err(e) => tracing::warn!("couldn't parse txpool_add event: {}", e),
        },
        t if t == TOPIC_CHAIN_MAIN.as_bytes() => match parse_chain_main(body) {
            Ok(tips) => {
                for (block, extra) in tips {
                    coordinator.handle_chain_main(block, extra.as_deref());
                }
            }
            Err(e) => tracing::warn!("couldn't parse chain_main event: {}", e),
        },
        t if t == TOPIC_MINER_DATA.as_bytes() => match parse_miner_data_event(body) {
            Ok(data) => coordinator.handle_miner_data(data),
            Err(e) => tracing::warn!("couldn't parse miner_data event: {}", e),
        },
        t => tracing::debug!("ignoring ZMQ topic {:?}", String::from_utf8_lossy(t)),
    }
}

pub fn parse_txpool_add(body: &[u8]) -> Result<Vec<TxMempoolData>> {
    serde_json::from_slice(body).context("txpool_add body is not a transaction array")
}

#[derive(Deserialize)]
struct MinimalChainMain {
    first_height: u64,
    #[serde(default)]
    #[allow(dead_code)]
    first_prev_id: Option<BlockId>,
    ids: Vec<BlockId>,
}

/// Decode a chain-main event into tip observations. The block id is left
/// unset on purpose: the handler reports whatever id the main-chain index
/// already carries for that height.
pub fn parse_chain_main(body: &[u8]) -> Result<Vec<(ChainMain, Option<String>)>> {
    let value: Value = serde_json::from_slice(body).context("chain_main body is not JSON")?;

    // one event may carry a single object or an array of them
    let items: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        v => vec![v],
    };

    let mut tips = Vec::new();
    for item in items {
        if item.get("ids").is_some() {
            let minimal: MinimalChainMain =
                serde_json::from_value(item.clone()).context("malformed minimal chain_main")?;
            for i in 0..minimal.ids.len() as u64 {
                tips.push((
                    ChainMain {
                        height: minimal.first_height + i,
                        ..Default::default()
                    },
                    None,
                ));
            }
        } else {
            let block = ChainMain {
                height: item
                    .get("height")
                    .and_then(Value::as_u64)
                    .context("chain_main entry has no height")?,
                timestamp: item.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
                reward: item.get("reward").and_then(Value::as_u64).unwrap_or(0),
                ..Default::default()
            };
            let extra = item
                .get("miner_tx")
                .and_then(|m| m.get("extra"))
                .or_else(|| item.get("miner_tx_extra"))
                .and_then(Value::as_str)
                .map(str::to_string);
            tips.push((block, extra));
        }
    }
    Ok(tips)
}

pub fn parse_miner_data_event(body: &[u8]) -> Result<crate::types::MinerData> {
    let value: Value = serde_json::from_slice(body).context("miner_data body is not JSON")?;
    crate::daemon::parse_miner_data(&value)
        .ok_or_else(|| anyhow::anyhow!("miner_data event is missing required fields"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_SIZE;

    #[test]
    fn txpool_add_parses_transaction_list() {
        let body = format!(
            r#"[{{"id":"{}","blob_size":1500,"weight":1500,"fee":30720000}},
                {{"id":"{}","blob_size":0,"weight":0,"fee":0}}]"#,
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let txs = parse_txpool_add(body.as_bytes()).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].fee, 30_720_000);
        assert_eq!(txs[1].weight, 0); // rejected later by the handler
    }

    #[test]
    fn minimal_chain_main_yields_one_tip_per_id() {
        let body = format!(
            r#"{{"first_height":2800000,"first_prev_id":"{}","ids":["{}","{}"]}}"#,
            "00".repeat(32),
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let tips = parse_chain_main(body.as_bytes()).unwrap();
        assert_eq!(tips.len(), 2);
        assert_eq!(tips[0].0.height, 2_800_000);
        assert_eq!(tips[1].0.height, 2_800_001);
        assert!(tips[0].0.id.is_zero());
        assert!(tips[0].1.is_none());
    }

    #[test]
    fn full_chain_main_carries_the_coinbase_tag() {
        let tag = format!("01ab{}", "cd".repeat(32));
        let body = format!(
            r#"[{{"height":2800123,"timestamp":1700000000,"reward":600000000000,"miner_tx":{{"extra":"{}"}}}}]"#,
            tag
        );
        let tips = parse_chain_main(body.as_bytes()).unwrap();
        assert_eq!(tips.len(), 1);
        let (block, extra) = &tips[0];
        assert_eq!(block.height, 2_800_123);
        assert_eq!(block.timestamp, 1_700_000_000);
        assert_eq!(extra.as_deref(), Some(tag.as_str()));
    }

    #[test]
    fn miner_data_event_round_trips() {
        let body = format!(
            r#"{{"major_version":16,"height":2800000,"prev_id":"{}","seed_hash":"{}",
                "median_weight":300000,"already_generated_coins":18000000,
                "difficulty":"0x1000","tx_backlog":[]}}"#,
            "aa".repeat(32),
            "bb".repeat(32)
        );
        let data = parse_miner_data_event(body.as_bytes()).unwrap();
        assert_eq!(data.height, 2_800_000);
        assert_eq!(data.seed_hash, BlockId([0xbb; HASH_SIZE]));
    }
}
