/// Daemon integration: JSON-RPC transport, payload parsers, and the
/// bootstrap state machine.

pub mod bootstrap;
pub mod rpc_client;

pub use bootstrap::MIN_RPC_VERSION;
pub use rpc_client::{DaemonRpc, RpcFailure, RpcResponse};

use serde_json::Value;

use crate::types::{BlockId, ChainMain, Difficulty, MinerData, NetworkType, TxMempoolData};

/// One header object as it appears in `get_block_header_by_height` and each
/// element of `get_block_headers_range`.
pub fn parse_header_object(v: &Value) -> Option<ChainMain> {
    Some(ChainMain {
        height: v.get("height")?.as_u64()?,
        id: BlockId::from_hex(v.get("hash")?.as_str()?)?,
        prev_id: v
            .get("prev_hash")
            .and_then(Value::as_str)
            .and_then(BlockId::from_hex)
            .unwrap_or_default(),
        timestamp: v.get("timestamp")?.as_u64()?,
        reward: v.get("reward")?.as_u64()?,
        difficulty: Difficulty::from_parts(
            v.get("difficulty")?.as_u64()?,
            v.get("difficulty_top64").and_then(Value::as_u64).unwrap_or(0),
        ),
    })
}

/// The `result` of `get_block_header_by_height`.
pub fn parse_block_header(result: &Value) -> Option<ChainMain> {
    parse_header_object(result.get("block_header")?)
}

/// The `result` of `get_block_headers_range`; malformed entries are skipped.
pub fn parse_block_headers_range(result: &Value) -> Vec<ChainMain> {
    let Some(headers) = result.get("headers").and_then(Value::as_array) else {
        return Vec::new();
    };
    headers.iter().filter_map(parse_header_object).collect()
}

/// The `result` of `get_miner_data` (also the body of the ZMQ
/// `json-full-miner_data` event). Backlog entries missing any required field
/// are dropped; `blob_size` is not part of this payload.
pub fn parse_miner_data(result: &Value) -> Option<MinerData> {
    let mut data = MinerData {
        major_version: u8::try_from(result.get("major_version")?.as_u64()?).ok()?,
        height: result.get("height")?.as_u64()?,
        prev_id: BlockId::from_hex(result.get("prev_id")?.as_str()?)?,
        seed_hash: BlockId::from_hex(result.get("seed_hash")?.as_str()?)?,
        median_weight: result.get("median_weight")?.as_u64()?,
        already_generated_coins: result.get("already_generated_coins")?.as_u64()?,
        difficulty: parse_difficulty(result.get("difficulty")?)?,
        ..Default::default()
    };

    if let Some(backlog) = result.get("tx_backlog").and_then(Value::as_array) {
        for tx in backlog {
            let Some(parsed) = parse_backlog_tx(tx) else {
                continue;
            };
            data.tx_backlog.push(parsed);
        }
    }

    Some(data)
}

fn parse_backlog_tx(tx: &Value) -> Option<TxMempoolData> {
    Some(TxMempoolData {
        id: BlockId::from_hex(tx.get("id")?.as_str()?)?,
        blob_size: 0,
        weight: tx.get("weight")?.as_u64()?,
        fee: tx.get("fee")?.as_u64()?,
    })
}

/// `get_miner_data` reports difficulty as a hex string; header objects use a
/// number plus `difficulty_top64`. Accept both.
fn parse_difficulty(v: &Value) -> Option<Difficulty> {
    if let Some(n) = v.as_u64() {
        return Some(Difficulty::from_parts(n, 0));
    }
    let s = v.as_str()?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(s, 16).ok().map(Difficulty::from_u128)
}

/// What a `get_info` reply means for the bootstrap sequence.
#[derive(Debug, PartialEq, Eq)]
pub enum InfoOutcome {
    Ready,
    BusySyncing,
    NotSynchronized,
    /// Daemon network vs the side chain we're mining to.
    NetworkMismatch(NetworkType, NetworkType),
    Malformed,
}

pub fn evaluate_get_info(result: &Value, sidechain_network: NetworkType) -> InfoOutcome {
    let flag = |name: &str| result.get(name).and_then(Value::as_bool);

    let (Some(busy_syncing), Some(synchronized), Some(mainnet), Some(testnet), Some(stagenet)) = (
        flag("busy_syncing"),
        flag("synchronized"),
        flag("mainnet"),
        flag("testnet"),
        flag("stagenet"),
    ) else {
        return InfoOutcome::Malformed;
    };

    if busy_syncing {
        return InfoOutcome::BusySyncing;
    }
    if !synchronized {
        return InfoOutcome::NotSynchronized;
    }

    let daemon_network = if mainnet {
        NetworkType::Mainnet
    } else if testnet {
        NetworkType::Testnet
    } else if stagenet {
        NetworkType::Stagenet
    } else {
        return InfoOutcome::Malformed;
    };

    if daemon_network != sidechain_network {
        return InfoOutcome::NetworkMismatch(daemon_network, sidechain_network);
    }

    InfoOutcome::Ready
}

/// What a `get_version` reply means for the bootstrap sequence.
#[derive(Debug, PartialEq, Eq)]
pub enum VersionOutcome {
    Compatible(u64),
    Incompatible(u64),
    NotOk(String),
    Malformed,
}

pub fn evaluate_get_version(result: &Value) -> VersionOutcome {
    let (Some(status), Some(version)) = (
        result.get("status").and_then(Value::as_str),
        result.get("version").and_then(Value::as_u64),
    ) else {
        return VersionOutcome::Malformed;
    };

    if status != "OK" {
        return VersionOutcome::NotOk(status.to_string());
    }

    if version < MIN_RPC_VERSION {
        VersionOutcome::Incompatible(version)
    } else {
        VersionOutcome::Compatible(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header_json(height: u64) -> Value {
        json!({
            "height": height,
            "hash": "aa".repeat(32),
            "prev_hash": "bb".repeat(32),
            "timestamp": 1_700_000_000u64,
            "reward": 600_000_000_000u64,
            "difficulty": 250_000_000_000u64,
            "difficulty_top64": 0,
        })
    }

    #[test]
    fn block_header_round_trips_all_fields() {
        let result = json!({ "block_header": header_json(2_800_000) });
        let c = parse_block_header(&result).unwrap();
        assert_eq!(c.height, 2_800_000);
        assert_eq!(c.id.to_string(), "aa".repeat(32));
        assert_eq!(c.prev_id.to_string(), "bb".repeat(32));
        assert_eq!(c.timestamp, 1_700_000_000);
        assert_eq!(c.reward, 600_000_000_000);
        assert_eq!(c.difficulty.as_u128(), 250_000_000_000);
    }

    #[test]
    fn header_with_top64_half() {
        let mut h = header_json(1);
        h["difficulty_top64"] = json!(3u64);
        let c = parse_header_object(&h).unwrap();
        assert_eq!(c.difficulty, Difficulty::from_parts(250_000_000_000, 3));
    }

    #[test]
    fn headers_range_skips_malformed_entries() {
        let result = json!({
            "headers": [header_json(10), {"height": 11}, header_json(12)]
        });
        let headers = parse_block_headers_range(&result);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].height, 10);
        assert_eq!(headers[1].height, 12);
    }

    #[test]
    fn miner_data_parses_backlog_and_hex_difficulty() {
        let result = json!({
            "major_version": 16,
            "height": 2_800_000u64,
            "prev_id": "cc".repeat(32),
            "seed_hash": "dd".repeat(32),
            "median_weight": 300_000u64,
            "already_generated_coins": 18_000_000u64,
            "difficulty": "0x3a352944fa8",
            "tx_backlog": [
                {"id": "11".repeat(32), "weight": 1500u64, "fee": 30_720_000u64},
                {"id": "22".repeat(32), "weight": 2000u64},
                {"weight": 100u64, "fee": 1u64},
            ],
        });
        let data = parse_miner_data(&result).unwrap();
        assert_eq!(data.major_version, 16);
        assert_eq!(data.height, 2_800_000);
        assert_eq!(data.difficulty.as_u128(), 0x3a352944fa8);
        assert_eq!(data.tx_backlog.len(), 1);
        assert_eq!(data.tx_backlog[0].weight, 1500);
        assert_eq!(data.tx_backlog[0].blob_size, 0);
    }

    #[test]
    fn get_info_outcomes() {
        let info = |busy: bool, synced: bool, net: &str| {
            json!({
                "busy_syncing": busy,
                "synchronized": synced,
                "mainnet": net == "mainnet",
                "testnet": net == "testnet",
                "stagenet": net == "stagenet",
            })
        };

        assert_eq!(
            evaluate_get_info(&info(false, true, "mainnet"), NetworkType::Mainnet),
            InfoOutcome::Ready
        );
        assert_eq!(
            evaluate_get_info(&info(true, true, "mainnet"), NetworkType::Mainnet),
            InfoOutcome::BusySyncing
        );
        assert_eq!(
            evaluate_get_info(&info(false, false, "mainnet"), NetworkType::Mainnet),
            InfoOutcome::NotSynchronized
        );
        assert_eq!(
            evaluate_get_info(&info(false, true, "testnet"), NetworkType::Mainnet),
            InfoOutcome::NetworkMismatch(NetworkType::Testnet, NetworkType::Mainnet)
        );
        assert_eq!(
            evaluate_get_info(&json!({"status": "OK"}), NetworkType::Mainnet),
            InfoOutcome::Malformed
        );
    }

    #[test]
    fn get_version_outcomes() {
        assert_eq!(
            evaluate_get_version(&json!({"status": "OK", "version": 0x30008})),
            VersionOutcome::Compatible(0x30008)
        );
        assert_eq!(
            evaluate_get_version(&json!({"status": "OK", "version": 0x30007})),
            VersionOutcome::Incompatible(0x30007)
        );
        assert_eq!(
            evaluate_get_version(&json!({"status": "BUSY", "version": 0x30008})),
            VersionOutcome::NotOk("BUSY".to_string())
        );
        assert_eq!(
            evaluate_get_version(&json!({"version": 0x30008})),
            VersionOutcome::Malformed
        );
    }
}
