/// Core data model shared across the coordinator
///
/// Hashes are fixed 32-byte ids rendered as lowercase hex on the wire.
/// Difficulty is a 128-bit value carried as two 64-bit halves, matching the
/// daemon's `difficulty` / `difficulty_top64` response split.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

pub const HASH_SIZE: usize = 32;

/// 32-byte block / transaction / seed hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockId(pub [u8; HASH_SIZE]);

impl BlockId {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != HASH_SIZE * 2 {
            return None;
        }
        let mut out = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

impl FromStr for BlockId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| anyhow::anyhow!("invalid 32-byte hex hash: {:?}", s))
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = BlockId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 64-character hex string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BlockId, E> {
                BlockId::from_hex(v).ok_or_else(|| E::custom("invalid 32-byte hex hash"))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// 128-bit difficulty split into two 64-bit halves.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Difficulty {
    pub lo: u64,
    pub hi: u64,
}

impl Difficulty {
    pub fn from_parts(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub fn from_u128(v: u128) -> Self {
        Self {
            lo: v as u64,
            hi: (v >> 64) as u64,
        }
    }

    pub fn as_u128(&self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    pub fn is_zero(&self) -> bool {
        self.lo == 0 && self.hi == 0
    }

    /// JSON rendering: a plain number while the value fits in 64 bits, a
    /// decimal string once the top half is in use (JSON numbers are u64 at
    /// most without arbitrary precision).
    pub fn to_json(&self) -> serde_json::Value {
        if self.hi == 0 {
            serde_json::json!(self.lo)
        } else {
            serde_json::json!(self.to_string())
        }
    }
}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Difficulty {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_u128().cmp(&other.as_u128())
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u128())
    }
}

impl FromStr for Difficulty {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_u128(s.parse::<u128>()?))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Stagenet,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Mainnet => f.write_str("mainnet"),
            NetworkType::Testnet => f.write_str("testnet"),
            NetworkType::Stagenet => f.write_str("stagenet"),
        }
    }
}

/// Main-chain header snapshot as the coordinator tracks it.
///
/// Partial sources leave fields at their zero value: a tip push without a
/// known timestamp carries `timestamp == 0`, a miner-data record for the
/// parent height carries no reward yet.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct ChainMain {
    pub height: u64,
    pub id: BlockId,
    pub prev_id: BlockId,
    pub timestamp: u64,
    pub reward: u64,
    pub difficulty: Difficulty,
}

/// One mempool transaction as advertised by the daemon.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMempoolData {
    pub id: BlockId,
    #[serde(default)]
    pub blob_size: u32,
    #[serde(default)]
    pub weight: u64,
    #[serde(default)]
    pub fee: u64,
}

/// The daemon's "what to mine next" snapshot.
#[derive(Clone, Debug, Default)]
pub struct MinerData {
    pub major_version: u8,
    pub height: u64,
    pub prev_id: BlockId,
    pub seed_hash: BlockId,
    pub median_weight: u64,
    pub already_generated_coins: u64,
    pub difficulty: Difficulty,
    pub tx_backlog: Vec<TxMempoolData>,
    /// Filled locally from the main-chain index, not by the daemon.
    pub median_timestamp: u64,
    pub time_received: Option<Instant>,
}

/// Pending block submission. Either a template handle (internal assembly) or
/// an external blob relayed over P2P, never both.
#[derive(Clone, Debug, Default)]
pub struct SubmitBlockData {
    pub template_id: u32,
    pub nonce: u32,
    pub extra_nonce: u32,
    pub blob: Vec<u8>,
}

impl SubmitBlockData {
    pub fn is_external(&self) -> bool {
        !self.blob.is_empty()
    }
}

/// One main-chain block credited to this pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundBlock {
    pub timestamp: i64,
    pub height: u64,
    pub id: BlockId,
    pub block_diff: Difficulty,
    pub total_hashes: Difficulty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_hex_round_trip() {
        let id = BlockId([0xab; HASH_SIZE]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(BlockId::from_hex(&s), Some(id));
    }

    #[test]
    fn block_id_rejects_bad_hex() {
        assert!(BlockId::from_hex("xyz").is_none());
        assert!(BlockId::from_hex(&"g".repeat(64)).is_none());
        assert!(BlockId::from_hex(&"ab".repeat(31)).is_none());
    }

    #[test]
    fn block_id_serde_uses_hex_strings() {
        let id = BlockId([7u8; HASH_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(32)));
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn difficulty_halves_round_trip() {
        let d = Difficulty::from_parts(0xdead_beef, 0x1234);
        assert_eq!(Difficulty::from_u128(d.as_u128()), d);
        assert_eq!(d.to_string().parse::<Difficulty>().unwrap(), d);
    }

    #[test]
    fn difficulty_orders_by_full_width() {
        let small = Difficulty::from_parts(u64::MAX, 0);
        let big = Difficulty::from_parts(0, 1);
        assert!(small < big);
    }

    #[test]
    fn submit_block_data_exclusive_forms() {
        let internal = SubmitBlockData {
            template_id: 3,
            nonce: 9,
            extra_nonce: 1,
            blob: Vec::new(),
        };
        assert!(!internal.is_external());

        let external = SubmitBlockData {
            blob: vec![1, 2, 3],
            ..Default::default()
        };
        assert!(external.is_external());
    }
}
