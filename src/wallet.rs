/// Wallet addresses and the ephemeral coinbase key schedule
///
/// An address encodes the network type plus the two public keys miners are
/// paid to: `<prefix>` + base32(spend_key || view_key) + 4-char checksum.
/// Prefixes: "pm1" mainnet, "pt1" testnet, "ps1" stagenet. The checksum is
/// the first two bytes of Keccak-256 over prefix + body, encoded with the
/// same alphabet, which gives ~1M-to-1 typo detection.

use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use crate::types::NetworkType;

const ADDRESS_ALPHABET: &[u8; 32] = b"023456789acdefghjklmnpqrstuvwxyz";

const KEY_SIZE: usize = 32;
const BODY_BYTES: usize = KEY_SIZE * 2;
// ceil(512 bits / 5 bits per char)
const BODY_CHARS: usize = 103;
const CHECKSUM_CHARS: usize = 4;

fn network_prefix(network: NetworkType) -> &'static str {
    match network {
        NetworkType::Mainnet => "pm1",
        NetworkType::Testnet => "pt1",
        NetworkType::Stagenet => "ps1",
    }
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in data {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ADDRESS_ALPHABET[((acc >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ADDRESS_ALPHABET[((acc << (5 - bits)) & 31) as usize] as char);
    }
    out
}

fn base32_decode(s: &str, out_len: usize) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(out_len);
    for c in s.bytes() {
        let v = ADDRESS_ALPHABET.iter().position(|&a| a == c)? as u32;
        acc = (acc << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    if out.len() != out_len {
        return None;
    }
    Some(out)
}

fn checksum(prefix: &str, body: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(body.as_bytes());
    let hash = hasher.finalize();
    let mut ck = String::with_capacity(CHECKSUM_CHARS);
    for &byte in &hash[..2] {
        ck.push(ADDRESS_ALPHABET[(byte % 32) as usize] as char);
        ck.push(ADDRESS_ALPHABET[((byte / 32) % 32) as usize] as char);
    }
    ck
}

/// A parsed, checksum-verified wallet address.
#[derive(Clone, PartialEq, Eq)]
pub struct WalletAddress {
    network: NetworkType,
    spend_key: [u8; KEY_SIZE],
    view_key: [u8; KEY_SIZE],
}

impl WalletAddress {
    pub fn new(network: NetworkType, spend_key: [u8; KEY_SIZE], view_key: [u8; KEY_SIZE]) -> Self {
        Self {
            network,
            spend_key,
            view_key,
        }
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    pub fn spend_key(&self) -> &[u8; KEY_SIZE] {
        &self.spend_key
    }

    pub fn view_key(&self) -> &[u8; KEY_SIZE] {
        &self.view_key
    }

    /// Derive the one-time public key the coinbase output pays to.
    ///
    /// Derivations are cached process-wide because the same (secret, index)
    /// pair is requested on every template rebuild; the cache is invalidated
    /// whenever a block is found and the key schedule rolls over.
    pub fn eph_public_key(&self, sec: &[u8; KEY_SIZE], index: u32) -> [u8; KEY_SIZE] {
        let key = (self.view_key, *sec, index);
        {
            let cache = derivation_cache().lock().unwrap();
            if let Some(v) = cache.get(&key) {
                return *v;
            }
        }

        let mut hasher = Keccak256::new();
        hasher.update(b"eph-key");
        hasher.update(self.view_key);
        hasher.update(sec);
        hasher.update(index.to_le_bytes());
        let derived: [u8; KEY_SIZE] = hasher.finalize().into();
        let public = SigningKey::from_bytes(&derived).verifying_key().to_bytes();

        derivation_cache().lock().unwrap().insert(key, public);
        public
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut body_bytes = [0u8; BODY_BYTES];
        body_bytes[..KEY_SIZE].copy_from_slice(&self.spend_key);
        body_bytes[KEY_SIZE..].copy_from_slice(&self.view_key);
        let prefix = network_prefix(self.network);
        let body = base32_encode(&body_bytes);
        let ck = checksum(prefix, &body);
        write!(f, "{}{}{}", prefix, body, ck)
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletAddress({}, {})", self.network, self)
    }
}

impl FromStr for WalletAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let network = [
            NetworkType::Mainnet,
            NetworkType::Testnet,
            NetworkType::Stagenet,
        ]
        .into_iter()
        .find(|n| s.starts_with(network_prefix(*n)))
        .ok_or_else(|| anyhow!("wallet address has an unknown network prefix"))?;

        let prefix = network_prefix(network);
        let rest = &s[prefix.len()..];
        if rest.len() != BODY_CHARS + CHECKSUM_CHARS {
            return Err(anyhow!(
                "wallet address has wrong length: expected {} characters after prefix, got {}",
                BODY_CHARS + CHECKSUM_CHARS,
                rest.len()
            ));
        }

        let (body, ck) = rest.split_at(BODY_CHARS);
        if checksum(prefix, body) != ck {
            return Err(anyhow!("wallet address checksum mismatch"));
        }

        let bytes = base32_decode(body, BODY_BYTES)
            .ok_or_else(|| anyhow!("wallet address body is not valid base32"))?;

        let mut spend_key = [0u8; KEY_SIZE];
        let mut view_key = [0u8; KEY_SIZE];
        spend_key.copy_from_slice(&bytes[..KEY_SIZE]);
        view_key.copy_from_slice(&bytes[KEY_SIZE..]);

        Ok(Self {
            network,
            spend_key,
            view_key,
        })
    }
}

/// Generate a fresh (public, secret) key pair for the coinbase schedule.
pub fn generate_keys() -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let signing = SigningKey::generate(&mut rand::rngs::OsRng);
    (signing.verifying_key().to_bytes(), signing.to_bytes())
}

type DerivationKey = ([u8; KEY_SIZE], [u8; KEY_SIZE], u32);

fn derivation_cache() -> &'static Mutex<HashMap<DerivationKey, [u8; KEY_SIZE]>> {
    static CACHE: OnceLock<Mutex<HashMap<DerivationKey, [u8; KEY_SIZE]>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop all cached key derivations. Called when a block is found and the
/// coinbase key schedule starts over.
pub fn clear_crypto_cache() {
    derivation_cache().lock().unwrap().clear();
}

pub fn crypto_cache_len() -> usize {
    derivation_cache().lock().unwrap().len()
}
