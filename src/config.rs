/// Runtime parameters
///
/// Defaults are overridden first by an optional JSON config file
/// (`P2POOL_CONFIG`, falling back to `./p2pool_config.json`), then by
/// environment variables, so a container can pin everything without a file.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Daemon host, IPv4, IPv6, or a resolvable name.
    pub daemon_host: String,
    /// Daemon restricted JSON-RPC port.
    pub rpc_port: u16,
    /// Daemon ZMQ pub port.
    pub zmq_port: u16,
    pub stratum_port: u16,
    pub p2p_port: u16,
    /// Pool wallet address miners are paid to.
    pub wallet: String,
    /// Telemetry snapshot directory; empty disables the api.
    pub api_path: String,
    pub blocks_file: PathBuf,
    /// Log file; empty logs to stdout.
    pub log_file: String,
    pub rpc_timeout_secs: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            daemon_host: "127.0.0.1".to_string(),
            rpc_port: 18081,
            zmq_port: 18083,
            stratum_port: 3333,
            p2p_port: 37889,
            wallet: String::new(),
            api_path: String::new(),
            blocks_file: PathBuf::from(crate::ledger::FOUND_BLOCKS_FILE),
            log_file: String::new(),
            rpc_timeout_secs: 30,
        }
    }
}

fn env_override(cfg: &mut Params) {
    if let Ok(v) = std::env::var("P2POOL_DAEMON_HOST") {
        cfg.daemon_host = v;
    }
    if let Ok(v) = std::env::var("P2POOL_RPC_PORT") {
        cfg.rpc_port = v.parse().unwrap_or(cfg.rpc_port);
    }
    if let Ok(v) = std::env::var("P2POOL_ZMQ_PORT") {
        cfg.zmq_port = v.parse().unwrap_or(cfg.zmq_port);
    }
    if let Ok(v) = std::env::var("P2POOL_STRATUM_PORT") {
        cfg.stratum_port = v.parse().unwrap_or(cfg.stratum_port);
    }
    if let Ok(v) = std::env::var("P2POOL_P2P_PORT") {
        cfg.p2p_port = v.parse().unwrap_or(cfg.p2p_port);
    }
    if let Ok(v) = std::env::var("P2POOL_WALLET") {
        cfg.wallet = v;
    }
    if let Ok(v) = std::env::var("P2POOL_API_PATH") {
        cfg.api_path = v;
    }
    if let Ok(v) = std::env::var("P2POOL_BLOCKS_FILE") {
        cfg.blocks_file = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("P2POOL_LOG_FILE") {
        cfg.log_file = v;
    }
    if let Ok(v) = std::env::var("P2POOL_RPC_TIMEOUT_SECS") {
        cfg.rpc_timeout_secs = v.parse().unwrap_or(cfg.rpc_timeout_secs);
    }
}

impl Params {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();

        let config_path = std::env::var("P2POOL_CONFIG")
            .unwrap_or_else(|_| "p2pool_config.json".to_string());
        match std::fs::read_to_string(&config_path) {
            Ok(txt) => {
                cfg = serde_json::from_str(&txt)
                    .map_err(|e| anyhow!("couldn't parse config file {}: {}", config_path, e))?;
                tracing::info!("loaded config from {}", config_path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow!("couldn't read config file {}: {}", config_path, e)),
        }

        env_override(&mut cfg);

        if cfg.wallet.is_empty() {
            return Err(anyhow!(
                "no wallet address configured, set P2POOL_WALLET or the \"wallet\" config field"
            ));
        }
        if cfg.rpc_timeout_secs == 0 {
            cfg.rpc_timeout_secs = 30;
        }

        Ok(cfg)
    }

    pub fn api_path(&self) -> Option<&str> {
        if self.api_path.is_empty() {
            None
        } else {
            Some(&self.api_path)
        }
    }

    pub fn log_file(&self) -> Option<&str> {
        if self.log_file.is_empty() {
            None
        } else {
            Some(&self.log_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_daemon() {
        let cfg = Params::default();
        assert_eq!(cfg.daemon_host, "127.0.0.1");
        assert_eq!(cfg.rpc_port, 18081);
        assert!(cfg.api_path().is_none());
        assert!(cfg.log_file().is_none());
    }

    #[test]
    fn config_file_fields_deserialize_with_defaults() {
        let cfg: Params = serde_json::from_str(
            r#"{"wallet": "pm1xyz", "rpc_port": 28081, "api_path": "/tmp/api"}"#,
        )
        .unwrap();
        assert_eq!(cfg.wallet, "pm1xyz");
        assert_eq!(cfg.rpc_port, 28081);
        assert_eq!(cfg.api_path(), Some("/tmp/api"));
        assert_eq!(cfg.zmq_port, 18083);
    }
}
