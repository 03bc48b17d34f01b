/// Daemon bootstrap state machine
///
/// GET_INFO → GET_VERSION → GET_MINER_DATA → DOWNLOAD_HEADERS, each step
/// retrying in place every second on transport errors or malformed payloads.
/// Hard incompatibilities (wrong network, old daemon) are returned as errors
/// and abort the process. Servers start exactly once, after the full header
/// window is indexed.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{
    evaluate_get_info, evaluate_get_version, parse_block_header, parse_block_headers_range,
    parse_miner_data, InfoOutcome, VersionOutcome,
};
use crate::coordinator::Coordinator;
use crate::mainchain::{seed_height, BLOCK_HEADERS_REQUIRED, SEEDHASH_EPOCH_BLOCKS};

/// Oldest daemon RPC version we can talk to (major << 16 | minor).
pub const MIN_RPC_VERSION: u64 = 0x0003_0008;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    GetInfo,
    GetVersion,
    GetMinerData,
    DownloadHeaders(u64),
}

enum Progress {
    Advance(Step),
    Done,
    Retry(String),
}

/// Drive the bootstrap to completion. Returns `Err` only for fatal
/// inconsistencies; everything else retries forever.
pub async fn run(coordinator: &Arc<Coordinator>) -> Result<()> {
    let mut step = Step::GetInfo;
    loop {
        let progress = match step {
            Step::GetInfo => get_info(coordinator).await?,
            Step::GetVersion => get_version(coordinator).await?,
            Step::GetMinerData => get_miner_data(coordinator).await?,
            Step::DownloadHeaders(height) => download_headers(coordinator, height).await?,
        };

        match progress {
            Progress::Advance(next) => step = next,
            Progress::Done => return Ok(()),
            Progress::Retry(why) => {
                tracing::warn!("{}, trying again in 1 second", why);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

async fn get_info(c: &Arc<Coordinator>) -> Result<Progress> {
    let result = match c.rpc().call("get_info", json!({})).await {
        Ok(v) => v,
        Err(e) => return Ok(Progress::Retry(format!("get_info RPC request failed: {}", e))),
    };

    Ok(match evaluate_get_info(&result, c.side_chain().network_type()) {
        InfoOutcome::Ready => Progress::Advance(Step::GetVersion),
        InfoOutcome::BusySyncing => Progress::Retry("daemon is busy syncing".to_string()),
        InfoOutcome::NotSynchronized => Progress::Retry("daemon is not synchronized".to_string()),
        InfoOutcome::Malformed => Progress::Retry("get_info RPC response is invalid".to_string()),
        InfoOutcome::NetworkMismatch(daemon, ours) => {
            return Err(anyhow!(
                "daemon is on {}, but you're mining to a {} side chain",
                daemon,
                ours
            ));
        }
    })
}

async fn get_version(c: &Arc<Coordinator>) -> Result<Progress> {
    let result = match c.rpc().call("get_version", json!({})).await {
        Ok(v) => v,
        Err(e) => {
            return Ok(Progress::Retry(format!(
                "get_version RPC request failed: {}",
                e
            )))
        }
    };

    Ok(match evaluate_get_version(&result) {
        VersionOutcome::Compatible(version) => {
            tracing::info!(
                "daemon RPC v{}.{}",
                version >> 16,
                version & 0xffff
            );
            Progress::Advance(Step::GetMinerData)
        }
        VersionOutcome::NotOk(status) => {
            Progress::Retry(format!("get_version RPC returned status {:?}", status))
        }
        VersionOutcome::Malformed => {
            Progress::Retry("get_version RPC response is invalid".to_string())
        }
        VersionOutcome::Incompatible(version) => {
            return Err(anyhow!(
                "daemon RPC v{}.{} is incompatible, update to RPC >= v{}.{}",
                version >> 16,
                version & 0xffff,
                MIN_RPC_VERSION >> 16,
                MIN_RPC_VERSION & 0xffff
            ));
        }
    })
}

async fn get_miner_data(c: &Arc<Coordinator>) -> Result<Progress> {
    let result = match c.rpc().call("get_miner_data", json!({})).await {
        Ok(v) => v,
        Err(e) => {
            return Ok(Progress::Retry(format!(
                "get_miner_data RPC request failed: {}",
                e
            )))
        }
    };

    let Some(data) = parse_miner_data(&result) else {
        return Ok(Progress::Retry(
            "get_miner_data RPC response failed to parse".to_string(),
        ));
    };

    let height = data.height;
    c.handle_miner_data(data);
    Ok(Progress::Advance(Step::DownloadHeaders(height)))
}

async fn download_headers(c: &Arc<Coordinator>, current_height: u64) -> Result<Progress> {
    let seed = seed_height(current_height);
    let prev_seed = seed.saturating_sub(SEEDHASH_EPOCH_BLOCKS);

    // Two RandomX seed headers first. The previous seed goes to the hasher
    // synchronously so stratum and p2p can't start before it's known.
    for height in [prev_seed, seed] {
        let result = match c
            .rpc()
            .call("get_block_header_by_height", json!({ "height": height }))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                return Ok(Progress::Retry(format!(
                    "couldn't download block header for height {}: {}",
                    height, e
                )))
            }
        };

        let Some(header) = parse_block_header(&result) else {
            return Ok(Progress::Retry(format!(
                "block header for height {} failed to parse",
                height
            )));
        };

        if height == prev_seed {
            c.hasher().set_old_seed(header.id);
        }
        c.mainchain().insert_header(header);
    }

    let start = current_height.saturating_sub(BLOCK_HEADERS_REQUIRED);
    let end = current_height.saturating_sub(1);
    let result = match c
        .rpc()
        .call(
            "get_block_headers_range",
            json!({ "start_height": start, "end_height": end }),
        )
        .await
    {
        Ok(v) => v,
        Err(e) => {
            return Ok(Progress::Retry(format!(
                "couldn't download block headers for heights {} - {}: {}",
                start, end, e
            )))
        }
    };

    let headers = parse_block_headers_range(&result);
    let inserted = c.mainchain().insert_headers(headers) as u64;
    if inserted != BLOCK_HEADERS_REQUIRED {
        return Ok(Progress::Retry(format!(
            "block headers range {} - {} returned {} headers",
            start, end, inserted
        )));
    }

    tracing::info!(
        "downloaded {} block headers for heights {} - {}",
        inserted,
        start,
        end
    );

    c.update_median_timestamp();
    c.start_servers()?;
    Ok(Progress::Done)
}
