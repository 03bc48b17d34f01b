/// Prometheus counters for the coordinator's hot paths

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static ZMQ_EVENTS: OnceLock<IntCounter> = OnceLock::new();

static MAINCHAIN_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static MEMPOOL_SIZE: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn counter(slot: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    slot.get_or_init(|| {
        let c = IntCounter::new(name, help).unwrap();
        let _ = registry().register(Box::new(c.clone()));
        c
    })
}

fn gauge(slot: &'static OnceLock<IntGauge>, name: &str, help: &str) -> &'static IntGauge {
    slot.get_or_init(|| {
        let g = IntGauge::new(name, help).unwrap();
        let _ = registry().register(Box::new(g.clone()));
        g
    })
}

pub fn inc_rpc_requests() {
    counter(&RPC_REQUESTS, "rpc_requests_total", "Total RPC requests to the daemon").inc();
}

pub fn inc_rpc_errors() {
    counter(&RPC_ERRORS, "rpc_errors_total", "Total failed RPC requests").inc();
}

pub fn inc_template_updates() {
    counter(
        &TEMPLATE_UPDATES,
        "block_template_updates_total",
        "Total block template rebuilds",
    )
    .inc();
}

pub fn inc_block_submit_attempts() {
    counter(
        &BLOCK_SUBMIT_ATTEMPTS,
        "block_submit_attempts_total",
        "Total submit_block RPC calls",
    )
    .inc();
}

pub fn inc_blocks_found() {
    counter(&BLOCKS_FOUND, "blocks_found_total", "Total main-chain blocks found by this pool").inc();
}

pub fn inc_zmq_events() {
    counter(&ZMQ_EVENTS, "zmq_events_total", "Total decoded ZMQ events").inc();
}

pub fn set_mainchain_height(height: u64) {
    gauge(&MAINCHAIN_HEIGHT, "mainchain_height", "Latest observed main-chain height")
        .set(height as i64);
}

pub fn set_mempool_size(size: usize) {
    gauge(&MEMPOOL_SIZE, "mempool_size", "Transactions currently tracked for templates")
        .set(size as i64);
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&registry().gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
