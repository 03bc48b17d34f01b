/// Coordinator bootstrap: parameters, wallet, signal handlers, event loop.
///
/// Exit code 0 on a clean stop, 1 on startup failure. Bootstrap-fatal
/// inconsistencies (wrong network, incompatible daemon, unresolvable host)
/// abort the process outright.

use p2pool::config::Params;
use p2pool::coordinator::Coordinator;
use p2pool::daemon::bootstrap;
use p2pool::hasher::SeedTracker;
use p2pool::sidechain::ShareChain;
use p2pool::template::PoolBlockTemplate;
use p2pool::types::NetworkType;
use p2pool::wallet::{self, WalletAddress};

use std::io::Write;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log sink that can reopen its file on SIGUSR1 so external rotation works.
#[derive(Clone)]
struct LogWriter {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl LogWriter {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn reopen(&self) {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(f) => *self.file.lock().unwrap() = f,
            Err(e) => eprintln!("couldn't reopen log file {:?}: {}", self.path, e),
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().unwrap().flush()
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn fatal(msg: &str) -> ! {
    tracing::error!("{}", msg);
    std::process::abort();
}

fn install_signal_handlers(coordinator: Arc<Coordinator>, log_writer: Option<LogWriter>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = signal(SignalKind::hangup()).expect("SIGHUP handler");
            let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
            let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let mut usr1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 handler");
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        tracing::info!("caught SIGHUP, stopping");
                        coordinator.stop();
                    }
                    _ = interrupt.recv() => {
                        tracing::info!("caught SIGINT, stopping");
                        coordinator.stop();
                    }
                    _ = terminate.recv() => {
                        tracing::info!("caught SIGTERM, stopping");
                        coordinator.stop();
                    }
                    _ = usr1.recv() => {
                        tracing::info!("caught SIGUSR1, reopening log file");
                        match &log_writer {
                            Some(w) => w.reopen(),
                            None => tracing::info!("logging to stdout, nothing to rotate"),
                        }
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = &log_writer;
            tokio::signal::ctrl_c().await.expect("ctrl-c handler");
            tracing::info!("caught ctrl-c, stopping");
            coordinator.stop();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let params = {
        // logging isn't up yet, report config errors on stderr
        match Params::load() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("startup failed: {:#}", e);
                return ExitCode::from(1);
            }
        }
    };

    let log_writer = match params.log_file() {
        Some(path) => match LogWriter::open(PathBuf::from(path)) {
            Ok(w) => {
                tracing_subscriber::fmt()
                    .with_max_level(tracing::Level::INFO)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(w.clone())
                    .init();
                Some(w)
            }
            Err(e) => {
                eprintln!("couldn't open log file {}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        None => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .with_target(false)
                .init();
            None
        }
    };

    tracing::info!("🚀 p2pool coordinator v{}", VERSION);

    let wallet: WalletAddress = match params.wallet.parse() {
        Ok(w) => w,
        Err(e) => {
            tracing::error!("invalid wallet address: {}", e);
            return ExitCode::from(1);
        }
    };

    match wallet.network() {
        NetworkType::Mainnet => {}
        NetworkType::Testnet => tracing::warn!("mining to a testnet wallet address"),
        NetworkType::Stagenet => tracing::warn!("mining to a stagenet wallet address"),
    }

    // the coinbase key schedule starts from a fresh ephemeral key pair
    let (_coinbase_public, coinbase_secret) = wallet::generate_keys();

    let probe = if params.daemon_host.contains(':') && !params.daemon_host.starts_with('[') {
        format!("[{}]:{}", params.daemon_host, params.rpc_port)
    } else {
        format!("{}:{}", params.daemon_host, params.rpc_port)
    };
    match probe.to_socket_addrs() {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => tracing::info!("daemon host resolved to {}", addr.ip()),
            None => fatal(&format!("couldn't resolve daemon host {}", params.daemon_host)),
        },
        Err(e) => fatal(&format!(
            "couldn't resolve daemon host {}: {}",
            params.daemon_host, e
        )),
    }

    let hasher = Arc::new(SeedTracker::new());
    let side_chain = Arc::new(ShareChain::new(wallet.network()));
    let block_template = Arc::new(PoolBlockTemplate::new(coinbase_secret));

    let coordinator = match Coordinator::new(
        params,
        wallet,
        hasher,
        side_chain,
        block_template,
    ) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("startup failed: {:#}", e);
            return ExitCode::from(1);
        }
    };

    install_signal_handlers(Arc::clone(&coordinator), log_writer);

    // publish the initial snapshots, found blocks included, before any work
    coordinator.on_block_found(None);

    {
        let bootstrap_coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if let Err(e) = bootstrap::run(&bootstrap_coordinator).await {
                fatal(&format!("daemon bootstrap failed: {:#}", e));
            }
        });
    }

    coordinator.run().await;
    coordinator.shutdown().await;

    ExitCode::SUCCESS
}
