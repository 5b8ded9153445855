use powd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod breaker;
pub mod config;
mod coordinator;
pub mod error;
pub mod gossip;
pub mod load;
pub mod mempool;
pub mod miner;
pub mod node;
pub mod p2p;
pub mod peer_book;
pub mod template;
pub mod wire;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use fs2::FileExt;
use powd_consensus::params::consensus_params;
use powd_storage::fjall::{FjallOptions, FjallStore};
use powd_storage::memory::MemoryStore;
use tokio::sync::watch;

pub use config::{Backend, Cli, NodeConfig, NodeType};
pub use error::{NetworkError, NodeError};
pub use gossip::Gossip;
pub use node::{BlockOutcome, BlockSource, Node, NodeEvent, NodeOptions, NodeStatus, SharedStore};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const BANLIST_FILE_NAME: &str = "banlist.json";
const DB_DIR_NAME: &str = "db";

struct DataDirLock {
    _file: File,
}

pub async fn run_entry() -> Result<(), String> {
    let cli = Cli::parse();
    let config = NodeConfig::from_cli(cli).map_err(|err| err.to_string())?;
    run_with_config(config).await
}

pub async fn run_with_config(config: NodeConfig) -> Result<(), String> {
    let start_time = Instant::now();
    logging::init(config.log);

    log_info!(
        "Startup: begin (network={}, node_type={:?}, backend={:?}, data_dir={})",
        config.network.as_str(),
        config.node_type,
        config.backend,
        config.data_dir.display()
    );

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;

    let store = open_store(config.backend, &config.data_dir)?;
    let params = consensus_params(config.network);
    let node = Arc::new(
        Node::open(params, store, NodeOptions::from_config(&config))
            .map_err(|err| format!("failed to open chain state: {err}"))?,
    );
    let tip = node.tip();
    log_info!(
        "Startup: chain at height {} tip {} difficulty {:.4}",
        tip.height,
        wire::short_hash(&tip.hash),
        node.difficulty()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let gossip = Gossip::new(Arc::clone(&node), &config, shutdown_rx.clone());
    let banlist_path = config.data_dir.join(BANLIST_FILE_NAME);
    match gossip.book().load_banlist(&banlist_path) {
        Ok(0) => {}
        Ok(count) => log_info!("Startup: restored {count} banned peer(s)"),
        Err(err) => log_warn!("Startup: ignoring banlist {}: {err}", banlist_path.display()),
    }
    let listener = match config.listen {
        Some(addr) => Some(
            gossip
                .bind(addr)
                .await
                .map_err(|err| format!("failed to bind p2p listener {addr}: {err}"))?,
        ),
        None => None,
    };
    let mut tasks = gossip.start(listener);

    if config.node_type == NodeType::Miner {
        tasks.push(tokio::spawn(
            Arc::clone(&node).run_miner(shutdown_rx.clone(), config.net.sync_interval),
        ));
    }
    if let Some(interval) = config.status_interval {
        tasks.push(spawn_status_logger(Arc::clone(&node), interval, shutdown_rx.clone()));
    }

    log_info!(
        "Startup: ready in {}ms",
        start_time.elapsed().as_millis()
    );

    let mut shutdown = shutdown_rx;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    log_info!("Shutdown: stopping");
    node.miner().cancel_current();
    if let Err(err) = gossip.book().save_banlist(&banlist_path) {
        log_warn!("Shutdown: failed to save banlist: {err}");
    }
    for task in &tasks {
        task.abort();
    }
    node.log_status();
    log_info!(
        "Shutdown: complete after {}s",
        start_time.elapsed().as_secs()
    );
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

fn open_store(backend: Backend, data_dir: &Path) -> Result<SharedStore, String> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryStore::new())),
        Backend::Fjall => {
            let path = data_dir.join(DB_DIR_NAME);
            let store = FjallStore::open_with_options(
                &path,
                FjallOptions {
                    sync_commits: true,
                    ..FjallOptions::default()
                },
            )
            .map_err(|err| format!("failed to open store at {}: {err}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is already in use ({})",
                data_dir.display(),
                holder.trim()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {}: {err}",
            data_dir.display()
        )),
    }
}

fn spawn_status_logger(
    node: Arc<Node>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => node.log_status(),
            }
        }
    })
}
