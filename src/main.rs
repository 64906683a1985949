// RustyDB node server: boots the WAL, runs crash recovery, then serves the host-directed RPC
// listener that drives 2PC and node-local DML execution.

use rusty_db::cluster::Blacklist;
use rusty_db::collaborators::{InMemoryBufferPool, StaticMetadata};
use rusty_db::config::Config;
use rusty_db::dml::NodeDmlExecutor;
use rusty_db::log::LogManager;
use rusty_db::recovery::{RecoveryEngine, XaResolver};
use rusty_db::rpc::{server::serve, RequestHandler, TcpTransport};
use rusty_db::xa::{Command, Dispatcher, Transport, TwoPhaseCommitCoordinator, Vote};
use rusty_db::{DbError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();

    print_banner();

    let install_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_path = install_dir.join("rustydb.conf");
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        warn!(path = %config_path.display(), "no config file found, using defaults");
        Config::default()
    };
    print_startup_info(&config);

    std::fs::create_dir_all(&config.log_dir)?;

    let log = Arc::new(LogManager::new(config.log_dir.clone(), config.target_log_size)?);
    let buffer_pool = Arc::new(InMemoryBufferPool::new());

    let blacklist = Arc::new(Blacklist::new());
    let transport = Arc::new(TcpTransport::new(config.port_number, Duration::from_secs(2), Duration::from_secs(5)));
    let dispatcher = Dispatcher::new(transport.clone(), blacklist.clone(), config.max_neighbor_nodes);
    let coordinator = Arc::new(TwoPhaseCommitCoordinator::new(log.clone(), dispatcher.clone()));

    info!("running startup recovery");
    let resolver: Arc<dyn XaResolver> =
        Arc::new(CoordinatorResolver { coordinator: coordinator.clone(), transport: transport.clone() });
    let recovery = RecoveryEngine::new(log.clone(), buffer_pool.clone(), resolver);
    recovery.run("active").await?;
    coordinator.recover().await?;
    info!("recovery complete");

    let mut devices = HashMap::new();
    for (i, dir) in config.data_directories.iter().enumerate() {
        devices.insert(i as u32, dir.clone());
    }
    let metadata = Arc::new(StaticMetadata::new(HashMap::new(), devices, HashMap::new()));
    let executor = Arc::new(NodeDmlExecutor::new(metadata, buffer_pool.clone(), log.clone(), config.max_batch));

    {
        let log = log.clone();
        let sleep = Duration::from_secs(config.log_clean_sleep_secs);
        std::thread::spawn(move || log.run_background_drain(sleep));
    }

    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                dispatcher.retry_deferred().await;
            }
        });
    }

    let handler: Arc<dyn RequestHandler> =
        Arc::new(NodeRequestHandler { coordinator, executor, dispatcher, log: log.clone() });
    let addr = format!("0.0.0.0:{}", config.port_number).parse().map_err(|e| {
        DbError::Config(format!("invalid port_number: {e}"))
    })?;

    info!(%addr, "node server ready");
    if let Err(e) = serve(addr, handler).await {
        error!(error = %e, "rpc listener stopped with error");
        return Err(e);
    }
    Ok(())
}

/// Adapts the local coordinator to recovery's narrow `XaResolver` contract. `phase2_commit`/
/// `phase2_abort` resume this process's own coordinator, since recovery only ever resumes a 2PC
/// round this node is itself coordinating; `ask_xa` is the one call that genuinely crosses the
/// wire to `host`, since that host is a different physical coordinator in a real deployment.
struct CoordinatorResolver {
    coordinator: Arc<TwoPhaseCommitCoordinator>,
    transport: Arc<TcpTransport>,
}

#[async_trait::async_trait]
impl XaResolver for CoordinatorResolver {
    async fn ask_xa(&self, host: &str, tx: rusty_db::common::TransactionId) -> Result<bool> {
        match self.transport.send(host, Command::CheckTx, tx, None).await? {
            Vote::Ok => Ok(true),
            Vote::No => Ok(false),
        }
    }

    async fn phase2_commit(&self, tx: rusty_db::common::TransactionId, participants: &[String]) -> Result<()> {
        self.coordinator.phase2(tx, participants).await
    }

    async fn phase2_abort(&self, tx: rusty_db::common::TransactionId, participants: &[String]) -> Result<()> {
        self.coordinator.rollback(tx, participants).await
    }
}

struct NodeRequestHandler {
    coordinator: Arc<TwoPhaseCommitCoordinator>,
    executor: Arc<NodeDmlExecutor>,
    dispatcher: Dispatcher,
    log: Arc<LogManager>,
}

#[async_trait::async_trait]
impl RequestHandler for NodeRequestHandler {
    /// Performs this node's local work for `req.command`, then — per the spanning-tree broadcast
    /// contract — recursively dispatches the same command to whatever subtree remains, folding
    /// the subtree's vote together with this node's own local vote into the reply to the caller.
    ///
    /// `CHECKTX` is the exception: it's a point-to-point recovery query (a participant asking the
    /// coordinator for a transaction's durable decision), never a tree broadcast, so it answers
    /// directly from the coordinator's XA log and returns before the broadcast step below.
    async fn handle(&self, req: rusty_db::rpc::Request, peer: std::net::SocketAddr) -> Result<rusty_db::rpc::Response> {
        use rusty_db::rpc::Response;

        if req.command == Command::CheckTx {
            return Ok(if self.coordinator.ask_xa(req.tx)? { Response::Ok } else { Response::No });
        }

        let mut vote = match req.command {
            Command::Prepare => {
                if self.executor.is_ready(req.tx) {
                    self.log.ready(req.tx, peer.ip().to_string(), "active")?;
                    Vote::Ok
                } else {
                    self.log.not_ready(req.tx, "active")?;
                    Vote::No
                }
            }
            Command::LCommit => {
                self.executor.finish(req.tx, true)?;
                Vote::Ok
            }
            Command::LRollback => {
                self.executor.finish(req.tx, false)?;
                Vote::Ok
            }
            // MDELETE is a tree-broadcast command the core owns, but actually scanning and
            // deleting the table's live rows here would need an index-instance-by-name lookup and
            // a live-row-enumeration capability this crate's collaborator contracts don't expose
            // (see DESIGN.md). Left a no-op pending that collaborator.
            Command::MDelete => Vote::Ok,
            Command::CheckTx => unreachable!("handled above"),
        };

        if let Some(subtree) = &req.subtree {
            if self.dispatcher.broadcast(subtree, req.command, req.tx).await? == Vote::No {
                vote = Vote::No;
            }
        }

        match (req.command, vote) {
            (Command::Prepare, Vote::No) => Ok(Response::No),
            _ => Ok(Response::Ok),
        }
    }
}

fn print_banner() {
    println!("============================================================");
    println!(" RustyDB node server v{}", env!("CARGO_PKG_VERSION"));
    println!("============================================================");
}

fn print_startup_info(config: &Config) {
    println!("log_dir:              {}", config.log_dir.display());
    println!("target_log_size:      {} bytes", config.target_log_size);
    println!("log_clean_sleep_secs: {}", config.log_clean_sleep_secs);
    println!("port_number:          {}", config.port_number);
    println!("max_neighbor_nodes:   {}", config.max_neighbor_nodes);
    println!("max_batch:            {}", config.max_batch);
    println!("data_directories:     {:?}", config.data_directories);
    println!();
}
