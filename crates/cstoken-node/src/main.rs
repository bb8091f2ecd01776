//! cstoken node: run a runtime on the gossip network, or operate on the local store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use cstoken_core::constants;
use cstoken_core::event::{EventEnvelope, Topic};
use cstoken_core::types::{self, NodeAddress};
use cstoken_network::bus::EventBus;
use cstoken_network::file_store::FileStore;
use cstoken_network::memory_bus::MemoryBus;
use cstoken_network::swarm::GossipSwarm;
use cstoken_network::transport::TransportConfig;
use cstoken_node::command::{self, Action, Command};
use cstoken_node::config::NodeConfig;
use cstoken_node::runtime::Runtime;
use cstoken_node::state::{self, NodeState};
use cstoken_protocol::registry;

#[derive(Debug, Parser)]
#[command(name = "cstoken-node", version, about = "Tree-structured token protocol node")]
struct Cli {
    /// Data directory (default: ~/.cstoken-node)
    #[arg(long, global = true, env = "CSTOKEN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Identity written into emitted events (default: peer id, or "cstoken-cli" offline)
    #[arg(long, global = true, env = "CSTOKEN_NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run a node until Ctrl+C. Commands are read from stdin, one per line
    Run(RunArgs),
    /// List registered nodes with addresses in [from, to]
    List {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    #[command(flatten)]
    Action(Action),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Address whose hops and releases this node processes (repeatable; none = all)
    #[arg(long = "serve", env = "CSTOKEN_SERVE", value_delimiter = ',')]
    served: Vec<String>,

    /// Listen address (repeatable; default /ip4/0.0.0.0/tcp/0)
    #[arg(long, env = "CSTOKEN_LISTEN", value_delimiter = ',')]
    listen: Vec<Multiaddr>,

    /// Bootstrap peer (repeatable)
    #[arg(long, env = "CSTOKEN_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<Multiaddr>,

    /// Disable mDNS discovery
    #[arg(long)]
    no_mdns: bool,

    /// Use an in-process bus instead of the gossip network
    #[arg(long)]
    local: bool,

    /// Take and compute Game of Life tasks
    #[arg(long, env = "CSTOKEN_WORKER")]
    worker: bool,

    #[arg(long, env = "CSTOKEN_TICK_MS", default_value_t = constants::MAINTENANCE_TICK_MS)]
    tick_ms: u64,

    #[arg(long, env = "CSTOKEN_CHAIN_DEADLINE_MS", default_value_t = constants::CHAIN_DEADLINE_MS)]
    chain_deadline_ms: i64,

    #[arg(long, env = "CSTOKEN_LEASE_MS", default_value_t = constants::TASK_MANAGER_LEASE_MS)]
    lease_ms: i64,

    #[arg(long, env = "CSTOKEN_CHUNK_ROWS", default_value_t = constants::DEFAULT_CHUNK_ROWS)]
    chunk_rows: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cstoken=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(FileStore::default_dir);

    match cli.command {
        CliCommand::Run(args) => run_node(data_dir, cli.node_id, args).await,
        CliCommand::List { from, to } => list_nodes(&data_dir, from, to),
        CliCommand::Action(action) => {
            let node_id = cli.node_id.unwrap_or_else(|| "cstoken-cli".to_string());
            run_once(data_dir, node_id, action).await
        }
    }
}

async fn run_node(data_dir: PathBuf, node_id: Option<String>, args: RunArgs) -> Result<()> {
    let store = FileStore::open(&data_dir).context("Failed to open store")?;
    let mut config = NodeConfig {
        data_dir: data_dir.clone(),
        served: args.served.into_iter().map(NodeAddress::from).collect(),
        worker: args.worker,
        tick: std::time::Duration::from_millis(args.tick_ms),
        chain_deadline: chrono::Duration::milliseconds(args.chain_deadline_ms),
        lease_ttl: chrono::Duration::milliseconds(args.lease_ms),
        chunk_rows: args.chunk_rows,
        ..NodeConfig::default()
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_console(command_tx));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    if args.local {
        config.node_id = node_id.unwrap_or_else(|| format!("local-{}", std::process::id()));
        let runtime = Runtime::new(
            NodeState::new(store, &config),
            MemoryBus::new(),
            config.backoff.clone(),
            config.tick,
        )?;
        info!(node_id = %config.node_id, "Running with the in-process bus. Press Ctrl+C to stop.");
        runtime.run(command_rx, shutdown).await;
        return Ok(());
    }

    let seed = state::load_or_create_seed(&data_dir)?;
    let mut transport = TransportConfig {
        bootstrap_peers: args.bootstrap,
        enable_mdns: !args.no_mdns,
        dedup_capacity: config.dedup_capacity,
        ..TransportConfig::default()
    };
    if !args.listen.is_empty() {
        transport.listen_addrs = args.listen;
    }

    let (mut swarm, bus) = GossipSwarm::new(seed, transport).context("Failed to create swarm")?;
    swarm.start().context("Failed to start listening")?;
    config.node_id = node_id.unwrap_or_else(|| bus.local_peer_id().to_string());
    let swarm_task = tokio::spawn(swarm.run());

    let runtime = Runtime::new(NodeState::new(store, &config), bus, config.backoff.clone(), config.tick)?;
    info!(node_id = %config.node_id, "cstoken node running. Press Ctrl+C to stop.");
    runtime.run(command_rx, shutdown).await;

    swarm_task.abort();
    Ok(())
}

/// Forward stdin lines to the runtime as commands.
async fn read_console(commands: mpsc::UnboundedSender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match command::parse_line(&line) {
            Ok(cmd) => {
                if commands.send(cmd).is_err() {
                    return;
                }
            }
            Err(e) => warn!(line = %line, error = %e, "Unrecognized command"),
        }
    }
}

/// Execute one command against the local store with an in-process runtime that
/// processes every hop, then print the events it produced as JSON lines.
async fn run_once(data_dir: PathBuf, node_id: String, action: Action) -> Result<()> {
    let command = action.into_command()?;
    let store = FileStore::open(&data_dir).context("Failed to open store")?;
    let config = NodeConfig {
        data_dir,
        node_id,
        ..NodeConfig::default()
    };

    let bus = MemoryBus::new();
    let mut printer = bus.subscribe(&Topic::ALL)?;
    let mut runtime = Runtime::new(NodeState::new(store, &config), bus, config.backoff.clone(), config.tick)?;

    let now = types::now();
    runtime.execute(command, now).await?;
    runtime.drain(now).await;

    while let Some(delivery) = printer.try_recv() {
        let envelope = EventEnvelope::decode(delivery.topic, &delivery.payload)?;
        println!("{}", serde_json::to_string(&envelope.event)?);
    }
    if !runtime.state().stalls.is_empty() {
        warn!(chains = runtime.state().stalls.len(), "Request stalled; a running node retries it");
    }
    Ok(())
}

fn list_nodes(data_dir: &Path, from: Option<String>, to: Option<String>) -> Result<()> {
    let store = FileStore::open(data_dir).context("Failed to open store")?;
    let low = NodeAddress::from(from.unwrap_or_default());
    let high = NodeAddress::from(to.unwrap_or_else(|| char::MAX.to_string()));
    for node in registry::list_in_range(&store, &low, &high)? {
        println!("{}", serde_json::to_string(&node)?);
    }
    Ok(())
}
