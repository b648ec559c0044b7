//! Weft Daemon (`weftd`)
//!
//! Headless daemon running one control-plane node: the replicated
//! key-value store plus the UDP health checker, wired onto the
//! process-local message fabric.

use anyhow::Context;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weft_health::{HealthCheckOption, HealthChecker, HealthCheckerConfig};
use weft_net::{Keypair, MessageBus};
use weft_proto::PeerSpec;
use weft_store::{KvStore, KvStoreConfig};

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum HealthCheckArg {
    Topology,
    NeighborOfNeighbor,
    Random,
}

impl From<HealthCheckArg> for HealthCheckOption {
    fn from(arg: HealthCheckArg) -> Self {
        match arg {
            HealthCheckArg::Topology => HealthCheckOption::Topology,
            HealthCheckArg::NeighborOfNeighbor => HealthCheckOption::NeighborOfNeighbor,
            HealthCheckArg::Random => HealthCheckOption::Random,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "weftd", version, about = "Weft control-plane node")]
struct Args {
    /// Node id, unique within the routing domain
    #[arg(long)]
    node_id: String,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Initial peer, as NAME=PUB_URL,CMD_URL (repeatable)
    #[arg(long = "peer", value_name = "NAME=PUB_URL,CMD_URL")]
    peers: Vec<String>,

    /// Seconds between anti-entropy rounds
    #[arg(long, default_value_t = 60)]
    db_sync_interval: u64,

    /// Seconds between stats submissions
    #[arg(long, default_value_t = 60)]
    stats_submit_interval: u64,

    /// Keypair file enabling sealed global channels; must exist unless
    /// --generate-keypair is given
    #[arg(long)]
    keypair_file: Option<PathBuf>,

    /// Generate a fresh keypair at --keypair-file before starting
    #[arg(long, requires = "keypair_file")]
    generate_keypair: bool,

    /// Ping target selection policy
    #[arg(long, value_enum, default_value_t = HealthCheckArg::Topology)]
    health_check_option: HealthCheckArg,

    /// Sampling percentage for the random policy (0-100)
    #[arg(long, default_value_t = 50)]
    health_check_pct: u32,

    /// UDPv6 port for health-check pings
    #[arg(long, default_value_t = weft_health::DEFAULT_UDP_PING_PORT)]
    udp_ping_port: u16,

    /// Seconds between ping rounds
    #[arg(long, default_value_t = 3)]
    ping_interval: u64,

    /// DSCP value for ping traffic
    #[arg(long)]
    ip_tos: Option<u8>,
}

fn parse_peer(entry: &str) -> anyhow::Result<(String, PeerSpec)> {
    let (name, urls) = entry
        .split_once('=')
        .with_context(|| format!("peer entry '{entry}' is missing '='"))?;
    let (pub_url, cmd_url) = urls
        .split_once(',')
        .with_context(|| format!("peer entry '{entry}' needs PUB_URL,CMD_URL"))?;
    Ok((
        name.to_string(),
        PeerSpec {
            pub_url: pub_url.to_string(),
            cmd_url: cmd_url.to_string(),
        },
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("weftd v{} starting...", env!("CARGO_PKG_VERSION"));

    let keypair = match &args.keypair_file {
        Some(path) => {
            if args.generate_keypair {
                let keypair = Keypair::generate();
                keypair
                    .save(path)
                    .with_context(|| format!("writing keypair to {}", path.display()))?;
                tracing::info!(path = %path.display(), "generated new domain keypair");
                Some(keypair)
            } else {
                Some(
                    Keypair::load(path)
                        .with_context(|| format!("loading keypair from {}", path.display()))?,
                )
            }
        }
        None => None,
    };

    let mut initial_peers = HashMap::new();
    for entry in &args.peers {
        let (name, spec) = parse_peer(entry)?;
        initial_peers.insert(name, spec);
    }

    let bus = MessageBus::new();

    let mut store_config = KvStoreConfig::for_node(&args.node_id);
    store_config.db_sync_interval = Duration::from_secs(args.db_sync_interval);
    store_config.stats_submit_interval = Duration::from_secs(args.stats_submit_interval);
    store_config.initial_peers = initial_peers;
    store_config.keypair = keypair;
    let store = KvStore::spawn(store_config, bus.clone())
        .await
        .map_err(|e| {
            tracing::error!("failed to start kvstore: {e}");
            anyhow::anyhow!("{e}")
        })?;

    let mut health_config = HealthCheckerConfig::for_node(&args.node_id);
    health_config.option = args.health_check_option.into();
    health_config.health_check_pct = args.health_check_pct;
    health_config.udp_ping_port = args.udp_ping_port;
    health_config.udp_bind_port = args.udp_ping_port;
    health_config.ping_interval = Duration::from_secs(args.ping_interval);
    health_config.stats_submit_interval = Duration::from_secs(args.stats_submit_interval);
    health_config.ip_tos = args.ip_tos;
    let health = HealthChecker::spawn(health_config, bus.clone())
        .await
        .map_err(|e| {
            tracing::error!("failed to start health checker: {e}");
            anyhow::anyhow!("{e}")
        })?;

    tracing::info!(node_id = %args.node_id, "daemon ready, press Ctrl+C to stop");
    shutdown_signal().await;
    tracing::info!("shutdown signal received...");

    health.shutdown().await;
    store.shutdown().await;
    tracing::info!("daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().unwrap());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
    }
}
