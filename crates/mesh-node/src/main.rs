//! mesh-node: standalone pulse mesh node.
//!
//! Loads (or creates) the node identity and peer directory from the data
//! directory, listens for peers, dials known ones and logs every mesh event.

use anyhow::{Context, Result};
use clap::Parser;
use mesh_core::{
    FileStore, MeshConfig, MeshEvent, PeerDirectory, SignalAnalyzer, StateProvider, Store,
    get_or_create_identity,
};
use mesh_node::{IDENTITY_FILE, KNOWN_PEERS_FILE, Node};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Pulse mesh node")]
struct Args {
    /// Path to the JSON config file (created with defaults if missing)
    #[arg(short, long, default_value = "mesh.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for identity and known peers (overrides config)
    #[arg(long)]
    data_dir: Option<String>,

    /// Peer address to dial, as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Address other nodes can reach us at, as host:port
    #[arg(long)]
    advertise: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_node=debug,mesh_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = MeshConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.advertise.is_some() {
        config.advertise_address = args.advertise;
    }
    config.bootstrap_peers.extend(args.peers);

    info!("Starting mesh-node");
    info!("Data directory: {}", config.data_dir);
    info!("Listen address: {}", config.listen_addr());

    let store: Arc<dyn Store> = Arc::new(FileStore::new(&config.data_dir));

    // Without a stable identity the node can't take part in the mesh
    let signal_state = SignalAnalyzer::new(config.signal.clone()).state_digest();
    let identity = get_or_create_identity(store.as_ref(), Path::new(IDENTITY_FILE), &signal_state)
        .context("Failed to load node identity")?;
    info!("Node ID: {} (born {})", identity.id, identity.birth_time);
    if !identity.verify_proof_shape() {
        warn!("Genesis proof of {} looks malformed", identity.id);
    }

    let directory = PeerDirectory::load(store, KNOWN_PEERS_FILE)
        .context("Failed to load peer directory")?;
    info!("{} known peer(s)", directory.all().len());

    let provider = uptime_provider(config.signal_field.clone());
    let (node, handle, events) = Node::bind(identity, config, directory, provider)
        .await
        .context("Failed to start listener")?;

    let logger = tokio::spawn(log_events(events));
    let node_task = tokio::spawn(node.run());

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    handle.shutdown();
    node_task.await.context("Node task panicked")?;
    logger.await.context("Event logger panicked")?;

    Ok(())
}

/// Default state summary: uptime, with a signal that ramps up once a minute.
fn uptime_provider(signal_field: String) -> Arc<dyn StateProvider> {
    let started = Instant::now();
    Arc::new(move || {
        let uptime = started.elapsed().as_secs_f64();
        let mut summary = json!({
            "uptimeSecs": uptime.round(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        summary[signal_field.as_str()] = Value::from(uptime % 60.0);
        summary
    })
}

/// Log every event until the node is gone.
async fn log_events(mut events: mpsc::UnboundedReceiver<MeshEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!("event: {}", json),
            Err(e) => warn!("Failed to serialize event {:?}: {}", event, e),
        }
    }
}
