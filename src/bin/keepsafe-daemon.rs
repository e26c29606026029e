//! KEEPSAFE Daemon
//!
//! Runs scheduled backups, retention-aware artifact handling and replica
//! lag monitoring until interrupted.

use clap::Parser;
use keepsafe::crypto::parse_master_hex;
use keepsafe::{KeyManager, Orchestrator, OrchestratorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// KEEPSAFE Daemon - Disaster Recovery Orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Orchestrator root directory (overrides the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Current primary node (overrides the config file)
    #[arg(long)]
    primary: Option<String>,

    /// Replica node to monitor; repeat for several
    #[arg(long = "replica")]
    replicas: Vec<String>,

    /// Master secret as 64 hex characters
    #[arg(long, env = "KEEPSAFE_MASTER_KEY", hide_env_values = true)]
    master_key: String,

    /// Version number of the master secret
    #[arg(long, env = "KEEPSAFE_KEY_VERSION", default_value_t = 1)]
    key_version: u32,

    /// Older master secrets as VERSION:HEX, comma separated
    #[arg(long, env = "KEEPSAFE_ARCHIVED_KEYS", value_delimiter = ',', hide_env_values = true)]
    archived_keys: Vec<String>,

    /// Backup worker threads (0 = auto-detect)
    #[arg(long)]
    workers: Option<usize>,

    /// Run every cadence once at startup
    #[arg(long, default_value_t = false)]
    fire_on_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keepsafe=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::new("/var/lib/keepsafe"),
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(primary) = args.primary {
        config.primary = primary;
    }
    if !args.replicas.is_empty() {
        config.replication.replicas = args.replicas;
    }
    if let Some(workers) = args.workers {
        config.workers.num_workers = workers;
    }
    if args.fire_on_start {
        config.schedule.fire_on_start = true;
    }
    if config.replication.replicas.is_empty() {
        warn!("No replicas configured; replication monitoring is idle");
    }

    let keys = KeyManager::with_version(parse_master_hex(&args.master_key)?, args.key_version, config.kdf)?;
    for entry in &args.archived_keys {
        keys.archive_hex(entry)?;
    }

    info!(
        root = %config.root.display(),
        primary = %config.primary,
        replicas = config.replication.replicas.len(),
        "Starting KEEPSAFE daemon"
    );
    let orchestrator = Arc::new(Orchestrator::open_system(config, Arc::new(keys))?);

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
        }
        shutdown.cancel();
    });

    orchestrator.run().await?;
    Ok(())
}
