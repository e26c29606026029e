//! KEEPSAFE CLI
//!
//! One-shot operator commands against a local orchestrator root: manual
//! backups, restores, drills, pruning, failover, key rotation, session tokens
//! and field encryption.

use anyhow::bail;
use clap::{Parser, Subcommand};
use keepsafe::backup::ComponentKind;
use keepsafe::crypto::{lifetime_minutes, parse_master_hex, Record};
use keepsafe::restore::ComponentSelection;
use keepsafe::{
    BackupKind, BackupLevel, FailoverRequest, KeyManager, Orchestrator, OrchestratorConfig, Purpose, RestoreRequest,
};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// KEEPSAFE CLI - Disaster Recovery Operations
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Orchestrator root directory (overrides the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Master secret as 64 hex characters
    #[arg(long, env = "KEEPSAFE_MASTER_KEY", hide_env_values = true)]
    master_key: String,

    /// Version number of the master secret
    #[arg(long, env = "KEEPSAFE_KEY_VERSION", default_value_t = 1)]
    key_version: u32,

    /// Older master secrets as VERSION:HEX, comma separated
    #[arg(long, env = "KEEPSAFE_ARCHIVED_KEYS", value_delimiter = ',', hide_env_values = true)]
    archived_keys: Vec<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a backup now
    Backup {
        #[arg(long, default_value = "full")]
        kind: BackupKind,
        #[arg(long, default_value = "daily")]
        level: BackupLevel,
    },
    /// Restore a completed backup over the live store
    Restore {
        backup_id: Uuid,
        /// Restore only this component (database, files or config)
        #[arg(long)]
        only: Option<String>,
    },
    /// Verify a backup is restorable without touching the live store
    Drill { backup_id: Uuid },
    /// Delete backups older than their level's retention window
    Prune {
        #[arg(long)]
        level: Option<BackupLevel>,
    },
    /// Poll every replica once and print its status
    Replicas,
    /// Promote a replica to primary
    Failover {
        target: String,
        #[arg(long, default_value = "manual failover")]
        reason: String,
    },
    /// Replace the master secret and print the new one
    RotateKeys,
    /// Issue or verify session tokens
    Token {
        #[command(subcommand)]
        action: TokenCmd,
    },
    /// Encrypt the sensitive fields of a JSON record read from stdin
    EncryptFields {
        #[arg(long, default_value = "pii")]
        purpose: Purpose,
    },
    /// Decrypt a JSON record read from stdin; unreadable fields show a marker
    DecryptFields {
        #[arg(long, default_value = "pii")]
        purpose: Purpose,
    },
    /// Show latest backups, replica health and recent failovers
    Status,
}

#[derive(Subcommand, Debug)]
enum TokenCmd {
    Issue {
        subject: String,
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
    Verify { token: String },
}

fn parse_component(name: &str) -> anyhow::Result<ComponentKind> {
    match ComponentKind::ALL.iter().find(|k| k.as_str() == name) {
        Some(kind) => Ok(*kind),
        None => bail!("unknown component '{}': expected database, files or config", name),
    }
}

fn read_record() -> anyhow::Result<Record> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(serde_json::from_str(&input)?)
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("keepsafe=info".parse()?))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::new("/var/lib/keepsafe"),
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    let keys = KeyManager::with_version(parse_master_hex(&args.master_key)?, args.key_version, config.kdf)?;
    for entry in &args.archived_keys {
        keys.archive_hex(entry)?;
    }
    let orch = Orchestrator::open_system(config, Arc::new(keys))?;

    match args.command {
        Cmd::Backup { kind, level } => {
            let record = orch.backup(kind, level)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Cmd::Restore { backup_id, only } => {
            let mut request = RestoreRequest::new(backup_id);
            if let Some(name) = only {
                request = request.with_components(ComponentSelection::only(parse_component(&name)?));
            }
            let report = orch.restore(&request)?;
            println!(
                "restored {} ({:?}) in {:.1}s; restore point {}",
                report.backup_id,
                report.applied,
                report.duration.as_secs_f64(),
                report.snapshot_id
            );
            if let Some(base) = report.base_backup_id {
                println!("file store laid over base backup {}", base);
            }
        }
        Cmd::Drill { backup_id } => {
            let test = orch.drill(backup_id)?;
            println!("{}", serde_json::to_string_pretty(&test)?);
            if !test.success {
                bail!("recovery drill failed");
            }
        }
        Cmd::Prune { level } => {
            for (level, report) in orch.prune(level)? {
                println!(
                    "{:<8} deleted {} protected {} freed {} bytes",
                    level.as_str(),
                    report.deleted.len(),
                    report.protected.len(),
                    report.freed_bytes
                );
            }
        }
        Cmd::Replicas => {
            for status in orch.poll_replicas() {
                println!("{}", serde_json::to_string(&status)?);
            }
        }
        Cmd::Failover { target, reason } => {
            let event = orch.failover(&FailoverRequest::manual(target, reason))?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            if !event.success {
                bail!("failover did not complete");
            }
        }
        Cmd::RotateKeys => {
            let rotation = orch.rotate_keys()?;
            println!("previous version {} ({})", rotation.previous.version, rotation.previous.master_fingerprint);
            println!("current version  {} ({})", rotation.current.version, rotation.current.master_fingerprint);
            println!("new master key:  {}", hex::encode(&rotation.new_master[..]));
            println!("keep the previous key as KEEPSAFE_ARCHIVED_KEYS={}:<old hex>", rotation.previous.version);
        }
        Cmd::Token { action } => match action {
            TokenCmd::Issue { subject, ttl_minutes } => {
                println!("{}", orch.issue_token(&subject, lifetime_minutes(ttl_minutes)?)?);
            }
            TokenCmd::Verify { token } => {
                let claims = orch.verify_token(&token)?;
                println!("{}", serde_json::to_string_pretty(&claims)?);
            }
        },
        Cmd::EncryptFields { purpose } => {
            let record = orch.cipher().encrypt_fields(&read_record()?, purpose)?;
            println!("{}", serde_json::to_string(&record)?);
        }
        Cmd::DecryptFields { purpose } => {
            let record = orch.cipher().decrypt_fields(&read_record()?, purpose);
            println!("{}", serde_json::to_string(&record)?);
        }
        Cmd::Status => {
            print!("{}", orch.status());
            println!("{}", orch.metrics().summary());
        }
    }

    Ok(())
}
