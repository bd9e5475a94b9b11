//! Snapshot Agent - Main entry point
//!
//! Manual backup operations plus a daemon mode running the automatic loop.

use anyhow::Result;
use clap::{Parser, Subcommand};
use snapshot_agent::codec::encrypt::EncryptionKey;
use snapshot_agent::daemon::shutdown::ShutdownCoordinator;
use snapshot_agent::engine::record::CreateRequest;
use snapshot_agent::retention::RetentionPolicy;
use snapshot_agent::scheduler::AutoBackupScheduler;
use snapshot_agent::utils::{self, format_bytes};
use snapshot_agent::{BackupEngine, Config, RestoreOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot the configured sources
    Create {
        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long = "tag")]
        tags: Vec<String>,

        #[arg(short, long)]
        name: Option<String>,
    },

    /// List committed backups, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check a backup against its manifest
    Verify { id: String },

    /// Replace live data with a backup
    Restore {
        id: String,

        /// Skip manifest verification
        #[arg(long)]
        no_verify: bool,

        /// Restore under this directory instead of the data root
        #[arg(long, value_name = "DIR")]
        target: Option<PathBuf>,
    },

    /// Delete a backup
    Delete { id: String },

    /// Print a new encryption key for `backup.encryption.key`
    Keygen,

    /// Print the effective configuration
    ShowConfig,

    /// Run the automatic backup loop until SIGINT/SIGTERM
    Run {
        /// Label attached to automatic backups (e.g. the job being protected)
        #[arg(long)]
        label: Option<String>,

        /// Take a backup before starting the loop
        #[arg(long)]
        pre_backup: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Key generation needs no configuration
    if let Command::Keygen = args.command {
        print_new_key();
        return Ok(());
    }

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("snapshot-agent v{}", env!("CARGO_PKG_VERSION"));

    let engine = BackupEngine::from_config(&config)?;

    match args.command {
        Command::Create {
            description,
            tags,
            name,
        } => {
            let record = engine.create(CreateRequest {
                description,
                tags,
                name,
            })?;
            println!("{}", record.id);
        }
        Command::List { json } => {
            let records = engine.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in records {
                    println!(
                        "{}  {}  {:>10}  {}  [{}]",
                        record.id,
                        record.created_at.format("%Y-%m-%d %H:%M:%S"),
                        format_bytes(record.size_bytes),
                        record.description,
                        record.tags.join(", ")
                    );
                }
            }
        }
        Command::Verify { id } => {
            let report = engine.verify_backup_integrity(&id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                anyhow::bail!("backup {} failed verification", id);
            }
        }
        Command::Restore {
            id,
            no_verify,
            target,
        } => {
            let result = engine.restore(
                &id,
                RestoreOptions {
                    verify_integrity: !no_verify,
                    target_root: target,
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Delete { id } => {
            let record = engine.delete(&id)?;
            println!("Deleted {}", record.id);
        }
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
        }
        Command::Run { label, pre_backup } => run(engine, &config, label, pre_backup).await?,
        Command::Keygen => print_new_key(),
    }

    Ok(())
}

fn print_new_key() {
    println!("{}", EncryptionKey::generate().to_base64());
    eprintln!("Store this key safely: encrypted backups cannot be restored without it.");
}

async fn run(engine: BackupEngine, config: &Config, label: Option<String>, pre_backup: bool) -> Result<()> {
    tracing::info!(
        "Starting snapshot-agent v{} (backup root: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.root_dir.display()
    );

    let retention = RetentionPolicy::new(config.retention_budget()?);
    let shutdown_coordinator = ShutdownCoordinator::new();
    let scheduler = AutoBackupScheduler::new(Arc::new(engine), retention, config.scheduler_settings())
        .with_shutdown(shutdown_coordinator.token());

    if pre_backup {
        tokio::task::block_in_place(|| scheduler.create_pre_training_backup(label.as_deref()))?;
    }

    scheduler.start_periodic(label).await;

    let halted = tokio::select! {
        result = shutdown_coordinator.wait_for_signal() => {
            result?;
            false
        }
        _ = wait_for_halt(&scheduler) => true,
    };

    scheduler.stop_periodic().await;
    shutdown_coordinator.shutdown().await;

    if halted {
        anyhow::bail!("automatic backup loop halted after repeated failures");
    }
    Ok(())
}

async fn wait_for_halt(scheduler: &AutoBackupScheduler<BackupEngine>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        if scheduler.state().halted {
            return;
        }
    }
}
