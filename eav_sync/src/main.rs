//! eav_sync CLI
//!
//! # Commands
//!
//! - `schema:sync` - Synchronize the schema of an entity type with its configuration
//! - `schema:analyze` - Print the drift report of an entity type
//! - `schema:restore` - Restore or verify a pre-sync backup

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use eav_sync::config;
use eav_sync::schema::diff::ReportStatus;
use eav_sync::sync::{BackupType, RestoreOptions, SyncStrategy};
use eav_sync::utils::logging::init_logging;
use eav_sync::EavSyncClient;

/// EAV schema synchronization tools.
#[derive(Parser)]
#[command(name = "eav_sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(global = true, short, long, default_value = "eav_sync.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize the schema of an entity type
    #[command(name = "schema:sync")]
    Sync {
        /// Entity type code
        entity_type: String,

        /// additive or full; defaults to the configured strategy
        #[arg(long)]
        strategy: Option<SyncStrategy>,

        /// Report planned changes without touching the database
        #[arg(long)]
        dry_run: bool,

        /// Allow destructive changes under the full strategy
        #[arg(long)]
        force: bool,

        /// Skip the pre-sync backup
        #[arg(long)]
        no_backup: bool,

        /// What the pre-sync backup captures (schema, data, full)
        #[arg(long, default_value = "full")]
        backup_type: BackupType,

        /// Abort when the whole sync takes longer than this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the drift report of an entity type
    #[command(name = "schema:analyze")]
    Analyze {
        /// Entity type code
        entity_type: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Restore a backup created by schema:sync
    #[command(name = "schema:restore")]
    Restore {
        /// Backup id
        backup_id: i64,

        /// Check that the backup can be restored without changing anything
        #[arg(long)]
        verify_only: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Returns whether the command succeeded
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    init_logging(&config.logging)?;

    let client = EavSyncClient::new(config)
        .await
        .context("Failed to connect to the database")?;

    match cli.command {
        Commands::Sync {
            entity_type,
            strategy,
            dry_run,
            force,
            no_backup,
            backup_type,
            timeout,
        } => {
            let mut options = client.default_sync_options()?;
            if let Some(strategy) = strategy {
                options.strategy = strategy;
            }
            options.dry_run = dry_run;
            options.force = force;
            options.backup_type = backup_type;
            if no_backup {
                options.auto_backup = false;
            }

            println!("Synchronizing '{}'", entity_type);
            println!(
                "Options: strategy={} dry_run={} force={} auto_backup={}",
                options.strategy, options.dry_run, options.force, options.auto_backup
            );

            let sync = client.sync(&entity_type, &options);
            let result = match timeout {
                Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), sync)
                    .await
                    .with_context(|| {
                        format!(
                            "Sync of '{}' timed out after {}s; the database keeps the steps completed so far",
                            entity_type, seconds
                        )
                    })?,
                None => sync.await,
            };

            print!("{}", result);
            Ok(result.success)
        }
        Commands::Analyze { entity_type, format } => {
            let report = client.analyze(&entity_type).await?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
            Ok(report.status != ReportStatus::Critical)
        }
        Commands::Restore {
            backup_id,
            verify_only,
        } => {
            let result = client
                .restore(backup_id, &RestoreOptions { verify_only })
                .await;
            print!("{}", result);
            Ok(result.success)
        }
    }
}
