//! Search-sync daemon
//!
//! Keeps search indexes in sync with an entity store through a
//! transactional outbox.
//!
//! # Usage
//!
//! ```bash
//! searchsync start [--db-path PATH] [--index-path PATH] [--instance-id ID]
//! searchsync mass-index [--type TYPE]... [--resume] [--no-purge]
//! searchsync admin stats
//! searchsync admin aborted count|reprocess|clear [--tenant TENANT]
//! searchsync ingest put TYPE ID JSON [--routing KEY] [--tenant TENANT]
//! searchsync ingest delete TYPE ID
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/search-sync/config.toml)
//! 3. Environment variables (SEARCHSYNC_*, nested keys joined by `__`)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use searchsync_daemon::{
    handle_admin, handle_ingest, run_mass_index, start_daemon, Cli, Commands, SettingsOverrides,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            db_path,
            index_path,
            instance_id,
        } => {
            let overrides = SettingsOverrides {
                db_path,
                index_path,
                log_level: cli.log_level,
                instance_id,
            };
            start_daemon(cli.config.as_deref(), overrides).await?;
        }
        Commands::MassIndex {
            db_path,
            index_path,
            types,
            resume,
            no_purge,
        } => {
            let overrides = SettingsOverrides {
                db_path,
                index_path,
                log_level: cli.log_level,
                instance_id: None,
            };
            let report =
                run_mass_index(cli.config.as_deref(), overrides, types, resume, no_purge).await?;
            if report.failures > 0 {
                eprintln!("{} entities failed to index", report.failures);
            }
        }
        Commands::Admin { db_path, command } => {
            let overrides = SettingsOverrides {
                db_path,
                log_level: cli.log_level,
                ..Default::default()
            };
            handle_admin(cli.config.as_deref(), overrides, command)?;
        }
        Commands::Ingest { db_path, command } => {
            let overrides = SettingsOverrides {
                db_path,
                log_level: cli.log_level,
                ..Default::default()
            };
            handle_ingest(cli.config.as_deref(), overrides, command)?;
        }
    }

    Ok(())
}
