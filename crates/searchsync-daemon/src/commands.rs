//! CLI command implementations.
//!
//! Handles:
//! - start: run the outbox processor until SIGINT/SIGTERM
//! - mass-index: rebuild indexes, checkpointing cancelled runs
//! - admin: statistics and aborted event recovery
//! - ingest: entity writes that record outbox events

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use searchsync_massindexer::MassIndexingReport;
use searchsync_outbox::OutboxAdmin;
use searchsync_storage::{OutboxStore, Storage};
use searchsync_types::{EntityRecord, Settings};

use crate::cli::{AbortedCommands, AdminCommands, IngestCommands};
use crate::context::{open_storage, SearchSyncContext};

/// Checkpoint name under which a cancelled mass indexing run leaves its
/// per-type cursor.
pub const MASS_INDEX_CHECKPOINT: &str = "mass-index";

/// CLI flags that override loaded settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub db_path: Option<String>,
    pub index_path: Option<String>,
    pub log_level: Option<String>,
    pub instance_id: Option<String>,
}

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(config_path: Option<&str>, overrides: &SettingsOverrides) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;

    if let Some(db_path) = &overrides.db_path {
        settings.db_path = db_path.clone();
    }
    if let Some(index_path) = &overrides.index_path {
        settings.index_path = index_path.clone();
    }
    if let Some(log_level) = &overrides.log_level {
        settings.log_level = log_level.clone();
    }
    if let Some(instance_id) = &overrides.instance_id {
        settings.instance_id = instance_id.clone();
    }

    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Start the daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open storage and indexes
/// 3. Run the outbox processor
/// 4. On SIGINT/SIGTERM stop polling, drain orchestrators, commit
pub async fn start_daemon(config_path: Option<&str>, overrides: SettingsOverrides) -> Result<()> {
    let settings = load_settings(config_path, &overrides)?;
    init_logging(&settings.log_level)?;

    info!("Search-sync daemon starting...");
    info!("Configuration:");
    info!("  Instance: {}", settings.instance_id);
    info!("  Database path: {}", settings.db_path);
    info!("  Index path: {}", settings.index_path);
    info!("  Entity types: {}", settings.entity_types.join(", "));
    info!("  Log level: {}", settings.log_level);

    if !settings.polling.enabled {
        warn!("Outbox polling is disabled; changes will queue until it is enabled");
    }

    let ctx = SearchSyncContext::open(settings)?;
    let cancel = CancellationToken::new();

    let processor = ctx.processor();
    let token = cancel.clone();
    let worker = tokio::spawn(async move { processor.run(token).await });

    shutdown_signal().await;
    cancel.cancel();

    let run_result = match worker.await {
        Ok(result) => result.context("Outbox processor failed"),
        Err(e) => Err(anyhow::anyhow!("Outbox processor task failed: {}", e)),
    };
    ctx.shutdown().await?;
    run_result?;

    info!("Search-sync daemon stopped");
    Ok(())
}

/// Read the cursor left by a cancelled run.
pub fn load_resume_cursor(storage: &Storage) -> Result<BTreeMap<String, String>> {
    match storage
        .get_checkpoint(MASS_INDEX_CHECKPOINT)
        .context("Failed to read mass indexing checkpoint")?
    {
        Some(bytes) => {
            serde_json::from_slice(&bytes).context("Corrupt mass indexing checkpoint")
        }
        None => Ok(BTreeMap::new()),
    }
}

/// Persist the cursor of a cancelled run, or drop it after a complete one.
pub fn record_mass_index_outcome(storage: &Storage, report: &MassIndexingReport) -> Result<()> {
    if report.cancelled {
        let cursor = report.resume_cursor();
        let bytes = serde_json::to_vec(&cursor).context("Failed to encode checkpoint")?;
        storage
            .put_checkpoint(MASS_INDEX_CHECKPOINT, &bytes)
            .context("Failed to save mass indexing checkpoint")?;
        info!(types = cursor.len(), "Saved mass indexing checkpoint");
    } else {
        storage
            .delete_checkpoint(MASS_INDEX_CHECKPOINT)
            .context("Failed to clear mass indexing checkpoint")?;
    }
    Ok(())
}

/// Rebuild indexes from the entity store.
///
/// Ctrl+C cancels the run; the cursor is checkpointed so `--resume` can
/// continue where it stopped. A resumed run never purges.
pub async fn run_mass_index(
    config_path: Option<&str>,
    overrides: SettingsOverrides,
    types: Vec<String>,
    resume: bool,
    no_purge: bool,
) -> Result<MassIndexingReport> {
    let mut settings = load_settings(config_path, &overrides)?;
    init_logging(&settings.log_level)?;

    let cursor = if resume {
        let storage = open_storage(&settings)?;
        let cursor = load_resume_cursor(&storage)?;
        drop(storage);
        cursor
    } else {
        BTreeMap::new()
    };
    if no_purge || !cursor.is_empty() {
        settings.mass_indexer.purge_at_start = false;
    }

    let ctx = SearchSyncContext::open(settings)?;
    let mut indexer = ctx.mass_indexer()?;
    if !types.is_empty() {
        indexer = indexer.entity_types(types);
    }
    if !cursor.is_empty() {
        info!(types = cursor.len(), "Resuming mass indexing from checkpoint");
        indexer = indexer.resume_after(cursor);
    }

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    let outcome = indexer.start(cancel).await;
    watcher.abort();

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            ctx.shutdown().await?;
            return Err(e).context("Mass indexing failed");
        }
    };
    record_mass_index_outcome(ctx.storage(), &report)?;
    ctx.shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to encode report")?
    );
    Ok(report)
}

/// Handle admin commands.
pub fn handle_admin(
    config_path: Option<&str>,
    overrides: SettingsOverrides,
    command: AdminCommands,
) -> Result<()> {
    let settings = load_settings(config_path, &overrides)?;
    let storage = open_storage(&settings)?;
    let output = run_admin(storage, command)?;
    println!("{}", output);
    Ok(())
}

/// Execute an admin command against open storage, returning what to print.
pub fn run_admin(storage: Arc<Storage>, command: AdminCommands) -> Result<String> {
    let admin = OutboxAdmin::new(Arc::clone(&storage) as Arc<dyn OutboxStore>);

    match command {
        AdminCommands::Stats => {
            let stats = storage.get_stats().context("Failed to read statistics")?;
            Ok(format!(
                "Entities:          {}\n\
                 Pending events:    {}\n\
                 Processing events: {}\n\
                 Aborted events:    {}\n\
                 Known instances:   {}",
                stats.entity_count,
                stats.pending_events,
                stats.processing_events,
                stats.aborted_events,
                stats.member_count
            ))
        }
        AdminCommands::Compact => {
            storage.compact().context("Failed to compact storage")?;
            Ok("Compaction complete".to_string())
        }
        AdminCommands::Event { id } => match admin.get_event(id)? {
            Some(event) => {
                serde_json::to_string_pretty(&event).context("Failed to encode event")
            }
            None => Ok(format!("Event {} not found", id)),
        },
        AdminCommands::Aborted { command } => match command {
            AbortedCommands::Count { tenant } => {
                let count = admin.count_aborted_events(tenant.as_deref())?;
                Ok(format!("{}", count))
            }
            AbortedCommands::Reprocess { tenant } => {
                let count = admin.reprocess_aborted_events(tenant.as_deref())?;
                Ok(format!("Returned {} aborted events to pending", count))
            }
            AbortedCommands::Clear { tenant } => {
                let count = admin.clear_aborted_events(tenant.as_deref())?;
                Ok(format!("Deleted {} aborted events", count))
            }
        },
    }
}

/// Handle ingest commands.
pub fn handle_ingest(
    config_path: Option<&str>,
    overrides: SettingsOverrides,
    command: IngestCommands,
) -> Result<()> {
    let settings = load_settings(config_path, &overrides)?;
    let storage = open_storage(&settings)?;
    let output = run_ingest(&storage, command)?;
    println!("{}", output);
    Ok(())
}

/// Execute an ingest command, returning what to print.
pub fn run_ingest(storage: &Storage, command: IngestCommands) -> Result<String> {
    match command {
        IngestCommands::Put {
            entity,
            id,
            data,
            routing,
            tenant,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("Entity data is not valid JSON")?;
            if !data.is_object() {
                anyhow::bail!("Entity data must be a JSON object");
            }
            let mut record = EntityRecord::new(entity, id, data);
            if let Some(routing) = routing {
                record = record.with_routing_key(routing);
            }
            if let Some(tenant) = tenant {
                record = record.with_tenant(tenant);
            }
            let event = storage.put_entity(&record).context("Failed to write entity")?;
            Ok(format!("Recorded outbox event {}", event.id))
        }
        IngestCommands::Delete { entity, id } => {
            let event = storage
                .delete_entity(&entity, &id)
                .context("Failed to delete entity")?;
            Ok(format!("Recorded outbox event {}", event.id))
        }
    }
}
