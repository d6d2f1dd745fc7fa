//! Configuration loading for search-sync.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at `~/.config/search-sync/config.toml`.
//! Environment variables use the `SEARCHSYNC_` prefix and `__` between
//! nesting levels, e.g. `SEARCHSYNC_POLLING__BATCH_SIZE=100`.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::SyncError;

const APP_NAME: &str = "search-sync";

/// Outbox polling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Set to false to stop this instance from processing events
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum events read per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries after the first attempt before an event is aborted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Static sharding: total shard count
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Static sharding: shards owned by this instance
    #[serde(default = "default_shard_indexes")]
    pub shard_indexes: Vec<u32>,

    /// Derive shards from live cluster membership instead
    #[serde(default)]
    pub dynamic_sharding: bool,

    /// A member not seen for this long is considered gone
    #[serde(default = "default_member_timeout_ms")]
    pub member_timeout_ms: u64,

    /// A claim older than this is released back to pending
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    100
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    1_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_shard_count() -> u32 {
    1
}

fn default_shard_indexes() -> Vec<u32> {
    vec![0]
}

fn default_member_timeout_ms() -> u64 {
    30_000
}

fn default_claim_timeout_ms() -> u64 {
    300_000
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            shard_count: default_shard_count(),
            shard_indexes: default_shard_indexes(),
            dynamic_sharding: false,
            member_timeout_ms: default_member_timeout_ms(),
            claim_timeout_ms: default_claim_timeout_ms(),
        }
    }
}

impl PollingSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("polling.interval_ms must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("polling.batch_size must be > 0".to_string());
        }
        if self.retry_multiplier < 1.0 {
            return Err(format!(
                "polling.retry_multiplier must be >= 1.0, got {}",
                self.retry_multiplier
            ));
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            return Err("polling.retry_max_delay_ms must be >= retry_initial_delay_ms".to_string());
        }
        if !self.dynamic_sharding {
            if self.shard_count == 0 {
                return Err("polling.shard_count must be > 0".to_string());
            }
            if let Some(bad) = self.shard_indexes.iter().find(|s| **s >= self.shard_count) {
                return Err(format!(
                    "polling.shard_indexes contains {} but shard_count is {}",
                    bad, self.shard_count
                ));
            }
        }
        Ok(())
    }
}

/// Work orchestrator settings, shared by every index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Maximum queued Works before submitters are held back
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long to wait for more Works before dispatching a partial batch
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Concurrent backend bulk calls
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// One of `per-changeset`, `scheduled`, `shared`
    #[serde(default = "default_commit_policy")]
    pub commit_policy: String,

    /// Commit interval for the scheduled policy
    #[serde(default = "default_commit_delay_ms")]
    pub commit_delay_ms: u64,
}

fn default_queue_bound() -> usize {
    10_000
}

fn default_max_batch_size() -> usize {
    500
}

fn default_batch_window_ms() -> u64 {
    10
}

fn default_parallelism() -> usize {
    4
}

fn default_commit_policy() -> String {
    "per-changeset".to_string()
}

fn default_commit_delay_ms() -> u64 {
    1_000
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            queue_bound: default_queue_bound(),
            max_batch_size: default_max_batch_size(),
            batch_window_ms: default_batch_window_ms(),
            parallelism: default_parallelism(),
            commit_policy: default_commit_policy(),
            commit_delay_ms: default_commit_delay_ms(),
        }
    }
}

impl OrchestratorSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_bound == 0 {
            return Err("orchestrator.queue_bound must be > 0".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("orchestrator.max_batch_size must be > 0".to_string());
        }
        if self.parallelism == 0 {
            return Err("orchestrator.parallelism must be > 0".to_string());
        }
        if self.commit_policy == "scheduled" && self.commit_delay_ms == 0 {
            return Err("orchestrator.commit_delay_ms must be > 0 for scheduled commits".to_string());
        }
        Ok(())
    }
}

/// Mass indexer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassIndexerSettings {
    #[serde(default = "default_threads_to_load_objects")]
    pub threads_to_load_objects: usize,

    #[serde(default = "default_threads_to_build_documents")]
    pub threads_to_build_documents: usize,

    #[serde(default = "default_batch_size_to_load_objects")]
    pub batch_size_to_load_objects: usize,

    #[serde(default = "default_id_fetch_size")]
    pub id_fetch_size: usize,

    #[serde(default = "default_true")]
    pub purge_at_start: bool,

    #[serde(default = "default_true")]
    pub optimize_on_finish: bool,

    #[serde(default = "default_true")]
    pub optimize_after_purge: bool,

    /// Abort once more entities than this have failed; unset never aborts
    #[serde(default)]
    pub failure_threshold: Option<u64>,

    /// Monitor key: `logging` or `noop`
    #[serde(default = "default_monitor")]
    pub monitor: String,
}

fn default_threads_to_load_objects() -> usize {
    4
}

fn default_threads_to_build_documents() -> usize {
    2
}

fn default_batch_size_to_load_objects() -> usize {
    100
}

fn default_id_fetch_size() -> usize {
    1_000
}

fn default_monitor() -> String {
    "logging".to_string()
}

impl Default for MassIndexerSettings {
    fn default() -> Self {
        Self {
            threads_to_load_objects: default_threads_to_load_objects(),
            threads_to_build_documents: default_threads_to_build_documents(),
            batch_size_to_load_objects: default_batch_size_to_load_objects(),
            id_fetch_size: default_id_fetch_size(),
            purge_at_start: true,
            optimize_on_finish: true,
            optimize_after_purge: true,
            failure_threshold: None,
            monitor: default_monitor(),
        }
    }
}

impl MassIndexerSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.threads_to_load_objects == 0 {
            return Err("mass_indexer.threads_to_load_objects must be > 0".to_string());
        }
        if self.threads_to_build_documents == 0 {
            return Err("mass_indexer.threads_to_build_documents must be > 0".to_string());
        }
        if self.batch_size_to_load_objects == 0 {
            return Err("mass_indexer.batch_size_to_load_objects must be > 0".to_string());
        }
        if self.id_fetch_size == 0 {
            return Err("mass_indexer.id_fetch_size must be > 0".to_string());
        }
        Ok(())
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the Tantivy index root; each index gets a subdirectory
    #[serde(default = "default_index_path")]
    pub index_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of this instance in the processing cluster
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Entity types this deployment indexes
    #[serde(default = "default_entity_types")]
    pub entity_types: Vec<String>,

    /// Entity type -> index name; unmapped types index under their own name
    #[serde(default)]
    pub indexes: HashMap<String, String>,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub mass_indexer: MassIndexerSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_index_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("index"))
        .unwrap_or_else(|| PathBuf::from("./index"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_instance_id() -> String {
    format!("instance-{}", ulid::Ulid::new())
}

fn default_entity_types() -> Vec<String> {
    Vec::new()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index_path: default_index_path(),
            log_level: default_log_level(),
            instance_id: default_instance_id(),
            entity_types: default_entity_types(),
            indexes: HashMap::new(),
            polling: PollingSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            mass_indexer: MassIndexerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from all sources.
    ///
    /// Precedence (lowest to highest):
    /// 1. Built-in defaults
    /// 2. `~/.config/search-sync/config.toml`
    /// 3. CLI-specified config file
    /// 4. Environment variables (SEARCHSYNC_*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, SyncError> {
        let config_dir = ProjectDirs::from("", "", APP_NAME)
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| SyncError::Config(e.to_string()))?
            .set_default("index_path", default_index_path())
            .map_err(|e| SyncError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| SyncError::Config(e.to_string()))?
            .set_default("instance_id", default_instance_id())
            .map_err(|e| SyncError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SEARCHSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.instance_id.trim().is_empty() {
            return Err(SyncError::Config("instance_id must not be empty".to_string()));
        }
        self.polling.validate().map_err(SyncError::Config)?;
        self.orchestrator.validate().map_err(SyncError::Config)?;
        self.mass_indexer.validate().map_err(SyncError::Config)?;
        Ok(())
    }

    /// Index name an entity type is written to.
    pub fn index_for(&self, entity_type: &str) -> String {
        self.indexes
            .get(entity_type)
            .cloned()
            .unwrap_or_else(|| entity_type.to_string())
    }

    /// Expand ~ in db_path to actual home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    /// Expand ~ in index_path to actual home directory
    pub fn expanded_index_path(&self) -> PathBuf {
        expand_home(&self.index_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
