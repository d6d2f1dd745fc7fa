//! Wiring of storage, indexes and processors from settings.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use searchsync_indexing::{
    CommitPolicyParams, CommitPolicyRegistry, IndexRouter, JsonDocumentBuilder, OrchestratorConfig,
    WorkOrchestrator,
};
use searchsync_massindexer::{MassIndexer, MonitorRegistry};
use searchsync_outbox::{
    DynamicShards, OutboxAdmin, OutboxEventProcessor, ProcessorConfig, ShardProvider,
    StaticShards,
};
use searchsync_search::{IndexBackend, TantivyBackend, TantivyBackendConfig};
use searchsync_storage::{EntitySource, MembershipRegistry, OutboxStore, Storage};
use searchsync_types::Settings;

/// Everything a running instance needs, built once from [`Settings`].
///
/// Must be created inside a tokio runtime: each index gets an orchestrator
/// whose dispatcher is spawned on construction.
pub struct SearchSyncContext {
    settings: Settings,
    storage: Arc<Storage>,
    router: Arc<IndexRouter>,
    processor: Arc<OutboxEventProcessor>,
    admin: OutboxAdmin,
}

/// Open the entity store at the configured path, creating parents.
pub fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    info!("Opening storage at {:?}", db_path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Storage::open(&db_path).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

/// Distinct index names the configured entity types write to.
pub fn configured_indexes(settings: &Settings) -> Vec<String> {
    let mut indexes: Vec<String> = settings
        .entity_types
        .iter()
        .map(|t| settings.index_for(t))
        .collect();
    indexes.sort_unstable();
    indexes.dedup();
    indexes
}

/// Commit parameters for every configured index.
///
/// Indexes served by the same backend instance share one in-flight counter,
/// so the `shared` policy sees every writer of that backend.
fn commit_params_per_index(
    settings: &Settings,
    backends: &BTreeMap<String, Arc<dyn IndexBackend>>,
) -> Result<BTreeMap<String, CommitPolicyParams>> {
    let commit_delay = Duration::from_millis(settings.orchestrator.commit_delay_ms);
    let mut counters: HashMap<*const (), Arc<AtomicUsize>> = HashMap::new();
    let mut params = BTreeMap::new();
    for index in configured_indexes(settings) {
        let backend = backends
            .get(&index)
            .with_context(|| format!("No backend for index {}", index))?;
        let shared_writers = counters
            .entry(Arc::as_ptr(backend) as *const ())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        params.insert(
            index,
            CommitPolicyParams {
                commit_delay,
                shared_writers: Arc::clone(shared_writers),
            },
        );
    }
    Ok(params)
}

impl SearchSyncContext {
    /// Open storage and one Tantivy index per configured index name.
    pub fn open(settings: Settings) -> Result<Self> {
        let storage = open_storage(&settings)?;

        let index_root = settings.expanded_index_path();
        fs::create_dir_all(&index_root).context("Failed to create index directory")?;

        let mut backends: BTreeMap<String, Arc<dyn IndexBackend>> = BTreeMap::new();
        for index in configured_indexes(&settings) {
            let config = TantivyBackendConfig::new(index.clone(), index_root.join(&index));
            let backend = TantivyBackend::open_or_create(config)
                .with_context(|| format!("Failed to open index {}", index))?;
            backends.insert(index, Arc::new(backend));
        }

        Self::with_backends(settings, storage, backends)
    }

    /// Build the context over already-open storage and backends.
    ///
    /// Every configured index must have a backend.
    pub fn with_backends(
        settings: Settings,
        storage: Arc<Storage>,
        backends: BTreeMap<String, Arc<dyn IndexBackend>>,
    ) -> Result<Self> {
        if settings.entity_types.is_empty() {
            anyhow::bail!("No entity types configured; set entity_types in the config file");
        }

        let registry = CommitPolicyRegistry::with_defaults();
        let orchestrator_config = OrchestratorConfig::from_settings(&settings.orchestrator);

        let commit_params = commit_params_per_index(&settings, &backends)?;
        let mut router = IndexRouter::new();
        for (index, params) in commit_params {
            let backend = backends
                .get(&index)
                .cloned()
                .with_context(|| format!("No backend for index {}", index))?;
            let policy = registry
                .resolve(&settings.orchestrator.commit_policy, &params)
                .context("Invalid commit policy")?;
            let orchestrator =
                WorkOrchestrator::start(index, backend, policy, orchestrator_config.clone());
            router.add_index(Arc::new(orchestrator));
        }
        for entity_type in &settings.entity_types {
            router.route(
                entity_type.clone(),
                settings.index_for(entity_type),
                Arc::new(JsonDocumentBuilder::new()),
            )?;
        }
        let router = Arc::new(router);

        let shards: Arc<dyn ShardProvider> = if settings.polling.dynamic_sharding {
            Arc::new(DynamicShards::new(
                Arc::clone(&storage) as Arc<dyn MembershipRegistry>,
                settings.instance_id.clone(),
                Duration::from_millis(settings.polling.member_timeout_ms),
            ))
        } else {
            Arc::new(StaticShards::from_settings(&settings.polling)?)
        };

        let processor = OutboxEventProcessor::new(
            ProcessorConfig::from_settings(&settings),
            Arc::clone(&storage) as Arc<dyn OutboxStore>,
            Arc::clone(&storage) as Arc<dyn EntitySource>,
            Arc::clone(&router),
            shards,
        );
        processor.set_enabled(settings.polling.enabled);

        let admin = OutboxAdmin::new(Arc::clone(&storage) as Arc<dyn OutboxStore>);

        info!(
            instance = %settings.instance_id,
            entity_types = settings.entity_types.len(),
            indexes = backends.len(),
            dynamic_sharding = settings.polling.dynamic_sharding,
            "Search-sync context ready"
        );

        Ok(Self {
            settings,
            storage,
            router,
            processor: Arc::new(processor),
            admin,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn router(&self) -> &Arc<IndexRouter> {
        &self.router
    }

    pub fn processor(&self) -> Arc<OutboxEventProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn admin(&self) -> &OutboxAdmin {
        &self.admin
    }

    /// Mass indexer over every configured entity type, with the monitor
    /// named in settings.
    pub fn mass_indexer(&self) -> Result<MassIndexer> {
        let key = &self.settings.mass_indexer.monitor;
        let monitor = MonitorRegistry::with_defaults()
            .resolve(key)
            .with_context(|| format!("Unknown mass indexing monitor {:?}", key))?;
        Ok(MassIndexer::new(
            Arc::clone(&self.storage) as Arc<dyn EntitySource>,
            Arc::clone(&self.router),
            self.settings.mass_indexer.clone(),
        )
        .with_monitor(monitor))
    }

    /// Drain and commit every index, then flush storage.
    pub async fn shutdown(&self) -> Result<()> {
        self.router
            .shutdown()
            .await
            .context("Failed to shut down orchestrators")?;
        self.storage.flush().context("Failed to flush storage")?;
        info!("Search-sync context shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsync_search::InMemoryBackend;
    use searchsync_types::{DocumentKey, EntityRecord};
    use serde_json::json;
    use tempfile::TempDir;

    fn test_settings(temp: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.db_path = temp.path().join("db").to_string_lossy().to_string();
        settings.index_path = temp.path().join("index").to_string_lossy().to_string();
        settings.entity_types = vec!["book".to_string(), "author".to_string()];
        settings
            .indexes
            .insert("author".to_string(), "library".to_string());
        settings
            .indexes
            .insert("book".to_string(), "library".to_string());
        settings.orchestrator.commit_policy = "per-changeset".to_string();
        settings
    }

    #[test]
    fn test_configured_indexes_are_distinct() {
        let temp = TempDir::new().unwrap();
        let mut settings = test_settings(&temp);
        settings.entity_types.push("review".to_string());
        assert_eq!(configured_indexes(&settings), vec!["library", "review"]);
    }

    #[tokio::test]
    async fn test_context_routes_types_to_shared_index() {
        let temp = TempDir::new().unwrap();
        let settings = test_settings(&temp);
        let storage = open_storage(&settings).unwrap();
        let backend = Arc::new(InMemoryBackend::new("library"));
        let mut backends: BTreeMap<String, Arc<dyn IndexBackend>> = BTreeMap::new();
        backends.insert("library".to_string(), backend.clone());

        let ctx = SearchSyncContext::with_backends(settings, storage, backends).unwrap();
        assert_eq!(ctx.router().entity_types(), vec!["author", "book"]);
        assert_eq!(ctx.router().index_for("book").unwrap(), "library");

        ctx.storage()
            .put_entity(&EntityRecord::new("book", "1", json!({"title": "Dune"})))
            .unwrap();
        let report = ctx.processor().run_once().await.unwrap();
        assert_eq!(report.completed, 1);

        ctx.shutdown().await.unwrap();
        let key = DocumentKey::new("1", None);
        assert!(backend.document(&key).is_some());
    }

    #[test]
    fn test_indexes_on_one_backend_share_writer_counter() {
        let temp = TempDir::new().unwrap();
        let mut settings = test_settings(&temp);
        settings.entity_types.push("review".to_string());
        settings.entity_types.push("film".to_string());

        let library: Arc<dyn IndexBackend> = Arc::new(InMemoryBackend::new("library"));
        let mut backends: BTreeMap<String, Arc<dyn IndexBackend>> = BTreeMap::new();
        backends.insert("library".to_string(), Arc::clone(&library));
        backends.insert("review".to_string(), library);
        backends.insert("film".to_string(), Arc::new(InMemoryBackend::new("film")));

        let params = commit_params_per_index(&settings, &backends).unwrap();
        assert!(Arc::ptr_eq(
            &params["library"].shared_writers,
            &params["review"].shared_writers
        ));
        assert!(!Arc::ptr_eq(
            &params["library"].shared_writers,
            &params["film"].shared_writers
        ));
    }

    #[tokio::test]
    async fn test_context_requires_backend_per_index() {
        let temp = TempDir::new().unwrap();
        let settings = test_settings(&temp);
        let storage = open_storage(&settings).unwrap();
        let result = SearchSyncContext::with_backends(settings, storage, BTreeMap::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_context_rejects_empty_entity_types() {
        let temp = TempDir::new().unwrap();
        let mut settings = test_settings(&temp);
        settings.entity_types.clear();
        let storage = open_storage(&settings).unwrap();
        let result = SearchSyncContext::with_backends(settings, storage, BTreeMap::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_context_opens_tantivy_indexes() {
        let temp = TempDir::new().unwrap();
        let settings = test_settings(&temp);
        let ctx = SearchSyncContext::open(settings).unwrap();
        assert!(temp.path().join("index").join("library").exists());
        assert!(ctx.mass_indexer().is_ok());
        ctx.shutdown().await.unwrap();
    }
}
