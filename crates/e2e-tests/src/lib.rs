//! End-to-end test infrastructure for search-sync.
//!
//! Provides a shared TestHarness and helper functions for E2E tests
//! covering the full entity-write to index pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use searchsync_indexing::{
    IndexRouter, JsonDocumentBuilder, OrchestratorConfig, PerChangesetCommit, WorkOrchestrator,
};
use searchsync_outbox::{OutboxEventProcessor, ProcessorConfig, RetryPolicy, StaticShards};
use searchsync_search::{IndexBackend, InMemoryBackend};
use searchsync_storage::{EntitySource, OutboxStore, Storage};
use searchsync_types::{EntityRecord, ShardAssignment};

/// Index every harness entity type is routed to.
pub const INDEX: &str = "library";

/// Shared test harness for E2E tests.
///
/// Storage in a temp directory, one in-memory backend, and a router that
/// sends `book` and `author` entities to it.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub backend: Arc<InMemoryBackend>,
    pub router: Arc<IndexRouter>,
}

impl TestHarness {
    /// Harness over a plain in-memory backend.
    pub fn new() -> Self {
        Self::with_backend(InMemoryBackend::new(INDEX), fast_orchestrator())
    }

    /// Harness over the given backend and orchestrator configuration.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_backend(backend: InMemoryBackend, config: OrchestratorConfig) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let storage =
            Arc::new(Storage::open(temp_dir.path()).expect("Failed to open test storage"));
        let backend = Arc::new(backend);
        let router = router_over(Arc::clone(&backend) as Arc<dyn IndexBackend>, config);

        Self {
            _temp_dir: temp_dir,
            storage,
            backend,
            router,
        }
    }

    /// Processor owning every shard.
    pub fn processor(&self, instance: &str, retry: RetryPolicy) -> OutboxEventProcessor {
        self.processor_for_shards(instance, retry, ShardAssignment::single())
    }

    pub fn processor_for_shards(
        &self,
        instance: &str,
        retry: RetryPolicy,
        shards: ShardAssignment,
    ) -> OutboxEventProcessor {
        let config = ProcessorConfig {
            instance_id: instance.to_string(),
            poll_interval: Duration::from_millis(5),
            batch_size: 25,
            claim_timeout: Duration::from_secs(300),
            retry,
            max_idle_backoff: Duration::from_millis(50),
        };
        OutboxEventProcessor::new(
            config,
            Arc::clone(&self.storage) as Arc<dyn OutboxStore>,
            Arc::clone(&self.storage) as Arc<dyn EntitySource>,
            Arc::clone(&self.router),
            Arc::new(StaticShards::new(shards)),
        )
    }
}

/// Router with `book` and `author` both indexed into [`INDEX`].
pub fn router_over(backend: Arc<dyn IndexBackend>, config: OrchestratorConfig) -> Arc<IndexRouter> {
    let orchestrator = WorkOrchestrator::start(INDEX, backend, Arc::new(PerChangesetCommit), config);
    let mut router = IndexRouter::new();
    router.add_index(Arc::new(orchestrator));
    for entity_type in ["book", "author"] {
        router
            .route(entity_type, INDEX, Arc::new(JsonDocumentBuilder::new()))
            .expect("Failed to route entity type");
    }
    Arc::new(router)
}

/// Orchestrator settings that keep tests quick.
pub fn fast_orchestrator() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_batch_window(Duration::from_millis(1))
        .with_max_batch_size(16)
        .with_parallelism(4)
}

/// Retry policy with no delay between attempts.
pub fn immediate_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::ZERO,
        multiplier: 2.0,
        max_delay: Duration::ZERO,
    }
}

pub fn book(id: &str, title: &str) -> EntityRecord {
    EntityRecord::new("book", id, json!({ "title": title }))
}

/// Zero-padded id so lexical and numeric order agree.
pub fn padded_id(n: usize) -> String {
    format!("{:05}", n)
}

/// Write `count` books without recording outbox events.
pub fn seed_books(storage: &Storage, count: usize) {
    for n in 0..count {
        let id = padded_id(n);
        storage
            .put_entity_silently(&book(&id, &format!("Book {}", n)))
            .expect("Failed to seed book");
    }
}
