//! Mass indexer: rebuilds indexes from the system of record.
//!
//! The run is a three-stage pipeline joined by bounded channels:
//!
//! 1. one id producer per entity type pages through every id;
//! 2. `threads_to_load_objects` loaders fetch entities in batches;
//! 3. `threads_to_build_documents` builders turn them into documents and
//!    submit them through the index orchestrators.
//!
//! Around the pipeline runs the lifecycle bracket: an optional purge (and
//! optimize) of every index involved before, and an optional optimize
//! followed by commit and refresh after.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use futures::TryStreamExt;
use searchsync_indexing::{IndexRouter, IndexingPlan, WorkOrchestrator};
use searchsync_storage::{stream_all_ids, EntitySource};
use searchsync_types::{DocumentKey, EntityRecord, MassIndexerSettings};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::MassIndexerError;
use crate::monitor::{MassIndexingMonitor, NoOpMonitor};
use crate::report::{EntityFailure, FailureStage, MassIndexingReport, TypeProgress};

/// Ids of one entity type handed to a loader.
struct IdBatch {
    entity_type: String,
    ids: Vec<String>,
}

/// State shared by every task of one run.
struct RunState {
    monitor: Arc<dyn MassIndexingMonitor>,
    progress: Mutex<BTreeMap<String, TypeProgress>>,
    failures: AtomicU64,
    threshold: Option<u64>,
    tripped: AtomicBool,
    /// Stops producers; fired by the caller's token or the threshold
    stop: CancellationToken,
}

impl RunState {
    fn update(&self, entity_type: &str, f: impl FnOnce(&mut TypeProgress)) {
        let mut progress = match self.progress.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(progress.entry(entity_type.to_string()).or_default());
    }

    fn fail(&self, failure: EntityFailure) {
        self.monitor.entity_failed(&failure);
        self.update(&failure.entity_type, |p| p.failures += 1);
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(threshold) = self.threshold {
            if failures > threshold && !self.tripped.swap(true, Ordering::SeqCst) {
                error!(failures, threshold, "Failure threshold exceeded, stopping");
                self.stop.cancel();
            }
        }
    }

    fn snapshot(&self) -> BTreeMap<String, TypeProgress> {
        match self.progress.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Bulk reindexing of one or more entity types.
pub struct MassIndexer {
    settings: MassIndexerSettings,
    source: Arc<dyn EntitySource>,
    router: Arc<IndexRouter>,
    monitor: Arc<dyn MassIndexingMonitor>,
    entity_types: Vec<String>,
    resume_after: BTreeMap<String, String>,
}

impl MassIndexer {
    /// Indexer over every entity type known to `router`.
    pub fn new(
        source: Arc<dyn EntitySource>,
        router: Arc<IndexRouter>,
        settings: MassIndexerSettings,
    ) -> Self {
        let entity_types = router.entity_types().into_iter().map(String::from).collect();
        Self {
            settings,
            source,
            router,
            monitor: Arc::new(NoOpMonitor),
            entity_types,
            resume_after: BTreeMap::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MassIndexingMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Restrict the run to these entity types.
    pub fn entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Continue a previous run: per entity type, skip ids up to and
    /// including the given one.
    pub fn resume_after(mut self, cursor: BTreeMap<String, String>) -> Self {
        self.resume_after = cursor;
        self
    }

    /// Run to completion, cancellation, or failure.
    ///
    /// Cancelling `cancel` stops the producers between pages. Pages already
    /// produced drain, and the closing bracket still runs when the purge
    /// did.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<MassIndexingReport, MassIndexerError> {
        self.settings.validate().map_err(MassIndexerError::Config)?;
        if self.entity_types.is_empty() {
            return Err(MassIndexerError::Config(
                "no entity types to index".to_string(),
            ));
        }

        let started = Instant::now();
        let orchestrators = self.orchestrators()?;
        let mut report = MassIndexingReport::default();

        if cancel.is_cancelled() {
            info!("Mass indexing cancelled before start");
            report.cancelled = true;
            return Ok(report);
        }

        info!(
            types = ?self.entity_types,
            loaders = self.settings.threads_to_load_objects,
            builders = self.settings.threads_to_build_documents,
            purge = self.settings.purge_at_start,
            "Mass indexing started"
        );

        if self.settings.purge_at_start {
            for orchestrator in &orchestrators {
                orchestrator.purge_all().await?;
                if self.settings.optimize_after_purge {
                    orchestrator.optimize().await?;
                }
            }
            report.purged = true;
        }

        let state = Arc::new(RunState {
            monitor: Arc::clone(&self.monitor),
            progress: Mutex::new(BTreeMap::new()),
            failures: AtomicU64::new(0),
            threshold: self.settings.failure_threshold,
            tripped: AtomicBool::new(false),
            stop: cancel.child_token(),
        });
        for entity_type in &self.entity_types {
            state.update(entity_type, |_| {});
        }

        let pipeline = self.run_pipeline(&state).await;

        for orchestrator in &orchestrators {
            if self.settings.optimize_on_finish {
                orchestrator.commit().await?;
                orchestrator.optimize().await?;
            }
            orchestrator.flush().await?;
        }

        report.types = state.snapshot();
        report.failures = state.failures.load(Ordering::SeqCst);
        report.cancelled = cancel.is_cancelled();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.monitor.indexing_completed(&report);

        pipeline?;
        if state.tripped.load(Ordering::SeqCst) {
            return Err(MassIndexerError::ThresholdExceeded {
                failures: report.failures,
                threshold: self.settings.failure_threshold.unwrap_or_default(),
            });
        }

        info!(
            added = report.documents_added(),
            failures = report.failures,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "Mass indexing finished"
        );
        Ok(report)
    }

    /// Distinct orchestrators behind the entity types of this run.
    fn orchestrators(&self) -> Result<Vec<Arc<WorkOrchestrator>>, MassIndexerError> {
        let mut seen: HashMap<String, Arc<WorkOrchestrator>> = HashMap::new();
        for entity_type in &self.entity_types {
            let orchestrator = self.router.orchestrator_for(entity_type)?;
            seen.entry(orchestrator.index_name().to_string())
                .or_insert_with(|| Arc::clone(orchestrator));
        }
        let mut orchestrators: Vec<_> = seen.into_values().collect();
        orchestrators.sort_by(|a, b| a.index_name().cmp(b.index_name()));
        Ok(orchestrators)
    }

    async fn run_pipeline(&self, state: &Arc<RunState>) -> Result<(), MassIndexerError> {
        let loaders = self.settings.threads_to_load_objects;
        let builders = self.settings.threads_to_build_documents;

        let (id_tx, id_rx) = mpsc::channel::<IdBatch>(loaders * 2);
        let (entity_tx, entity_rx) = mpsc::channel::<Vec<EntityRecord>>(builders * 2);
        let id_rx = Arc::new(tokio::sync::Mutex::new(id_rx));
        let entity_rx = Arc::new(tokio::sync::Mutex::new(entity_rx));

        let mut producer_set = JoinSet::new();
        for entity_type in &self.entity_types {
            producer_set.spawn(produce_ids(
                Arc::clone(&self.source),
                entity_type.clone(),
                self.resume_after.get(entity_type).cloned(),
                self.settings.id_fetch_size,
                self.settings.batch_size_to_load_objects,
                id_tx.clone(),
                Arc::clone(state),
            ));
        }
        drop(id_tx);

        let mut loader_set = JoinSet::new();
        for _ in 0..loaders {
            loader_set.spawn(load_entities(
                Arc::clone(&self.source),
                Arc::clone(&id_rx),
                entity_tx.clone(),
                Arc::clone(state),
            ));
        }
        drop(entity_tx);

        let mut builder_set = JoinSet::new();
        for _ in 0..builders {
            builder_set.spawn(build_documents(
                Arc::clone(&self.router),
                Arc::clone(&entity_rx),
                Arc::clone(state),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = producer_set.join_next().await {
            let result = joined.map_err(|e| MassIndexerError::Task(e.to_string()));
            if let Err(e) = result.and_then(|r| r) {
                error!(error = %e, "Id producer failed, stopping run");
                state.stop.cancel();
                first_error.get_or_insert(e);
            }
        }
        for (stage, set) in [("loader", &mut loader_set), ("builder", &mut builder_set)] {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(stage, error = %e, "Pipeline task failed");
                    first_error.get_or_insert(MassIndexerError::Task(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn produce_ids(
    source: Arc<dyn EntitySource>,
    entity_type: String,
    resume_after: Option<String>,
    id_fetch_size: usize,
    batch_size: usize,
    tx: mpsc::Sender<IdBatch>,
    state: Arc<RunState>,
) -> Result<(), MassIndexerError> {
    let mut pages = Box::pin(stream_all_ids(
        source,
        entity_type.clone(),
        id_fetch_size,
        resume_after,
    ));

    loop {
        if state.stop.is_cancelled() {
            debug!(entity = %entity_type, "Id producer stopping");
            break;
        }
        let Some(page) = pages.try_next().await? else {
            break;
        };
        state.update(&entity_type, |p| p.ids_produced += page.len() as u64);

        for chunk in page.chunks(batch_size) {
            let batch = IdBatch {
                entity_type: entity_type.clone(),
                ids: chunk.to_vec(),
            };
            if tx.send(batch).await.is_err() {
                return Ok(());
            }
        }
        let last = page.last().cloned();
        state.update(&entity_type, |p| p.resume_after = last);
    }
    Ok(())
}

async fn load_entities(
    source: Arc<dyn EntitySource>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IdBatch>>>,
    tx: mpsc::Sender<Vec<EntityRecord>>,
    state: Arc<RunState>,
) {
    loop {
        let batch = rx.lock().await.recv().await;
        let Some(batch) = batch else { break };

        match source.load_by_ids(&batch.entity_type, &batch.ids).await {
            Ok(records) => {
                let loaded = records.len() as u64;
                state.update(&batch.entity_type, |p| p.entities_loaded += loaded);
                state.monitor.entities_loaded(loaded);
                if !records.is_empty() && tx.send(records).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let reason = e.to_string();
                for id in batch.ids {
                    state.fail(EntityFailure {
                        entity_type: batch.entity_type.clone(),
                        entity_id: Some(id),
                        stage: FailureStage::Load,
                        reason: reason.clone(),
                    });
                }
            }
        }
    }
}

async fn build_documents(
    router: Arc<IndexRouter>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<EntityRecord>>>>,
    state: Arc<RunState>,
) {
    loop {
        let records = rx.lock().await.recv().await;
        let Some(records) = records else { break };
        index_batch(&router, records, &state).await;
    }
}

async fn index_batch(router: &IndexRouter, records: Vec<EntityRecord>, state: &RunState) {
    let mut plans: HashMap<String, IndexingPlan> = HashMap::new();
    let mut origins: HashMap<(String, DocumentKey), (String, String)> = HashMap::new();

    for record in &records {
        let built = router
            .build(record)
            .and_then(|doc| Ok((router.index_for(&record.entity_name)?.to_string(), doc)));
        match built {
            Ok((index, document)) => {
                origins.insert(
                    (index.clone(), document.key()),
                    (record.entity_name.clone(), record.entity_id.clone()),
                );
                state.update(&record.entity_name, |p| p.documents_built += 1);
                plans.entry(index).or_default().add(document);
            }
            Err(e) => state.fail(EntityFailure {
                entity_type: record.entity_name.clone(),
                entity_id: Some(record.entity_id.clone()),
                stage: FailureStage::Build,
                reason: e.to_string(),
            }),
        }
    }
    state.monitor.documents_built(origins.len() as u64);

    let mut added = 0u64;
    for (index, mut plan) in plans {
        let submitted = match router.orchestrator(&index) {
            Ok(orchestrator) => plan.execute(orchestrator).await,
            Err(e) => Err(e),
        };
        let handles = match submitted {
            Ok(handles) => handles,
            Err(e) => {
                let reason = e.to_string();
                for ((idx, _), (entity_type, id)) in &origins {
                    if *idx == index {
                        state.fail(EntityFailure {
                            entity_type: entity_type.clone(),
                            entity_id: Some(id.clone()),
                            stage: FailureStage::Index,
                            reason: reason.clone(),
                        });
                    }
                }
                continue;
            }
        };

        let (works, futures): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(futures).await;
        for (work, result) in works.iter().zip(results) {
            let Some(key) = work.key() else { continue };
            let Some((entity_type, id)) = origins.get(&(index.clone(), key)) else {
                continue;
            };
            match result {
                Ok(()) => {
                    added += 1;
                    state.update(entity_type, |p| p.documents_added += 1);
                }
                Err(e) => state.fail(EntityFailure {
                    entity_type: entity_type.clone(),
                    entity_id: Some(id.clone()),
                    stage: FailureStage::Index,
                    reason: e.to_string(),
                }),
            }
        }
    }
    state.monitor.documents_added(added);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::CountingMonitor;
    use async_trait::async_trait;
    use searchsync_indexing::{JsonDocumentBuilder, OrchestratorConfig, PerChangesetCommit};
    use searchsync_search::{FailureMode, InMemoryBackend, IndexBackend};
    use searchsync_storage::{Storage, StorageError};
    use searchsync_types::{Document, Work};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        backend: Arc<InMemoryBackend>,
        router: Arc<IndexRouter>,
        _tmp: TempDir,
    }

    fn fixture(books: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(tmp.path()).unwrap());
        for i in 0..books {
            storage
                .put_entity_silently(&EntityRecord::new(
                    "book",
                    format!("{:04}", i),
                    json!({ "n": i }),
                ))
                .unwrap();
        }

        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = WorkOrchestrator::start(
            "books",
            backend.clone(),
            Arc::new(PerChangesetCommit),
            OrchestratorConfig::default().with_batch_window(Duration::from_millis(1)),
        );
        let mut router = IndexRouter::new();
        router.add_index(Arc::new(orchestrator));
        router
            .route("book", "books", Arc::new(JsonDocumentBuilder::new()))
            .unwrap();

        Fixture {
            storage,
            backend,
            router: Arc::new(router),
            _tmp: tmp,
        }
    }

    fn settings() -> MassIndexerSettings {
        MassIndexerSettings {
            threads_to_load_objects: 3,
            threads_to_build_documents: 2,
            batch_size_to_load_objects: 7,
            id_fetch_size: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reindexes_everything_after_purge() {
        let f = fixture(250);
        f.backend
            .submit(&Work::add(Document::new("book", "stale", json!({}))))
            .await
            .unwrap();
        let monitor = Arc::new(CountingMonitor::new());

        let report = MassIndexer::new(f.storage.clone(), f.router.clone(), settings())
            .with_monitor(monitor.clone())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert!(report.purged);
        assert_eq!(report.documents_added(), 250);
        assert_eq!(report.failures, 0);
        assert_eq!(f.backend.committed_len(), 250);
        assert!(f.backend.document(&DocumentKey::new("stale", None)).is_none());
        assert!(f.backend.optimize_count() >= 2);
        assert_eq!(monitor.loaded.load(Ordering::Relaxed), 250);
        assert_eq!(monitor.added.load(Ordering::Relaxed), 250);
        assert_eq!(monitor.completed.load(Ordering::Relaxed), 1);
        assert_eq!(report.types["book"].resume_after.as_deref(), Some("0249"));
    }

    #[tokio::test]
    async fn test_failures_are_skipped_below_threshold() {
        let f = fixture(30);
        f.backend.fail_document("0003", FailureMode::Always);
        f.backend.fail_document("0017", FailureMode::Always);

        let report = MassIndexer::new(f.storage.clone(), f.router.clone(), settings())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failures, 2);
        assert_eq!(report.documents_added(), 28);
        assert_eq!(f.backend.committed_len(), 28);
    }

    #[tokio::test]
    async fn test_threshold_aborts_run() {
        let f = fixture(30);
        for id in ["0001", "0002", "0003"] {
            f.backend.fail_document(id, FailureMode::Always);
        }
        let result = MassIndexer::new(
            f.storage.clone(),
            f.router.clone(),
            MassIndexerSettings {
                failure_threshold: Some(1),
                ..settings()
            },
        )
        .start(CancellationToken::new())
        .await;

        assert!(matches!(
            result,
            Err(MassIndexerError::ThresholdExceeded { threshold: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_build_failure_is_reported() {
        let f = fixture(5);
        f.storage
            .put_entity_silently(&EntityRecord::new("book", "9999", json!("not an object")))
            .unwrap();
        let monitor = Arc::new(CountingMonitor::new());

        let report = MassIndexer::new(f.storage.clone(), f.router.clone(), settings())
            .with_monitor(monitor.clone())
            .start(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.documents_added(), 5);
        let failures = monitor.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stage, FailureStage::Build);
        assert_eq!(failures[0].entity_id.as_deref(), Some("9999"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let f = fixture(10);
        f.backend
            .submit(&Work::add(Document::new("book", "keep", json!({}))))
            .await
            .unwrap();
        f.backend.commit().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = MassIndexer::new(f.storage.clone(), f.router.clone(), settings())
            .start(cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.purged);
        assert_eq!(f.backend.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_resume_after_skips_processed_ids() {
        let f = fixture(100);
        let mut cursor = BTreeMap::new();
        cursor.insert("book".to_string(), "0049".to_string());

        let report = MassIndexer::new(
            f.storage.clone(),
            f.router.clone(),
            MassIndexerSettings {
                purge_at_start: false,
                ..settings()
            },
        )
        .resume_after(cursor)
        .start(CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(report.documents_added(), 50);
        assert!(f.backend.document(&DocumentKey::new("0049", None)).is_none());
        assert!(f.backend.document(&DocumentKey::new("0050", None)).is_some());
    }

    /// Cancels the run as soon as the first id page has been fetched.
    struct CancellingSource {
        inner: Arc<Storage>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl EntitySource for CancellingSource {
        async fn fetch_id_page(
            &self,
            entity_type: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<String>, StorageError> {
            let page = self.inner.fetch_id_page(entity_type, after, limit).await?;
            self.cancel.cancel();
            Ok(page)
        }

        async fn load_by_ids(
            &self,
            entity_type: &str,
            ids: &[String],
        ) -> Result<Vec<EntityRecord>, StorageError> {
            self.inner.load_by_ids(entity_type, ids).await
        }
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_page() {
        let f = fixture(100);
        let cancel = CancellationToken::new();
        let source = Arc::new(CancellingSource {
            inner: f.storage.clone(),
            cancel: cancel.clone(),
        });

        let report = MassIndexer::new(source, f.router.clone(), settings())
            .start(cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.documents_added(), 20);
        assert_eq!(report.resume_cursor()["book"], "0019");
        assert_eq!(f.backend.committed_len(), 20);
    }
}
