//! End-to-end mass indexing tests against a real Tantivy index.

use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use e2e_tests::{fast_orchestrator, padded_id, router_over, seed_books, TestHarness, INDEX};
use searchsync_daemon::commands::{load_resume_cursor, record_mass_index_outcome};
use searchsync_massindexer::{CountingMonitor, MassIndexer};
use searchsync_search::{IndexBackend, TantivyBackend, TantivyBackendConfig};
use searchsync_storage::{EntitySource, Storage, StorageError};
use searchsync_types::{Document, DocumentKey, EntityRecord, MassIndexerSettings, Work};

fn settings() -> MassIndexerSettings {
    MassIndexerSettings {
        threads_to_load_objects: 4,
        threads_to_build_documents: 2,
        batch_size_to_load_objects: 16,
        id_fetch_size: 50,
        purge_at_start: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_purge_and_rebuild_matches_store_exactly() {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(Storage::open(&temp.path().join("db")).unwrap());
    let backend = Arc::new(
        TantivyBackend::open_or_create(TantivyBackendConfig::new(
            INDEX,
            temp.path().join("index"),
        ))
        .unwrap(),
    );
    let router = router_over(backend.clone(), fast_orchestrator());

    // Documents left over from an earlier deployment.
    let orchestrator = router.orchestrator(INDEX).unwrap();
    for id in ["stale-1", "stale-2", "00003"] {
        orchestrator
            .submit_and_wait(Work::add(Document::new("book", id, json!({ "old": true }))))
            .await
            .unwrap();
    }
    orchestrator.flush().await.unwrap();
    assert_eq!(backend.doc_count().await.unwrap(), 3);

    let books = 300;
    seed_books(&storage, books);
    for n in 0..20 {
        storage
            .put_entity_silently(&EntityRecord::new(
                "author",
                format!("a-{:03}", n),
                json!({ "name": format!("Author {}", n) }),
            ))
            .unwrap();
    }

    let monitor = Arc::new(CountingMonitor::new());
    let report = MassIndexer::new(storage.clone(), router.clone(), settings())
        .with_monitor(monitor.clone())
        .start(CancellationToken::new())
        .await
        .unwrap();

    assert!(report.purged);
    assert!(!report.cancelled);
    assert_eq!(report.failures, 0);
    assert_eq!(report.types["book"].documents_added, books as u64);
    assert_eq!(report.types["author"].documents_added, 20);
    assert_eq!(backend.doc_count().await.unwrap(), books as u64 + 20);

    assert!(backend
        .get_document(&DocumentKey::new("stale-1", None))
        .unwrap()
        .is_none());
    for n in [0, 3, 150, 299] {
        let id = padded_id(n);
        let doc = backend
            .get_document(&DocumentKey::new(id.clone(), None))
            .unwrap()
            .unwrap();
        assert_eq!(doc.entity_name, "book");
        assert_eq!(doc.body, json!({ "title": format!("Book {}", n) }));
    }
    let author = backend
        .get_document(&DocumentKey::new("a-007", None))
        .unwrap()
        .unwrap();
    assert_eq!(author.body, json!({ "name": "Author 7" }));

    router.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rebuild_without_purge_keeps_unrelated_documents() {
    let harness = TestHarness::new();
    let orchestrator = harness.router.orchestrator(INDEX).unwrap();
    orchestrator
        .submit_and_wait(Work::add(Document::new("book", "orphan", json!({}))))
        .await
        .unwrap();
    seed_books(&harness.storage, 40);

    let report = MassIndexer::new(
        harness.storage.clone(),
        harness.router.clone(),
        MassIndexerSettings {
            purge_at_start: false,
            ..settings()
        },
    )
    .start(CancellationToken::new())
    .await
    .unwrap();

    assert!(!report.purged);
    assert_eq!(report.documents_added(), 40);
    assert_eq!(harness.backend.committed_len(), 41);
}

/// Cancels the run once `pages` id pages have been produced.
struct InterruptedSource {
    inner: Arc<Storage>,
    cancel: CancellationToken,
    pages: usize,
    fetched: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl EntitySource for InterruptedSource {
    async fn fetch_id_page(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let page = self.inner.fetch_id_page(entity_type, after, limit).await?;
        let fetched = self
            .fetched
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if fetched >= self.pages {
            self.cancel.cancel();
        }
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
async fn test_cancelled_run_resumes_from_checkpoint() {
    let harness = TestHarness::new();
    let books = 200;
    seed_books(&harness.storage, books);

    let cancel = CancellationToken::new();
    let source = Arc::new(InterruptedSource {
        inner: harness.storage.clone(),
        cancel: cancel.clone(),
        pages: 2,
        fetched: Default::default(),
    });
    let first = MassIndexer::new(source, harness.router.clone(), settings())
        .entity_types(["book"])
        .start(cancel)
        .await
        .unwrap();
    assert!(first.cancelled);
    assert_eq!(first.documents_added(), 100);
    record_mass_index_outcome(&harness.storage, &first).unwrap();

    let cursor = load_resume_cursor(&harness.storage).unwrap();
    assert_eq!(cursor["book"], padded_id(99));

    // A resumed run must not purge what the first run indexed.
    let second = MassIndexer::new(
        harness.storage.clone(),
        harness.router.clone(),
        MassIndexerSettings {
            purge_at_start: false,
            ..settings()
        },
    )
    .entity_types(["book"])
    .resume_after(cursor)
    .start(CancellationToken::new())
    .await
    .unwrap();
    assert!(!second.cancelled);
    record_mass_index_outcome(&harness.storage, &second).unwrap();

    assert_eq!(second.documents_added(), 100);
    assert_eq!(harness.backend.committed_len(), books);
    assert!(load_resume_cursor(&harness.storage).unwrap().is_empty());
}
