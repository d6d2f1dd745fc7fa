//! Tantivy-backed index service.
//!
//! Works are applied to a single `IndexWriter` guarded by a mutex. Add and
//! Update delete the previous document by key before adding the new one,
//! so the index never holds two documents for one key. Nothing is visible
//! to readers until `commit` and `refresh`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use searchsync_types::{Document, DocumentKey, Work, WorkOperation};
use tantivy::collector::TopDocs;
use tantivy::query::TermQuery;
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

use crate::backend::{BulkOutcome, IndexBackend};
use crate::error::SearchError;
use crate::schema::{build_sync_schema, extract_text, SyncSchema};

/// Default memory budget for IndexWriter (50MB)
const DEFAULT_WRITER_MEMORY_MB: usize = 50;

/// Tantivy backend configuration
#[derive(Debug, Clone)]
pub struct TantivyBackendConfig {
    /// Index name, for logs
    pub name: String,
    /// Path to index directory
    pub index_path: PathBuf,
    /// Memory budget for writer in MB
    pub writer_memory_mb: usize,
}

impl TantivyBackendConfig {
    pub fn new(name: impl Into<String>, index_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            index_path: index_path.into(),
            writer_memory_mb: DEFAULT_WRITER_MEMORY_MB,
        }
    }

    pub fn with_memory_mb(mut self, mb: usize) -> Self {
        self.writer_memory_mb = mb;
        self
    }
}

/// Persistent backend over a Tantivy index directory.
pub struct TantivyBackend {
    config: TantivyBackendConfig,
    index: Index,
    schema: SyncSchema,
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
}

impl TantivyBackend {
    /// Open an existing index or create a new one.
    pub fn open_or_create(config: TantivyBackendConfig) -> Result<Self, SearchError> {
        let index = open_or_create_index(&config.index_path)?;
        let schema = SyncSchema::from_schema(index.schema())?;
        let writer = index.writer(config.writer_memory_mb * 1024 * 1024)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        info!(name = %config.name, path = ?config.index_path, "Opened tantivy backend");

        Ok(Self {
            config,
            index,
            schema,
            writer: Arc::new(Mutex::new(writer)),
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.index_path
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, IndexWriter>, SearchError> {
        lock(&self.writer)
    }

    fn key_term(&self, key: &DocumentKey) -> Term {
        Term::from_field_text(self.schema.doc_key, &key.encoded())
    }

    fn to_tantivy_doc(&self, document: &Document) -> Result<TantivyDocument, SearchError> {
        let key = document.key();
        Ok(doc!(
            self.schema.doc_key => key.encoded(),
            self.schema.doc_id => document.id.clone(),
            self.schema.routing => document.routing_key.clone().unwrap_or_default(),
            self.schema.entity => document.entity_name.clone(),
            self.schema.body => serde_json::to_string(&document.body)?,
            self.schema.text => extract_text(&document.body),
        ))
    }

    fn apply(&self, writer: &mut IndexWriter, work: &Work) -> Result<(), SearchError> {
        match work.operation {
            WorkOperation::Add | WorkOperation::Update => {
                let document = work.payload.as_ref().ok_or_else(|| {
                    SearchError::InvalidWork(format!(
                        "{} for {} has no payload",
                        work.operation, work.document_id
                    ))
                })?;
                writer.delete_term(self.key_term(&document.key()));
                writer.add_document(self.to_tantivy_doc(document)?)?;
            }
            WorkOperation::Delete => {
                let key = DocumentKey::new(work.document_id.clone(), work.routing_key.clone());
                writer.delete_term(self.key_term(&key));
            }
            WorkOperation::Purge => {
                writer.delete_term(Term::from_field_text(self.schema.doc_id, &work.document_id));
            }
            WorkOperation::PurgeAll => {
                writer.delete_all_documents()?;
            }
        }
        Ok(())
    }

    /// Look up a committed, refreshed document by key.
    pub fn get_document(&self, key: &DocumentKey) -> Result<Option<Document>, SearchError> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(self.key_term(key), IndexRecordOption::Basic);
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;

        let Some((_, address)) = hits.into_iter().next() else {
            return Ok(None);
        };
        let stored: TantivyDocument = searcher.doc(address)?;
        let text = |field| {
            stored
                .get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let routing = text(self.schema.routing);
        let body = serde_json::from_str(&text(self.schema.body))?;
        Ok(Some(Document {
            entity_name: text(self.schema.entity),
            id: text(self.schema.doc_id),
            routing_key: if routing.is_empty() { None } else { Some(routing) },
            body,
        }))
    }
}

#[async_trait]
impl IndexBackend for TantivyBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn submit_bulk(&self, works: &[Work]) -> Result<BulkOutcome, SearchError> {
        let mut writer = self.lock_writer()?;
        let outcome: BulkOutcome = works.iter().map(|w| self.apply(&mut writer, w)).collect();
        debug!(index = %self.config.name, works = works.len(), "Applied bulk");
        Ok(outcome)
    }

    async fn commit(&self) -> Result<(), SearchError> {
        // Commit fsyncs segment files (blocking operation, use spawn_blocking)
        let writer = Arc::clone(&self.writer);
        let opstamp = tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer)?;
            let opstamp = writer.commit()?;
            Ok::<_, SearchError>(opstamp)
        })
        .await
        .map_err(|e| SearchError::Tantivy(format!("Commit task failed: {}", e)))??;
        debug!(index = %self.config.name, opstamp, "Committed");
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SearchError> {
        self.reader.reload()?;
        Ok(())
    }

    async fn optimize(&self) -> Result<(), SearchError> {
        let segments = self.index.searchable_segment_ids()?;
        if segments.len() < 2 {
            return Ok(());
        }
        let merged = segments.len();
        let writer = Arc::clone(&self.writer);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer)?;
            let outcome = writer.merge(&segments).wait();
            Ok::<_, SearchError>(outcome)
        })
        .await
        .map_err(|e| SearchError::Tantivy(format!("Merge task failed: {}", e)))??;
        match outcome {
            Ok(_) => info!(index = %self.config.name, merged, "Optimized index"),
            // A background merge already holds some of the segments.
            Err(e) => warn!(index = %self.config.name, error = %e, "Optimize skipped"),
        }
        Ok(())
    }

    async fn doc_count(&self) -> Result<u64, SearchError> {
        Ok(self.reader.searcher().num_docs())
    }
}

fn lock(writer: &Mutex<IndexWriter>) -> Result<MutexGuard<'_, IndexWriter>, SearchError> {
    writer
        .lock()
        .map_err(|e| SearchError::Tantivy(format!("writer lock poisoned: {}", e)))
}

/// Open an existing index or create a new one with the sync schema.
pub fn open_or_create_index(path: &Path) -> Result<Index, SearchError> {
    if path.join("meta.json").exists() {
        debug!(path = ?path, "Opening existing index");
        Ok(Index::open_in_dir(path)?)
    } else {
        info!(path = ?path, "Creating new index");
        std::fs::create_dir_all(path)?;
        let schema = build_sync_schema();
        Ok(Index::create_in_dir(path, schema.schema().clone())?)
    }
}
