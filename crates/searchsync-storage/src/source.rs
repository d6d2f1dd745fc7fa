//! System-of-record access for indexing.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use searchsync_types::EntityRecord;
use std::sync::Arc;

use crate::db::Storage;
use crate::error::StorageError;

/// Read access to the entities being indexed.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Up to `limit` ids of `entity_type` strictly after `after`, in a
    /// stable order.
    async fn fetch_id_page(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// Entities for the given ids. Ids that no longer exist are omitted.
    async fn load_by_ids(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRecord>, StorageError>;

    /// Total number of entities of `entity_type`, if cheaply known.
    async fn count(&self, entity_type: &str) -> Result<Option<u64>, StorageError> {
        let _ = entity_type;
        Ok(None)
    }
}

#[async_trait]
impl EntitySource for Storage {
    async fn fetch_id_page(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        self.list_entity_ids(entity_type, after, limit)
    }

    async fn load_by_ids(
        &self,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRecord>, StorageError> {
        self.get_entities(entity_type, ids)
    }

    async fn count(&self, entity_type: &str) -> Result<Option<u64>, StorageError> {
        self.count_entities(entity_type).map(Some)
    }
}

struct PageCursor {
    after: Option<String>,
    done: bool,
}

/// Every id of `entity_type` as a stream of pages of at most `page_size`.
///
/// Paging starts after `resume_after` when given. The stream ends after
/// the first short page.
pub fn stream_all_ids(
    source: Arc<dyn EntitySource>,
    entity_type: String,
    page_size: usize,
    resume_after: Option<String>,
) -> impl Stream<Item = Result<Vec<String>, StorageError>> + Send {
    let cursor = PageCursor {
        after: resume_after,
        done: page_size == 0,
    };
    stream::try_unfold(cursor, move |cursor| {
        let source = Arc::clone(&source);
        let entity_type = entity_type.clone();
        async move {
            if cursor.done {
                return Ok(None);
            }
            let page = source
                .fetch_id_page(&entity_type, cursor.after.as_deref(), page_size)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            let next = PageCursor {
                after: page.last().cloned(),
                done: page.len() < page_size,
            };
            Ok(Some((page, next)))
        }
    })
}
