//! The backend index service interface.

use async_trait::async_trait;
use searchsync_types::Work;

use crate::error::SearchError;

/// Per-Work results of one bulk call, in submission order.
pub type BulkOutcome = Vec<Result<(), SearchError>>;

/// A search index the orchestrator writes to.
///
/// Implementations must apply the Works of one bulk call in slice order.
/// Applied Works need not be visible to readers until `commit` and
/// `refresh` have run.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Name of the index, for logs.
    fn name(&self) -> &str;

    /// Apply Works in order. An `Err` means the whole call failed and none
    /// of the Works can be assumed applied.
    async fn submit_bulk(&self, works: &[Work]) -> Result<BulkOutcome, SearchError>;

    /// Apply one Work.
    async fn submit(&self, work: &Work) -> Result<(), SearchError> {
        let mut outcome = self.submit_bulk(std::slice::from_ref(work)).await?;
        outcome.pop().unwrap_or(Ok(()))
    }

    /// Make applied Works durable.
    async fn commit(&self) -> Result<(), SearchError>;

    /// Make committed Works visible to readers.
    async fn refresh(&self) -> Result<(), SearchError>;

    /// Merge the index down for read performance.
    async fn optimize(&self) -> Result<(), SearchError>;

    /// Number of documents visible to readers.
    async fn doc_count(&self) -> Result<u64, SearchError>;
}
