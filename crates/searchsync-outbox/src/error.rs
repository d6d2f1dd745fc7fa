//! Error types for outbox processing.

use searchsync_indexing::IndexingError;
use searchsync_storage::StorageError;
use searchsync_types::SyncError;
use thiserror::Error;

/// Errors that stop an outbox pass.
///
/// Per-event failures never surface here; they are recorded on the event
/// and retried or aborted.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Outbox store or entity source failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Indexing setup failed
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Shard layout could not be determined
    #[error("Shard error: {0}")]
    Shard(#[from] SyncError),
}
