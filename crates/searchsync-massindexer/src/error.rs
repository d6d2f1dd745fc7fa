//! Error types for mass indexing.

use searchsync_indexing::IndexingError;
use searchsync_storage::StorageError;
use thiserror::Error;

/// Errors that end a mass indexing run.
#[derive(Error, Debug)]
pub enum MassIndexerError {
    /// Entity source failed while producing ids
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Lifecycle operation (purge, optimize, flush) failed
    #[error("Indexing error: {0}")]
    Indexing(#[from] IndexingError),

    /// Too many entities failed to load, build or index
    #[error("Mass indexing aborted: {failures} failures exceeded threshold {threshold}")]
    ThresholdExceeded { failures: u64, threshold: u64 },

    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline task panicked or was cancelled by the runtime
    #[error("Pipeline task failed: {0}")]
    Task(String),
}
