//! Error types for indexing coordination.

use searchsync_search::SearchError;
use thiserror::Error;

/// Errors that can occur while planning or applying Works
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Backend rejected the Work or the whole bulk call failed
    #[error("Backend error: {0}")]
    Backend(#[from] SearchError),

    /// Orchestrator queue is at its bound; retry later
    #[error("Work queue full ({bound} pending)")]
    QueueFull { bound: usize },

    /// Orchestrator has shut down
    #[error("Orchestrator for index {0} is closed")]
    Closed(String),

    /// Document could not be built from an entity
    #[error("Build error for {entity}/{id}: {reason}")]
    Build {
        entity: String,
        id: String,
        reason: String,
    },

    /// No index is configured for an entity type
    #[error("No index configured for entity type {0}")]
    UnknownEntity(String),

    /// Unknown or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IndexingError {
    /// Whether retrying the same Work later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexingError::Backend(e) => e.is_transient(),
            IndexingError::QueueFull { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexingError::QueueFull { bound: 10 };
        assert_eq!(err.to_string(), "Work queue full (10 pending)");

        let err = IndexingError::Closed("books".to_string());
        assert_eq!(err.to_string(), "Orchestrator for index books is closed");
    }

    #[test]
    fn test_retryable() {
        assert!(IndexingError::QueueFull { bound: 1 }.is_retryable());
        assert!(IndexingError::Backend(SearchError::Unavailable("x".into())).is_retryable());
        assert!(!IndexingError::Closed("x".into()).is_retryable());
    }
}
