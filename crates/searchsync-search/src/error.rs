//! Search backend error types.

use thiserror::Error;

/// Errors reported by a backend index service.
///
/// Cloneable so one failed bulk call can fail every Work it carried.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    /// Tantivy index error
    #[error("Tantivy error: {0}")]
    Tantivy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Backend temporarily unable to accept writes
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Backend refused one document; retrying the same input will not help
    #[error("Document {document_id} rejected: {reason}")]
    Rejected { document_id: String, reason: String },

    /// Work is malformed for its operation
    #[error("Invalid work: {0}")]
    InvalidWork(String),

    /// Schema mismatch
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl SearchError {
    /// Whether retrying the same Work later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SearchError::Unavailable(_) | SearchError::Io(_) | SearchError::Tantivy(_)
        )
    }
}

impl From<tantivy::TantivyError> for SearchError {
    fn from(err: tantivy::TantivyError) -> Self {
        SearchError::Tantivy(err.to_string())
    }
}

impl From<std::io::Error> for SearchError {
    fn from(err: std::io::Error) -> Self {
        SearchError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        SearchError::InvalidWork(err.to_string())
    }
}
