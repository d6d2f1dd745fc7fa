//! # searchsync-search
//!
//! Backend index services that Works are applied to.
//!
//! - [`IndexBackend`]: the narrow interface the orchestrator talks to
//! - [`TantivyBackend`]: persistent full-text index on local disk
//! - [`InMemoryBackend`]: map-backed backend with latency and failure
//!   injection, for tests and dry runs

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
pub mod tantivy_backend;

pub use backend::{BulkOutcome, IndexBackend};
pub use error::SearchError;
pub use memory::{FailureMode, InMemoryBackend, LatencyJitter};
pub use schema::SyncSchema;
pub use tantivy_backend::{TantivyBackend, TantivyBackendConfig};
