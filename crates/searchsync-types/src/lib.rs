//! # searchsync-types
//!
//! Shared domain types for the search-sync system.
//!
//! This crate defines the data structures passed between the storage,
//! indexing, outbox and mass-indexing layers:
//! - Work: a single index mutation for one document identity
//! - Outbox events: durable change records shared between instances
//! - Entity records: rows of the system of record
//! - Shard assignment: which slice of the outbox an instance owns
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use searchsync_types::{Document, Work};
//!
//! let doc = Document::new("book", "42", serde_json::json!({"title": "Dune"}));
//! let work = Work::add(doc);
//! assert_eq!(work.document_id, "42");
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod outbox;
pub mod shard;
pub mod work;

pub use config::{MassIndexerSettings, OrchestratorSettings, PollingSettings, Settings};
pub use entity::EntityRecord;
pub use error::SyncError;
pub use outbox::{ChangeDescriptor, ChangeKind, EventStatus, NewOutboxEvent, OutboxEvent};
pub use shard::{shard_of, ShardAssignment};
pub use work::{Document, DocumentKey, Work, WorkOperation};
