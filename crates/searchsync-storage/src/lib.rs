//! Storage layer for search-sync.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for entities, outbox events, membership and checkpoints
//! - Entity mutations written atomically with their outbox event
//! - Optimistic-lock transitions on outbox events (claim, retry, abort, complete)
//! - Paged entity access for bulk reindexing

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;
pub mod membership;
pub mod outbox;
pub mod source;

pub use db::{Storage, StorageStats};
pub use error::StorageError;
pub use keys::{CheckpointKey, EntityKey, MemberKey, OutboxKey};
pub use membership::{MemberRecord, MembershipRegistry};
pub use outbox::{ClaimOutcome, FailureAction, OutboxStore};
pub use source::{stream_all_ids, EntitySource};
