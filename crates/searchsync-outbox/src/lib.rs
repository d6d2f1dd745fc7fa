//! # searchsync-outbox
//!
//! Durable, multi-instance processing of outbox events.
//!
//! Entity changes are recorded as events in the same transaction as the
//! change itself. [`OutboxEventProcessor`] instances poll those events,
//! claim them with optimistic locking, apply them through the indexing
//! layer and retry failures with exponential backoff until the retry
//! budget runs out. Aborted events stay visible to operators through
//! [`OutboxAdmin`].
//!
//! Instances split the outbox by shard: either a fixed assignment from
//! configuration ([`StaticShards`]) or one derived from live membership
//! heartbeats ([`DynamicShards`]).

pub mod admin;
pub mod error;
pub mod processor;
pub mod retry;
pub mod shards;

pub use admin::OutboxAdmin;
pub use error::OutboxError;
pub use processor::{OutboxEventProcessor, PassReport, ProcessorConfig, ProcessorState};
pub use retry::RetryPolicy;
pub use shards::{DynamicShards, ShardProvider, StaticShards};
