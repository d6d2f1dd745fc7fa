//! # searchsync-indexing
//!
//! Coordination between entity changes and a backend index.
//!
//! - [`IndexingPlan`] merges redundant operations within one unit of work
//! - [`WorkOrchestrator`] serializes, batches and commits Works per index
//! - [`CommitPolicy`] decides when applied Works become durable
//! - [`IndexRouter`] maps entity types to indexes and document builders
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use searchsync_indexing::{IndexingPlan, OrchestratorConfig, PerChangesetCommit, WorkOrchestrator};
//! use searchsync_search::InMemoryBackend;
//! use searchsync_types::Document;
//!
//! # async fn example() -> Result<(), searchsync_indexing::IndexingError> {
//! let orchestrator = WorkOrchestrator::start(
//!     "books",
//!     Arc::new(InMemoryBackend::new("books")),
//!     Arc::new(PerChangesetCommit),
//!     OrchestratorConfig::default(),
//! );
//!
//! let mut plan = IndexingPlan::new();
//! plan.add(Document::new("book", "1", serde_json::json!({"title": "Dune"})));
//! for (_, handle) in plan.execute(&orchestrator).await? {
//!     handle.await?;
//! }
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod commit_policy;
pub mod document;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod router;

pub use commit_policy::{
    BatchReport, CommitPolicy, CommitPolicyFactory, CommitPolicyParams, CommitPolicyRegistry,
    PerChangesetCommit, ScheduledCommit, SharedIndexCommit,
};
pub use document::{DocumentBuilder, JsonDocumentBuilder};
pub use error::IndexingError;
pub use orchestrator::{OrchestratorConfig, OrchestratorStats, WorkHandle, WorkOrchestrator};
pub use plan::IndexingPlan;
pub use router::IndexRouter;
