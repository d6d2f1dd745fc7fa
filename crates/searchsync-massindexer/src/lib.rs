//! # searchsync-massindexer
//!
//! Rebuilds search indexes from the system of record.
//!
//! [`MassIndexer`] pages through every entity id, loads entities in
//! parallel batches, builds documents and feeds them to the index
//! orchestrators, bracketed by an optional purge before and optimize,
//! commit and refresh after. Progress is reported to a
//! [`MassIndexingMonitor`]; runs can be cancelled and resumed.

pub mod error;
pub mod indexer;
pub mod monitor;
pub mod report;

pub use error::MassIndexerError;
pub use indexer::MassIndexer;
pub use monitor::{
    CountingMonitor, LoggingMonitor, MassIndexingMonitor, MonitorFactory, MonitorRegistry,
    NoOpMonitor,
};
pub use report::{EntityFailure, FailureStage, MassIndexingReport, TypeProgress};
