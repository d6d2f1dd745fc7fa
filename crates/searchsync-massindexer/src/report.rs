//! Mass indexing results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stage where an entity failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Load,
    Build,
    Index,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Load => write!(f, "load"),
            FailureStage::Build => write!(f, "build"),
            FailureStage::Index => write!(f, "index"),
        }
    }
}

/// One entity that could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_type: String,
    /// Absent when a whole batch failed before ids could be attributed
    pub entity_id: Option<String>,
    pub stage: FailureStage,
    pub reason: String,
}

/// Counts for one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeProgress {
    pub ids_produced: u64,
    pub entities_loaded: u64,
    pub documents_built: u64,
    pub documents_added: u64,
    pub failures: u64,
    /// Last id handed to the loaders; every id up to it has been processed
    /// when the run returns
    pub resume_after: Option<String>,
}

/// Outcome of a mass indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassIndexingReport {
    pub types: BTreeMap<String, TypeProgress>,
    pub failures: u64,
    pub cancelled: bool,
    pub purged: bool,
    pub elapsed_ms: u64,
}

impl MassIndexingReport {
    pub fn documents_added(&self) -> u64 {
        self.types.values().map(|t| t.documents_added).sum()
    }

    pub fn entities_loaded(&self) -> u64 {
        self.types.values().map(|t| t.entities_loaded).sum()
    }

    /// Per-type cursor to pass back as `resume_after` on the next run.
    pub fn resume_cursor(&self) -> BTreeMap<String, String> {
        self.types
            .iter()
            .filter_map(|(t, p)| p.resume_after.clone().map(|id| (t.clone(), id)))
            .collect()
    }
}
