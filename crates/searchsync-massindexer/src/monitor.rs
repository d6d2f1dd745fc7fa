//! Progress monitors for mass indexing runs.
//!
//! Monitors only observe; nothing they do affects the run.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::report::{EntityFailure, MassIndexingReport};

/// Callbacks invoked by the pipeline stages. Counts are deltas.
pub trait MassIndexingMonitor: Send + Sync + Debug {
    fn entities_loaded(&self, count: u64);
    fn documents_built(&self, count: u64);
    fn documents_added(&self, count: u64);
    fn entity_failed(&self, failure: &EntityFailure);
    fn indexing_completed(&self, report: &MassIndexingReport);
}

#[derive(Debug, Default)]
pub struct NoOpMonitor;

impl MassIndexingMonitor for NoOpMonitor {
    fn entities_loaded(&self, _count: u64) {}
    fn documents_built(&self, _count: u64) {}
    fn documents_added(&self, _count: u64) {}
    fn entity_failed(&self, _failure: &EntityFailure) {}
    fn indexing_completed(&self, _report: &MassIndexingReport) {}
}

/// Logs progress every `log_every` added documents, plus every failure.
#[derive(Debug)]
pub struct LoggingMonitor {
    log_every: u64,
    loaded: AtomicU64,
    added: AtomicU64,
}

impl LoggingMonitor {
    pub fn new(log_every: u64) -> Self {
        Self {
            log_every: log_every.max(1),
            loaded: AtomicU64::new(0),
            added: AtomicU64::new(0),
        }
    }
}

impl Default for LoggingMonitor {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl MassIndexingMonitor for LoggingMonitor {
    fn entities_loaded(&self, count: u64) {
        self.loaded.fetch_add(count, Ordering::Relaxed);
    }

    fn documents_built(&self, _count: u64) {}

    fn documents_added(&self, count: u64) {
        let before = self.added.fetch_add(count, Ordering::Relaxed);
        let after = before + count;
        if before / self.log_every != after / self.log_every {
            info!(
                loaded = self.loaded.load(Ordering::Relaxed),
                added = after,
                "Mass indexing progress"
            );
        }
    }

    fn entity_failed(&self, failure: &EntityFailure) {
        warn!(
            entity = %failure.entity_type,
            id = ?failure.entity_id,
            stage = %failure.stage,
            reason = %failure.reason,
            "Mass indexing failure"
        );
    }

    fn indexing_completed(&self, report: &MassIndexingReport) {
        info!(
            added = report.documents_added(),
            failures = report.failures,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "Mass indexing completed"
        );
    }
}

/// Accumulates every callback; useful for assertions and status output.
#[derive(Debug, Default)]
pub struct CountingMonitor {
    pub loaded: AtomicU64,
    pub built: AtomicU64,
    pub added: AtomicU64,
    pub failed: AtomicU64,
    pub completed: AtomicU64,
    failures: Mutex<Vec<EntityFailure>>,
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<EntityFailure> {
        match self.failures.lock() {
            Ok(f) => f.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MassIndexingMonitor for CountingMonitor {
    fn entities_loaded(&self, count: u64) {
        self.loaded.fetch_add(count, Ordering::Relaxed);
    }

    fn documents_built(&self, count: u64) {
        self.built.fetch_add(count, Ordering::Relaxed);
    }

    fn documents_added(&self, count: u64) {
        self.added.fetch_add(count, Ordering::Relaxed);
    }

    fn entity_failed(&self, failure: &EntityFailure) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        match self.failures.lock() {
            Ok(mut f) => f.push(failure.clone()),
            Err(poisoned) => poisoned.into_inner().push(failure.clone()),
        }
    }

    fn indexing_completed(&self, _report: &MassIndexingReport) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

pub type MonitorFactory = fn() -> Arc<dyn MassIndexingMonitor>;

fn logging() -> Arc<dyn MassIndexingMonitor> {
    Arc::new(LoggingMonitor::default())
}

fn noop() -> Arc<dyn MassIndexingMonitor> {
    Arc::new(NoOpMonitor)
}

/// Maps configuration keys to monitor factories.
pub struct MonitorRegistry {
    factories: HashMap<&'static str, MonitorFactory>,
}

impl MonitorRegistry {
    /// Registry with `logging` and `noop`.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("logging", logging);
        registry.register("noop", noop);
        registry
    }

    pub fn register(&mut self, key: &'static str, factory: MonitorFactory) {
        self.factories.insert(key, factory);
    }

    pub fn resolve(&self, key: &str) -> Option<Arc<dyn MassIndexingMonitor>> {
        self.factories.get(key).map(|factory| factory())
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
