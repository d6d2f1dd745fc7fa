//! Commit policies: when applied Works are made durable.
//!
//! The orchestrator consults its policy after every bulk call and, for the
//! scheduled policy, on a timer. Policies are looked up by configuration
//! key through [`CommitPolicyRegistry`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::IndexingError;

/// Summary of one completed bulk call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Works carried by the call
    pub works: usize,
    /// Works the backend accepted
    pub applied: usize,
}

/// Decides when the orchestrator commits.
pub trait CommitPolicy: Send + Sync + Debug {
    /// Configuration key
    fn name(&self) -> &'static str;

    /// A bulk call is about to be dispatched.
    fn batch_started(&self) {}

    /// A bulk call finished. `queue_idle` is true when nothing else is
    /// queued or in flight on this orchestrator. Returns true to commit now.
    fn commit_after_batch(&self, report: &BatchReport, queue_idle: bool) -> bool;

    /// Period of timer-driven commits, if any.
    fn interval(&self) -> Option<Duration> {
        None
    }
}

/// Commit after every bulk call that applied anything.
#[derive(Debug, Default)]
pub struct PerChangesetCommit;

impl CommitPolicy for PerChangesetCommit {
    fn name(&self) -> &'static str {
        "per-changeset"
    }

    fn commit_after_batch(&self, report: &BatchReport, _queue_idle: bool) -> bool {
        report.applied > 0
    }
}

/// Commit on a fixed period when something changed.
#[derive(Debug)]
pub struct ScheduledCommit {
    delay: Duration,
}

impl ScheduledCommit {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl CommitPolicy for ScheduledCommit {
    fn name(&self) -> &'static str {
        "scheduled"
    }

    fn commit_after_batch(&self, _report: &BatchReport, _queue_idle: bool) -> bool {
        false
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.delay)
    }
}

/// Commit for an index written by several orchestrators.
///
/// All writers of one backend share a counter of bulk calls in flight.
/// Whichever writer finishes the last in-flight call while its own queue
/// is idle commits for everyone. With a single writer this reduces to
/// committing whenever the orchestrator goes idle.
#[derive(Debug)]
pub struct SharedIndexCommit {
    writers_in_flight: Arc<AtomicUsize>,
}

impl SharedIndexCommit {
    pub fn new(writers_in_flight: Arc<AtomicUsize>) -> Self {
        Self { writers_in_flight }
    }
}

impl CommitPolicy for SharedIndexCommit {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn batch_started(&self) {
        self.writers_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn commit_after_batch(&self, _report: &BatchReport, queue_idle: bool) -> bool {
        let before = self.writers_in_flight.fetch_sub(1, Ordering::SeqCst);
        before <= 1 && queue_idle
    }
}

/// Inputs available to policy factories.
#[derive(Debug, Clone)]
pub struct CommitPolicyParams {
    pub commit_delay: Duration,
    /// In-flight counter shared by every writer of the same backend
    pub shared_writers: Arc<AtomicUsize>,
}

impl Default for CommitPolicyParams {
    fn default() -> Self {
        Self {
            commit_delay: Duration::from_millis(1_000),
            shared_writers: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub type CommitPolicyFactory = fn(&CommitPolicyParams) -> Arc<dyn CommitPolicy>;

fn per_changeset(_: &CommitPolicyParams) -> Arc<dyn CommitPolicy> {
    Arc::new(PerChangesetCommit)
}

fn scheduled(params: &CommitPolicyParams) -> Arc<dyn CommitPolicy> {
    Arc::new(ScheduledCommit::new(params.commit_delay))
}

fn shared(params: &CommitPolicyParams) -> Arc<dyn CommitPolicy> {
    Arc::new(SharedIndexCommit::new(Arc::clone(&params.shared_writers)))
}

/// Maps configuration keys to commit policy factories.
pub struct CommitPolicyRegistry {
    factories: HashMap<&'static str, CommitPolicyFactory>,
}

impl CommitPolicyRegistry {
    /// Registry with `per-changeset`, `scheduled` and `shared`.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("per-changeset", per_changeset);
        registry.register("scheduled", scheduled);
        registry.register("shared", shared);
        registry
    }

    pub fn register(&mut self, key: &'static str, factory: CommitPolicyFactory) {
        self.factories.insert(key, factory);
    }

    pub fn resolve(
        &self,
        key: &str,
        params: &CommitPolicyParams,
    ) -> Result<Arc<dyn CommitPolicy>, IndexingError> {
        let factory = self.factories.get(key).ok_or_else(|| {
            let mut known: Vec<&str> = self.factories.keys().copied().collect();
            known.sort_unstable();
            IndexingError::Config(format!(
                "unknown commit policy {:?}, expected one of {}",
                key,
                known.join(", ")
            ))
        })?;
        Ok(factory(params))
    }
}

impl Default for CommitPolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
