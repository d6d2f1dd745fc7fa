//! In-memory backend.
//!
//! Keeps three generations of the index (applied, committed, visible) so
//! commit and refresh semantics can be observed. Latency jitter and
//! failure injection make it suitable for exercising ordering, retry and
//! abort paths without a real index.

use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use searchsync_types::{Document, DocumentKey, Work, WorkOperation};
use tracing::trace;

use crate::backend::{BulkOutcome, IndexBackend};
use crate::error::SearchError;

/// Random delay applied to every bulk call.
#[derive(Debug, Clone, Copy)]
pub struct LatencyJitter {
    pub min: Duration,
    pub max: Duration,
}

impl LatencyJitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    fn sample(&self) -> Duration {
        let min = self.min.as_micros() as u64;
        let max = self.max.as_micros() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_micros(rand::rng().random_range(min..=max))
    }
}

/// How Works for a given document id fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Every attempt is rejected
    Always,
    /// The next n attempts are rejected, later ones succeed
    Times(u32),
}

#[derive(Default)]
struct MemoryState {
    applied: BTreeMap<DocumentKey, Document>,
    committed: BTreeMap<DocumentKey, Document>,
    visible: BTreeMap<DocumentKey, Document>,
    log: Vec<Work>,
    failing: HashMap<String, FailureMode>,
    unavailable_calls: u32,
    in_flight: HashSet<DocumentKey>,
    overlap_violations: u64,
    concurrent_calls: usize,
    peak_concurrency: usize,
    bulk_calls: u64,
    commits: u64,
    refreshes: u64,
    optimizes: u64,
}

/// Map-backed [`IndexBackend`].
pub struct InMemoryBackend {
    name: String,
    latency: Option<LatencyJitter>,
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_latency(mut self, latency: LatencyJitter) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, SearchError> {
        self.state
            .lock()
            .map_err(|e| SearchError::Unavailable(format!("state lock poisoned: {}", e)))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Reject Works for `document_id` according to `mode`.
    pub fn fail_document(&self, document_id: impl Into<String>, mode: FailureMode) {
        self.with_state(|s| {
            s.failing.insert(document_id.into(), mode);
        });
    }

    /// Stop rejecting Works for `document_id`.
    pub fn heal_document(&self, document_id: &str) {
        self.with_state(|s| {
            s.failing.remove(document_id);
        });
    }

    /// Fail the next `n` bulk calls as a whole.
    pub fn fail_next_calls(&self, n: u32) {
        self.with_state(|s| s.unavailable_calls = n);
    }

    /// Committed state of one document.
    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.with_state(|s| s.committed.get(key).cloned())
    }

    /// Applied, possibly uncommitted, state of one document.
    pub fn applied_document(&self, key: &DocumentKey) -> Option<Document> {
        self.with_state(|s| s.applied.get(key).cloned())
    }

    /// Number of committed documents.
    pub fn committed_len(&self) -> usize {
        self.with_state(|s| s.committed.len())
    }

    /// Every successfully applied Work, in application order.
    pub fn applied_log(&self) -> Vec<Work> {
        self.with_state(|s| s.log.clone())
    }

    /// Applied Works for one document, in application order.
    pub fn applied_for(&self, key: &DocumentKey) -> Vec<WorkOperation> {
        self.with_state(|s| {
            s.log
                .iter()
                .filter(|w| w.key().as_ref() == Some(key))
                .map(|w| w.operation)
                .collect()
        })
    }

    /// Times a bulk call started while another call for a same key was running.
    pub fn overlap_violations(&self) -> u64 {
        self.with_state(|s| s.overlap_violations)
    }

    /// Largest number of bulk calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.with_state(|s| s.peak_concurrency)
    }

    pub fn bulk_calls(&self) -> u64 {
        self.with_state(|s| s.bulk_calls)
    }

    pub fn commit_count(&self) -> u64 {
        self.with_state(|s| s.commits)
    }

    pub fn refresh_count(&self) -> u64 {
        self.with_state(|s| s.refreshes)
    }

    pub fn optimize_count(&self) -> u64 {
        self.with_state(|s| s.optimizes)
    }

    fn apply(state: &mut MemoryState, work: &Work) -> Result<(), SearchError> {
        if let Some(mode) = state.failing.get_mut(&work.document_id) {
            let reject = match mode {
                FailureMode::Always => true,
                FailureMode::Times(0) => false,
                FailureMode::Times(n) => {
                    *n -= 1;
                    true
                }
            };
            if reject {
                return Err(SearchError::Rejected {
                    document_id: work.document_id.clone(),
                    reason: "injected failure".to_string(),
                });
            }
        }

        match work.operation {
            WorkOperation::Add | WorkOperation::Update => {
                let document = work.payload.clone().ok_or_else(|| {
                    SearchError::InvalidWork(format!(
                        "{} for {} has no payload",
                        work.operation, work.document_id
                    ))
                })?;
                state.applied.insert(document.key(), document);
            }
            WorkOperation::Delete => {
                state
                    .applied
                    .remove(&DocumentKey::new(work.document_id.clone(), work.routing_key.clone()));
            }
            WorkOperation::Purge => {
                state.applied.retain(|k, _| k.document_id != work.document_id);
            }
            WorkOperation::PurgeAll => state.applied.clear(),
        }
        state.log.push(work.clone());
        Ok(())
    }
}

#[async_trait]
impl IndexBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit_bulk(&self, works: &[Work]) -> Result<BulkOutcome, SearchError> {
        let keys: Vec<DocumentKey> = works.iter().filter_map(Work::key).collect();
        {
            let mut state = self.lock()?;
            state.bulk_calls += 1;
            if state.unavailable_calls > 0 {
                state.unavailable_calls -= 1;
                return Err(SearchError::Unavailable("injected outage".to_string()));
            }
            state.concurrent_calls += 1;
            state.peak_concurrency = state.peak_concurrency.max(state.concurrent_calls);
            for key in &keys {
                if !state.in_flight.insert(key.clone()) {
                    state.overlap_violations += 1;
                }
            }
        }

        if let Some(latency) = self.latency {
            let delay = latency.sample();
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        let outcome: BulkOutcome = works.iter().map(|w| Self::apply(&mut state, w)).collect();
        for key in &keys {
            state.in_flight.remove(key);
        }
        state.concurrent_calls -= 1;
        trace!(index = %self.name, works = works.len(), "Applied bulk in memory");
        Ok(outcome)
    }

    async fn commit(&self) -> Result<(), SearchError> {
        let mut state = self.lock()?;
        state.committed = state.applied.clone();
        state.commits += 1;
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SearchError> {
        let mut state = self.lock()?;
        state.visible = state.committed.clone();
        state.refreshes += 1;
        Ok(())
    }

    async fn optimize(&self) -> Result<(), SearchError> {
        self.lock()?.optimizes += 1;
        Ok(())
    }

    async fn doc_count(&self) -> Result<u64, SearchError> {
        Ok(self.lock()?.visible.len() as u64)
    }
}
