//! Outbox event processor.
//!
//! One pass moves through the states
//! `Idle -> Polling -> Claiming -> Processing -> Committing / RetryScheduled / Aborting -> Idle`:
//!
//! 1. release claims whose owner stopped responding;
//! 2. poll due Pending events in this instance's shards;
//! 3. claim each one with an optimistic-lock update, dropping lost claims;
//! 4. resolve entities, build documents, merge them into one plan per
//!    index and wait for the orchestrators to apply them;
//! 5. delete the events that succeeded, reschedule or abort the rest.
//!
//! Any number of processors may run against the same store. A claim can
//! only be won by one of them; everything else is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use futures::future::join_all;
use searchsync_indexing::{IndexRouter, IndexingPlan};
use searchsync_storage::{ClaimOutcome, EntitySource, FailureAction, OutboxStore};
use searchsync_types::{ChangeKind, DocumentKey, EntityRecord, OutboxEvent, Settings, Work};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::OutboxError;
use crate::retry::{exponential, RetryPolicy};
use crate::shards::ShardProvider;

/// Where a processor currently is within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Polling,
    Claiming,
    Processing,
    Committing,
    RetryScheduled,
    Aborting,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessorState::Idle => "idle",
            ProcessorState::Polling => "polling",
            ProcessorState::Claiming => "claiming",
            ProcessorState::Processing => "processing",
            ProcessorState::Committing => "committing",
            ProcessorState::RetryScheduled => "retry_scheduled",
            ProcessorState::Aborting => "aborting",
        };
        write!(f, "{}", name)
    }
}

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Recorded as the claimant of every event this processor takes
    pub instance_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Claims older than this are released back to Pending
    pub claim_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound of the pause after a fatal error or fully contended pass
    pub max_idle_backoff: Duration,
}

impl ProcessorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let polling = &settings.polling;
        Self {
            instance_id: settings.instance_id.clone(),
            poll_interval: Duration::from_millis(polling.interval_ms),
            batch_size: polling.batch_size,
            claim_timeout: Duration::from_millis(polling.claim_timeout_ms),
            retry: RetryPolicy::from_settings(polling),
            max_idle_backoff: Duration::from_millis(polling.retry_max_delay_ms),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// The processor was disabled and did nothing
    pub skipped: bool,
    pub released: usize,
    pub polled: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub completed: usize,
    pub retried: usize,
    pub aborted: usize,
}

impl PassReport {
    /// Events were due but every claim went to another processor.
    pub fn all_claims_lost(&self) -> bool {
        self.polled > 0 && self.claimed == 0 && self.lost_claims > 0
    }
}

/// Polls the outbox and turns events into index Works.
pub struct OutboxEventProcessor {
    config: ProcessorConfig,
    store: Arc<dyn OutboxStore>,
    source: Arc<dyn EntitySource>,
    router: Arc<IndexRouter>,
    shards: Arc<dyn ShardProvider>,
    enabled: AtomicBool,
    state: Mutex<ProcessorState>,
}

impl OutboxEventProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn OutboxStore>,
        source: Arc<dyn EntitySource>,
        router: Arc<IndexRouter>,
        shards: Arc<dyn ShardProvider>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            router,
            shards,
            enabled: AtomicBool::new(true),
            state: Mutex::new(ProcessorState::Idle),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Enable or disable polling on this instance. Events accumulate in
    /// the store while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(instance = %self.config.instance_id, enabled, "Outbox processing toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessorState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ProcessorState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        trace!(from = %*state, to = %next, "Processor state");
        *state = next;
    }

    /// Run passes until `cancel` fires.
    ///
    /// A full batch is followed immediately by another pass. A fatal error
    /// or a pass that lost every claim pauses with exponential backoff.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OutboxError> {
        info!(
            instance = %self.config.instance_id,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox processor started"
        );

        let mut idle_backoff = exponential(
            self.config.poll_interval,
            2.0,
            self.config.max_idle_backoff.max(self.config.poll_interval),
        );

        while !cancel.is_cancelled() {
            let pause = match self.run_once().await {
                Ok(report) if report.all_claims_lost() => {
                    debug!(lost = report.lost_claims, "Every claim lost, backing off");
                    idle_backoff
                        .next_backoff()
                        .unwrap_or(self.config.poll_interval)
                }
                Ok(report) => {
                    idle_backoff.reset();
                    if report.polled >= self.config.batch_size && !report.skipped {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) => {
                    self.set_state(ProcessorState::Idle);
                    let pause = idle_backoff
                        .next_backoff()
                        .unwrap_or(self.config.max_idle_backoff);
                    error!(
                        error = %e,
                        retry_in_ms = pause.as_millis() as u64,
                        "Outbox pass failed, pausing"
                    );
                    pause
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        if let Err(e) = self.shards.leave() {
            warn!(error = %e, "Failed to leave shard membership");
        }
        info!(instance = %self.config.instance_id, "Outbox processor stopped");
        Ok(())
    }

    /// One poll, claim, process and settle pass.
    pub async fn run_once(&self) -> Result<PassReport, OutboxError> {
        let mut report = PassReport::default();
        if !self.is_enabled() {
            report.skipped = true;
            return Ok(report);
        }
        let now = Utc::now();

        let expired_before = now - to_chrono(self.config.claim_timeout);
        report.released = self.store.release_expired_claims(expired_before)?;

        let shards = self.shards.assignment(now)?;
        if shards.is_empty() {
            debug!(instance = %self.config.instance_id, "No shards assigned");
            return Ok(report);
        }

        self.set_state(ProcessorState::Polling);
        let polled = self
            .store
            .poll_pending(now, &shards, self.config.batch_size)?;
        report.polled = polled.len();
        if polled.is_empty() {
            self.set_state(ProcessorState::Idle);
            return Ok(report);
        }

        self.set_state(ProcessorState::Claiming);
        let mut claimed = Vec::with_capacity(polled.len());
        for event in &polled {
            match self.store.try_claim(event, &self.config.instance_id, now)? {
                ClaimOutcome::Claimed(event) => claimed.push(event),
                ClaimOutcome::Lost => report.lost_claims += 1,
            }
        }
        report.claimed = claimed.len();
        if claimed.is_empty() {
            self.set_state(ProcessorState::Idle);
            return Ok(report);
        }

        self.set_state(ProcessorState::Processing);
        let outcomes = self.process(&claimed).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (event, outcome) in claimed.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => succeeded.push(event),
                Err(reason) => failed.push((event, reason)),
            }
        }

        if !succeeded.is_empty() {
            self.set_state(ProcessorState::Committing);
            report.completed = self.store.complete(&succeeded)?;
        }

        for (event, reason) in failed {
            match self.config.retry.decide(&event, now) {
                action @ FailureAction::RetryAt(at) => {
                    self.set_state(ProcessorState::RetryScheduled);
                    if self.store.record_failure(&event, action, &reason)? {
                        report.retried += 1;
                        warn!(
                            event_id = event.id,
                            entity = %event.entity_name,
                            entity_id = %event.entity_id,
                            attempt = event.budgeted_retries() + 1,
                            retry_at = %at,
                            error = %reason,
                            "Outbox event failed, retry scheduled"
                        );
                    }
                }
                FailureAction::Abort => {
                    self.set_state(ProcessorState::Aborting);
                    if self
                        .store
                        .record_failure(&event, FailureAction::Abort, &reason)?
                    {
                        report.aborted += 1;
                        error!(
                            event_id = event.id,
                            entity = %event.entity_name,
                            entity_id = %event.entity_id,
                            retries = event.retry_count + 1,
                            error = %reason,
                            "Outbox event aborted"
                        );
                    }
                }
            }
        }

        self.set_state(ProcessorState::Idle);
        debug!(
            polled = report.polled,
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            aborted = report.aborted,
            "Outbox pass finished"
        );
        Ok(report)
    }

    /// Apply claimed events to the index. Returns one outcome per event, in
    /// the same order; errors are reasons recorded on the event.
    async fn process(&self, events: &[OutboxEvent]) -> Vec<Result<(), String>> {
        let mut outcomes: Vec<Result<(), String>> = vec![Ok(()); events.len()];
        let entities = self.resolve_entities(events, &mut outcomes).await;

        // Plan per index, plus which events each planned document came from.
        let mut plans: HashMap<String, IndexingPlan> = HashMap::new();
        let mut origins: HashMap<(String, DocumentKey), Vec<usize>> = HashMap::new();

        for (i, event) in events.iter().enumerate() {
            if outcomes[i].is_err() {
                continue;
            }
            let work = match self.work_for(event, &entities) {
                Ok(work) => work,
                Err(reason) => {
                    outcomes[i] = Err(reason);
                    continue;
                }
            };
            let index = match self.router.index_for(&event.entity_name) {
                Ok(index) => index.to_string(),
                Err(e) => {
                    outcomes[i] = Err(e.to_string());
                    continue;
                }
            };
            if let Some(key) = work.key() {
                origins.entry((index.clone(), key)).or_default().push(i);
            }
            plans.entry(index).or_default().record(work);
        }

        for (index, mut plan) in plans {
            let submitted = match self.router.orchestrator(&index) {
                Ok(orchestrator) => plan.execute(orchestrator).await,
                Err(e) => Err(e),
            };
            let handles = match submitted {
                Ok(handles) => handles,
                Err(e) => {
                    let reason = e.to_string();
                    for ((idx, _), members) in &origins {
                        if *idx == index {
                            for &i in members {
                                outcomes[i] = Err(reason.clone());
                            }
                        }
                    }
                    continue;
                }
            };

            let (works, futures): (Vec<Work>, Vec<_>) = handles.into_iter().unzip();
            let results = join_all(futures).await;
            for (work, result) in works.iter().zip(results) {
                let Err(e) = result else { continue };
                let Some(key) = work.key() else { continue };
                if let Some(members) = origins.get(&(index.clone(), key)) {
                    for &i in members {
                        outcomes[i] = Err(e.to_string());
                    }
                }
            }
        }

        outcomes
    }

    /// Current state of every entity named by an Add or Update event,
    /// keyed by (entity name, entity id). A failed load fails the events
    /// of that entity type.
    async fn resolve_entities(
        &self,
        events: &[OutboxEvent],
        outcomes: &mut [Result<(), String>],
    ) -> HashMap<(String, String), EntityRecord> {
        let mut wanted: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, event) in events.iter().enumerate() {
            match event.change() {
                Ok(descriptor) if descriptor.change != ChangeKind::Delete => {
                    wanted.entry(event.entity_name.as_str()).or_default().push(i);
                }
                Ok(_) => {}
                Err(e) => outcomes[i] = Err(format!("malformed payload: {}", e)),
            }
        }

        let mut entities = HashMap::new();
        for (entity_name, members) in wanted {
            let mut ids: Vec<String> = members
                .iter()
                .map(|&i| events[i].entity_id.clone())
                .collect();
            ids.sort();
            ids.dedup();

            match self.source.load_by_ids(entity_name, &ids).await {
                Ok(records) => {
                    for record in records {
                        entities.insert(
                            (record.entity_name.clone(), record.entity_id.clone()),
                            record,
                        );
                    }
                }
                Err(e) => {
                    warn!(entity = %entity_name, error = %e, "Entity load failed");
                    for &i in &members {
                        outcomes[i] = Err(format!("entity load failed: {}", e));
                    }
                }
            }
        }
        entities
    }

    /// Work reproducing one event. Add and Update use the entity's current
    /// state; an entity that no longer exists becomes a Delete.
    fn work_for(
        &self,
        event: &OutboxEvent,
        entities: &HashMap<(String, String), EntityRecord>,
    ) -> Result<Work, String> {
        let descriptor = event
            .change()
            .map_err(|e| format!("malformed payload: {}", e))?;
        let delete = || Work::delete(event.entity_id.clone(), event.routing_key.clone());

        match descriptor.change {
            ChangeKind::Delete => Ok(delete()),
            ChangeKind::Add | ChangeKind::Update => {
                let key = (event.entity_name.clone(), event.entity_id.clone());
                let Some(entity) = entities.get(&key) else {
                    return Ok(delete());
                };
                let document = self.router.build(entity).map_err(|e| e.to_string())?;
                Ok(match descriptor.change {
                    ChangeKind::Add => Work::add(document),
                    _ => Work::update(document),
                })
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}
