//! Outbox store: durable, shared queue of change events.
//!
//! Every status transition is a conditional write: the row is read with
//! `get_for_update`, its status and version are compared with what the
//! caller observed, and the write is committed through an optimistic
//! transaction. A concurrent writer makes the commit fail with a conflict,
//! which is reported as a lost claim rather than an error.

use chrono::{DateTime, Utc};
use searchsync_types::{EventStatus, NewOutboxEvent, OutboxEvent, ShardAssignment};
use tracing::{debug, info, warn};

use crate::column_families::CF_OUTBOX;
use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::OutboxKey;

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The event is now Processing and owned by the caller
    Claimed(OutboxEvent),
    /// Another processor changed the event first
    Lost,
}

/// What to do with an event whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Back to Pending, eligible again at the given instant
    RetryAt(DateTime<Utc>),
    /// Terminal until an operator intervenes
    Abort,
}

/// Durable event table shared by every processor instance.
pub trait OutboxStore: Send + Sync {
    /// Append an event outside of an entity transaction.
    fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StorageError>;

    /// Pending events due at `now` in the given shards, ascending id.
    fn poll_pending(
        &self,
        now: DateTime<Utc>,
        shards: &ShardAssignment,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError>;

    /// Move a polled event to Processing if nobody else has touched it.
    fn try_claim(
        &self,
        event: &OutboxEvent,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError>;

    /// Delete successfully processed events in one transaction.
    ///
    /// Events no longer held by the caller are left alone. Returns the
    /// number deleted.
    fn complete(&self, events: &[OutboxEvent]) -> Result<usize, StorageError>;

    /// Count a failed attempt and either reschedule or abort the event.
    ///
    /// Returns false if the claim had already been lost.
    fn record_failure(
        &self,
        event: &OutboxEvent,
        action: FailureAction,
        error: &str,
    ) -> Result<bool, StorageError>;

    /// Return Processing events claimed before `claimed_before` to Pending.
    fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StorageError>;

    fn get_event(&self, id: u64) -> Result<Option<OutboxEvent>, StorageError>;

    /// Number of events in `status`, optionally restricted to one tenant.
    fn count_events(&self, status: EventStatus, tenant_id: Option<&str>)
        -> Result<u64, StorageError>;

    /// Move Aborted events back to Pending with a fresh retry budget.
    fn reprocess_aborted(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    /// Delete Aborted events.
    fn clear_aborted(&self, tenant_id: Option<&str>) -> Result<u64, StorageError>;
}

impl Storage {
    /// Conditionally rewrite one event.
    ///
    /// `expected` is the event as the caller last saw it; the write only
    /// happens if status and version still match. Returns the new row, or
    /// `None` when the caller lost the race.
    fn transition(
        &self,
        expected: &OutboxEvent,
        apply: impl FnOnce(&mut OutboxEvent),
    ) -> Result<Option<OutboxEvent>, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let key = OutboxKey::new(expected.id).to_bytes();

        let txn = self.db.transaction();
        let Some(bytes) = txn.get_for_update_cf(cf, &key, true)? else {
            return Ok(None);
        };
        let mut current = OutboxEvent::from_bytes(&bytes)?;
        if current.status != expected.status || current.version != expected.version {
            return Ok(None);
        }

        apply(&mut current);
        current.version += 1;
        txn.put_cf(cf, &key, current.to_bytes()?)?;

        match txn.commit() {
            Ok(()) => Ok(Some(current)),
            Err(e) => {
                let err = StorageError::from(e);
                if err.is_conflict() {
                    debug!(event_id = expected.id, "Outbox transition lost to a concurrent writer");
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn events_matching(
        &self,
        mut keep: impl FnMut(&OutboxEvent) -> bool,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut matched = Vec::new();
        self.scan_outbox(|event| {
            if keep(&event) {
                matched.push(event);
            }
            true
        })?;
        Ok(matched)
    }

    fn delete_if_unchanged(&self, event: &OutboxEvent) -> Result<bool, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        let key = OutboxKey::new(event.id).to_bytes();

        let txn = self.db.transaction();
        let Some(bytes) = txn.get_for_update_cf(cf, &key, true)? else {
            return Ok(false);
        };
        let current = OutboxEvent::from_bytes(&bytes)?;
        if current.status != event.status || current.version != event.version {
            return Ok(false);
        }
        txn.delete_cf(cf, &key)?;
        match txn.commit() {
            Ok(()) => Ok(true),
            Err(e) => {
                let err = StorageError::from(e);
                if err.is_conflict() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }
}

impl OutboxStore for Storage {
    fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StorageError> {
        let txn = self.db.transaction();
        let event = self.stage_event(&txn, event)?;
        txn.commit()?;
        Ok(event)
    }

    fn poll_pending(
        &self,
        now: DateTime<Utc>,
        shards: &ShardAssignment,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let mut due = Vec::new();
        if limit == 0 || shards.is_empty() {
            return Ok(due);
        }
        self.scan_outbox(|event| {
            if event.status == EventStatus::Pending
                && event.process_after <= now
                && shards.owns(&event.entity_id)
            {
                due.push(event);
            }
            due.len() < limit
        })?;
        Ok(due)
    }

    fn try_claim(
        &self,
        event: &OutboxEvent,
        claimant: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError> {
        if event.status != EventStatus::Pending {
            return Ok(ClaimOutcome::Lost);
        }
        let claimed = self.transition(event, |e| {
            e.status = EventStatus::Processing;
            e.claimed_by = Some(claimant.to_string());
            e.claimed_at = Some(now);
        })?;
        Ok(match claimed {
            Some(event) => ClaimOutcome::Claimed(event),
            None => ClaimOutcome::Lost,
        })
    }

    fn complete(&self, events: &[OutboxEvent]) -> Result<usize, StorageError> {
        if events.is_empty() {
            return Ok(0);
        }
        let cf = self.cf(CF_OUTBOX)?;

        let txn = self.db.transaction();
        let mut deleted = 0;
        let mut stale = false;
        for event in events {
            let key = OutboxKey::new(event.id).to_bytes();
            match txn.get_for_update_cf(cf, &key, true)? {
                Some(bytes) => {
                    let current = OutboxEvent::from_bytes(&bytes)?;
                    if current.status == event.status && current.version == event.version {
                        txn.delete_cf(cf, &key)?;
                        deleted += 1;
                    } else {
                        stale = true;
                    }
                }
                None => stale = true,
            }
        }

        match txn.commit() {
            Ok(()) => {
                if stale {
                    warn!(
                        requested = events.len(),
                        deleted, "Some processed events were no longer held by this processor"
                    );
                }
                Ok(deleted)
            }
            Err(e) => {
                let err = StorageError::from(e);
                if !err.is_conflict() {
                    return Err(err);
                }
                debug!("Batch completion conflicted, completing events one by one");
                let mut deleted = 0;
                for event in events {
                    if self.delete_if_unchanged(event)? {
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }
        }
    }

    fn record_failure(
        &self,
        event: &OutboxEvent,
        action: FailureAction,
        error: &str,
    ) -> Result<bool, StorageError> {
        let updated = self.transition(event, |e| {
            e.retry_count += 1;
            e.last_error = Some(error.to_string());
            e.claimed_by = None;
            e.claimed_at = None;
            match action {
                FailureAction::RetryAt(at) => {
                    e.status = EventStatus::Pending;
                    e.process_after = at;
                }
                FailureAction::Abort => e.status = EventStatus::Aborted,
            }
        })?;
        Ok(updated.is_some())
    }

    fn release_expired_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired = self.events_matching(|e| {
            e.status == EventStatus::Processing
                && e.claimed_at.map(|at| at < claimed_before).unwrap_or(true)
        })?;

        let mut released = 0;
        for event in &expired {
            let updated = self.transition(event, |e| {
                e.status = EventStatus::Pending;
                e.claimed_by = None;
                e.claimed_at = None;
            })?;
            if updated.is_some() {
                released += 1;
            }
        }
        if released > 0 {
            warn!(released, "Released expired outbox claims");
        }
        Ok(released)
    }

    fn get_event(&self, id: u64) -> Result<Option<OutboxEvent>, StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        match self.db.get_cf(cf, OutboxKey::new(id).to_bytes())? {
            Some(bytes) => Ok(Some(OutboxEvent::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn count_events(
        &self,
        status: EventStatus,
        tenant_id: Option<&str>,
    ) -> Result<u64, StorageError> {
        let mut count = 0;
        self.scan_outbox(|event| {
            if event.status == status && event.belongs_to_tenant(tenant_id) {
                count += 1;
            }
            true
        })?;
        Ok(count)
    }

    fn reprocess_aborted(
        &self,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let aborted = self.events_matching(|e| {
            e.status == EventStatus::Aborted && e.belongs_to_tenant(tenant_id)
        })?;

        let mut requeued = 0;
        for event in &aborted {
            let updated = self.transition(event, |e| {
                e.status = EventStatus::Pending;
                e.retry_floor = e.retry_count;
                e.process_after = now;
            })?;
            if updated.is_some() {
                requeued += 1;
            }
        }
        info!(requeued, tenant = ?tenant_id, "Reprocessing aborted events");
        Ok(requeued)
    }

    fn clear_aborted(&self, tenant_id: Option<&str>) -> Result<u64, StorageError> {
        let aborted = self.events_matching(|e| {
            e.status == EventStatus::Aborted && e.belongs_to_tenant(tenant_id)
        })?;

        let mut cleared = 0;
        for event in &aborted {
            if self.delete_if_unchanged(event)? {
                cleared += 1;
            }
        }
        info!(cleared, tenant = ?tenant_id, "Cleared aborted events");
        Ok(cleared)
    }
}
