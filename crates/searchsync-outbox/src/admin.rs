//! Operator functions over aborted outbox events.

use std::sync::Arc;

use chrono::Utc;
use searchsync_storage::OutboxStore;
use searchsync_types::{EventStatus, OutboxEvent};
use tracing::info;

use crate::error::OutboxError;

/// Inspect, reprocess and clear aborted events, optionally for one tenant.
#[derive(Clone)]
pub struct OutboxAdmin {
    store: Arc<dyn OutboxStore>,
}

impl OutboxAdmin {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    pub fn count_aborted_events(&self, tenant_id: Option<&str>) -> Result<u64, OutboxError> {
        Ok(self.store.count_events(EventStatus::Aborted, tenant_id)?)
    }

    /// Make aborted events eligible again, each with a fresh retry budget.
    pub fn reprocess_aborted_events(&self, tenant_id: Option<&str>) -> Result<u64, OutboxError> {
        let count = self.store.reprocess_aborted(tenant_id, Utc::now())?;
        info!(tenant = ?tenant_id, count, "Reprocessing aborted outbox events");
        Ok(count)
    }

    pub fn clear_aborted_events(&self, tenant_id: Option<&str>) -> Result<u64, OutboxError> {
        let count = self.store.clear_aborted(tenant_id)?;
        info!(tenant = ?tenant_id, count, "Cleared aborted outbox events");
        Ok(count)
    }

    pub fn count_pending_events(&self, tenant_id: Option<&str>) -> Result<u64, OutboxError> {
        Ok(self.store.count_events(EventStatus::Pending, tenant_id)?)
    }

    pub fn get_event(&self, id: u64) -> Result<Option<OutboxEvent>, OutboxError> {
        Ok(self.store.get_event(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsync_storage::{ClaimOutcome, FailureAction, Storage};
    use searchsync_types::{ChangeKind, NewOutboxEvent};
    use tempfile::TempDir;

    fn create_test_storage() -> (Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (Arc::new(storage), temp_dir)
    }

    fn abort(storage: &Storage, id: &str, tenant: &str) -> OutboxEvent {
        let new = NewOutboxEvent::for_change("book", id, ChangeKind::Add)
            .unwrap()
            .with_tenant(Some(tenant.to_string()));
        let event = storage.append(new).unwrap();
        let ClaimOutcome::Claimed(claimed) = storage.try_claim(&event, "a", Utc::now()).unwrap()
        else {
            panic!("claim lost");
        };
        assert!(storage
            .record_failure(&claimed, FailureAction::Abort, "boom")
            .unwrap());
        claimed
    }

    #[test]
    fn test_tenant_scoped_operations() {
        let (storage, _tmp) = create_test_storage();
        let admin = OutboxAdmin::new(storage.clone());
        abort(&storage, "1", "acme");
        abort(&storage, "2", "acme");
        abort(&storage, "3", "globex");

        assert_eq!(admin.count_aborted_events(None).unwrap(), 3);
        assert_eq!(admin.count_aborted_events(Some("acme")).unwrap(), 2);

        assert_eq!(admin.reprocess_aborted_events(Some("acme")).unwrap(), 2);
        assert_eq!(admin.count_pending_events(None).unwrap(), 2);
        assert_eq!(admin.count_aborted_events(None).unwrap(), 1);

        assert_eq!(admin.clear_aborted_events(Some("acme")).unwrap(), 0);
        assert_eq!(admin.clear_aborted_events(None).unwrap(), 1);
        assert_eq!(admin.count_aborted_events(None).unwrap(), 0);
    }

    #[test]
    fn test_reprocess_keeps_retry_count() {
        let (storage, _tmp) = create_test_storage();
        let admin = OutboxAdmin::new(storage.clone());
        let event = abort(&storage, "1", "acme");

        admin.reprocess_aborted_events(None).unwrap();
        let stored = admin.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.budgeted_retries(), 0);
    }
}
