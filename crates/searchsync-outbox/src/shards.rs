//! Shard providers: which slice of the outbox an instance polls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use searchsync_storage::MembershipRegistry;
use searchsync_types::{PollingSettings, ShardAssignment};
use tracing::{debug, info};

use crate::error::OutboxError;

/// Source of the current shard assignment.
pub trait ShardProvider: Send + Sync {
    /// Assignment to use for a pass starting at `now`.
    fn assignment(&self, now: DateTime<Utc>) -> Result<ShardAssignment, OutboxError>;

    /// This instance is going away.
    fn leave(&self) -> Result<(), OutboxError> {
        Ok(())
    }
}

/// Fixed assignment from configuration.
#[derive(Debug, Clone)]
pub struct StaticShards {
    assignment: ShardAssignment,
}

impl StaticShards {
    pub fn new(assignment: ShardAssignment) -> Self {
        Self { assignment }
    }

    pub fn from_settings(settings: &PollingSettings) -> Result<Self, OutboxError> {
        Ok(Self::new(ShardAssignment::new(
            settings.shard_count,
            settings.shard_indexes.clone(),
        )?))
    }
}

impl ShardProvider for StaticShards {
    fn assignment(&self, _now: DateTime<Utc>) -> Result<ShardAssignment, OutboxError> {
        Ok(self.assignment.clone())
    }
}

/// Assignment derived from the live members of the cluster.
///
/// Every pass records a heartbeat, then lists members seen within
/// `member_timeout`. With `n` live members sorted by id, the instance at
/// position `i` owns shard `i` of `n`.
pub struct DynamicShards {
    registry: Arc<dyn MembershipRegistry>,
    instance_id: String,
    member_timeout: Duration,
}

impl DynamicShards {
    pub fn new(
        registry: Arc<dyn MembershipRegistry>,
        instance_id: impl Into<String>,
        member_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            instance_id: instance_id.into(),
            member_timeout,
        }
    }
}

impl ShardProvider for DynamicShards {
    fn assignment(&self, now: DateTime<Utc>) -> Result<ShardAssignment, OutboxError> {
        self.registry.heartbeat(&self.instance_id, now)?;

        let since = now - chrono::Duration::milliseconds(self.member_timeout.as_millis() as i64);
        let members = self.registry.live_members(since)?;
        let total = members.len().max(1) as u32;

        let assigned = match members.iter().position(|m| *m == self.instance_id) {
            Some(position) => vec![position as u32],
            None => Vec::new(),
        };
        debug!(
            instance = %self.instance_id,
            members = members.len(),
            assigned = ?assigned,
            "Computed dynamic shard assignment"
        );
        Ok(ShardAssignment::new(total, assigned)?)
    }

    fn leave(&self) -> Result<(), OutboxError> {
        info!(instance = %self.instance_id, "Leaving processor membership");
        self.registry.leave(&self.instance_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchsync_storage::Storage;
    use tempfile::TempDir;

    fn create_test_storage() -> (Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (Arc::new(storage), temp_dir)
    }

    #[test]
    fn test_static_from_settings() {
        let settings = PollingSettings {
            shard_count: 4,
            shard_indexes: vec![1, 3],
            ..Default::default()
        };
        let shards = StaticShards::from_settings(&settings).unwrap();
        let assignment = shards.assignment(Utc::now()).unwrap();
        assert_eq!(assignment.total_shard_count, 4);
        assert_eq!(assignment.assigned, vec![1, 3]);
    }

    #[test]
    fn test_static_rejects_out_of_range() {
        let settings = PollingSettings {
            shard_count: 2,
            shard_indexes: vec![2],
            ..Default::default()
        };
        assert!(matches!(
            StaticShards::from_settings(&settings),
            Err(OutboxError::Shard(_))
        ));
    }

    #[test]
    fn test_dynamic_members_split_shards() {
        let (storage, _tmp) = create_test_storage();
        let timeout = Duration::from_secs(30);
        let a = DynamicShards::new(storage.clone(), "node-a", timeout);
        let b = DynamicShards::new(storage.clone(), "node-b", timeout);
        let now = Utc::now();

        a.assignment(now).unwrap();
        let b_assignment = b.assignment(now).unwrap();
        let a_assignment = a.assignment(now).unwrap();

        assert_eq!(a_assignment.total_shard_count, 2);
        assert_eq!(a_assignment.assigned, vec![0]);
        assert_eq!(b_assignment.assigned, vec![1]);

        b.leave().unwrap();
        let a_alone = a.assignment(now).unwrap();
        assert_eq!(a_alone.total_shard_count, 1);
        assert_eq!(a_alone.assigned, vec![0]);
    }

    #[test]
    fn test_dynamic_ignores_stale_members() {
        let (storage, _tmp) = create_test_storage();
        let timeout = Duration::from_secs(30);
        let now = Utc::now();
        storage
            .heartbeat("node-stale", now - chrono::Duration::seconds(120))
            .unwrap();

        let live = DynamicShards::new(storage.clone(), "node-live", timeout);
        let assignment = live.assignment(now).unwrap();
        assert_eq!(assignment.total_shard_count, 1);
    }
}
