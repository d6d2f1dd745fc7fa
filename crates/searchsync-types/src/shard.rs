//! Shard assignment for outbox processing.
//!
//! Events are partitioned by a stable hash of the entity id so that every
//! instance computes the same shard for the same event, across restarts
//! and releases.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::SyncError;

/// Shard of `entity_id` among `total_shard_count` shards.
pub fn shard_of(entity_id: &str, total_shard_count: u32) -> u32 {
    (xxh3_64(entity_id.as_bytes()) % u64::from(total_shard_count.max(1))) as u32
}

/// The shards one processor instance is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub total_shard_count: u32,
    pub assigned: Vec<u32>,
}

impl ShardAssignment {
    /// Validated assignment.
    pub fn new(total_shard_count: u32, assigned: Vec<u32>) -> Result<Self, SyncError> {
        if total_shard_count == 0 {
            return Err(SyncError::InvalidInput(
                "total_shard_count must be > 0".to_string(),
            ));
        }
        if let Some(bad) = assigned.iter().find(|s| **s >= total_shard_count) {
            return Err(SyncError::InvalidInput(format!(
                "shard index {} out of range [0, {})",
                bad, total_shard_count
            )));
        }
        Ok(Self {
            total_shard_count,
            assigned,
        })
    }

    /// A single instance owning every event.
    pub fn single() -> Self {
        Self {
            total_shard_count: 1,
            assigned: vec![0],
        }
    }

    pub fn owns(&self, entity_id: &str) -> bool {
        let shard = shard_of(entity_id, self.total_shard_count);
        self.assigned.contains(&shard)
    }

    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for id in ["a", "b", "entity-42", ""] {
            let s = shard_of(id, 7);
            assert!(s < 7);
            assert_eq!(s, shard_of(id, 7));
        }
    }

    #[test]
    fn test_disjoint_assignments_cover_every_id() {
        let first = ShardAssignment::new(2, vec![0]).unwrap();
        let second = ShardAssignment::new(2, vec![1]).unwrap();

        for i in 0..100 {
            let id = format!("id-{}", i);
            assert!(first.owns(&id) ^ second.owns(&id));
        }
    }

    #[test]
    fn test_rejects_invalid_assignment() {
        assert!(ShardAssignment::new(0, vec![]).is_err());
        assert!(ShardAssignment::new(3, vec![3]).is_err());
    }

    #[test]
    fn test_single_owns_everything() {
        assert!(ShardAssignment::single().owns("anything"));
    }
}
