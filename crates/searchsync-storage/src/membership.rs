//! Processor membership heartbeats.
//!
//! Each processor instance periodically records that it is alive. The set
//! of members seen recently, sorted by instance id, determines the shard
//! layout when dynamic sharding is enabled.

use chrono::{DateTime, Utc};
use rocksdb::IteratorMode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::column_families::CF_MEMBERS;
use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::MemberKey;

/// Last heartbeat of one processor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub instance_id: String,
    pub last_seen: DateTime<Utc>,
}

/// Registry of live processor instances.
pub trait MembershipRegistry: Send + Sync {
    /// Record that `instance_id` is alive at `now`.
    fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// Instances seen at or after `since`, sorted by id.
    fn live_members(&self, since: DateTime<Utc>) -> Result<Vec<String>, StorageError>;

    /// Remove an instance, e.g. on clean shutdown.
    fn leave(&self, instance_id: &str) -> Result<(), StorageError>;
}

impl MembershipRegistry for Storage {
    fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let cf = self.cf(CF_MEMBERS)?;
        let record = MemberRecord {
            instance_id: instance_id.to_string(),
            last_seen: now,
        };
        let txn = self.db.transaction();
        txn.put_cf(
            cf,
            MemberKey::new(instance_id).to_bytes(),
            serde_json::to_vec(&record)?,
        )?;
        txn.commit()?;
        Ok(())
    }

    fn live_members(&self, since: DateTime<Utc>) -> Result<Vec<String>, StorageError> {
        let cf = self.cf(CF_MEMBERS)?;
        let mut members = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: MemberRecord = serde_json::from_slice(&value)?;
            if record.last_seen >= since {
                members.push(record.instance_id);
            }
        }
        members.sort();
        Ok(members)
    }

    fn leave(&self, instance_id: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_MEMBERS)?;
        let txn = self.db.transaction();
        txn.delete_cf(cf, MemberKey::new(instance_id).to_bytes())?;
        txn.commit()?;
        debug!(instance_id, "Member left");
        Ok(())
    }
}
