//! RocksDB wrapper for search-sync storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Entity writes committed in the same transaction as their outbox event
//! - Paged entity reads for bulk reindexing
//! - Checkpoints, compaction and statistics

use chrono::Utc;
use rocksdb::{
    ColumnFamily, Direction, IteratorMode, OptimisticTransactionDB, Options, Transaction,
};
use searchsync_types::{ChangeKind, EntityRecord, EventStatus, NewOutboxEvent, OutboxEvent};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::column_families::{
    build_cf_descriptors, CF_CHECKPOINTS, CF_ENTITIES, CF_MEMBERS, CF_OUTBOX,
};
use crate::error::StorageError;
use crate::keys::{CheckpointKey, EntityKey, OutboxKey};

/// Main storage interface for search-sync.
///
/// One handle serves as both the system of record and the outbox store.
/// All mutations go through optimistic transactions so concurrent
/// claimants of the same outbox row conflict at commit time.
pub struct Storage {
    pub(crate) db: OptimisticTransactionDB,
    /// Outbox id counter for monotonic ordering
    outbox_sequence: AtomicU64,
}

impl Storage {
    /// Open storage at the given path, creating if necessary.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let db: OptimisticTransactionDB =
            OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;

        let outbox_sequence = Self::load_outbox_sequence(&db)?;
        debug!(next_id = outbox_sequence, "Outbox sequence initialized");

        Ok(Self {
            db,
            outbox_sequence: AtomicU64::new(outbox_sequence),
        })
    }

    /// Load the next outbox id from the highest existing key
    fn load_outbox_sequence(db: &OptimisticTransactionDB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_OUTBOX)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_OUTBOX.to_string()))?;

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            let outbox_key = OutboxKey::from_bytes(&key)?;
            return Ok(outbox_key.id + 1);
        }
        Ok(1)
    }

    fn next_outbox_id(&self) -> u64 {
        self.outbox_sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    /// Stage a new outbox event inside `txn`.
    pub(crate) fn stage_event(
        &self,
        txn: &Transaction<'_, OptimisticTransactionDB>,
        new: NewOutboxEvent,
    ) -> Result<OutboxEvent, StorageError> {
        let outbox_cf = self.cf(CF_OUTBOX)?;
        let event = OutboxEvent::from_new(self.next_outbox_id(), new, Utc::now());
        txn.put_cf(outbox_cf, OutboxKey::new(event.id).to_bytes(), event.to_bytes()?)?;
        Ok(event)
    }

    /// Create or replace an entity and record the change in the outbox.
    ///
    /// The change kind is Add for a new entity and Update otherwise. Both
    /// writes commit together or not at all.
    pub fn put_entity(&self, record: &EntityRecord) -> Result<OutboxEvent, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let key = EntityKey::new(&record.entity_name, &record.entity_id)?.to_bytes();

        let txn = self.db.transaction();
        let existed = txn.get_for_update_cf(entities_cf, &key, true)?.is_some();
        txn.put_cf(entities_cf, &key, record.to_bytes()?)?;

        let change = if existed {
            ChangeKind::Update
        } else {
            ChangeKind::Add
        };
        let new = NewOutboxEvent::for_change(&record.entity_name, &record.entity_id, change)?
            .with_routing_key(record.routing_key.clone())
            .with_tenant(record.tenant_id.clone());
        let event = self.stage_event(&txn, new)?;
        txn.commit()?;

        debug!(
            entity = %record.entity_name,
            id = %record.entity_id,
            outbox_id = event.id,
            ?change,
            "Stored entity"
        );
        Ok(event)
    }

    /// Delete an entity and record the deletion in the outbox.
    ///
    /// A delete event is written even when the entity is already gone, so
    /// a stale document left in the index is still removed.
    pub fn delete_entity(
        &self,
        entity_name: &str,
        entity_id: &str,
    ) -> Result<OutboxEvent, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let key = EntityKey::new(entity_name, entity_id)?.to_bytes();

        let txn = self.db.transaction();
        let previous = txn
            .get_for_update_cf(entities_cf, &key, true)?
            .map(|bytes| EntityRecord::from_bytes(&bytes))
            .transpose()?;
        txn.delete_cf(entities_cf, &key)?;

        let new = NewOutboxEvent::for_change(entity_name, entity_id, ChangeKind::Delete)?
            .with_routing_key(previous.as_ref().and_then(|r| r.routing_key.clone()))
            .with_tenant(previous.as_ref().and_then(|r| r.tenant_id.clone()));
        let event = self.stage_event(&txn, new)?;
        txn.commit()?;

        debug!(entity = %entity_name, id = %entity_id, outbox_id = event.id, "Deleted entity");
        Ok(event)
    }

    /// Write an entity without recording a change. Used for seeding.
    pub fn put_entity_silently(&self, record: &EntityRecord) -> Result<(), StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let key = EntityKey::new(&record.entity_name, &record.entity_id)?.to_bytes();
        let txn = self.db.transaction();
        txn.put_cf(entities_cf, key, record.to_bytes()?)?;
        txn.commit()?;
        Ok(())
    }

    /// Get an entity by type and id
    pub fn get_entity(
        &self,
        entity_name: &str,
        entity_id: &str,
    ) -> Result<Option<EntityRecord>, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let key = EntityKey::new(entity_name, entity_id)?.to_bytes();
        match self.db.get_cf(entities_cf, key)? {
            Some(bytes) => Ok(Some(EntityRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of one entity type in key order, strictly after `after`.
    pub fn list_entity_ids(
        &self,
        entity_name: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let prefix = EntityKey::type_prefix(entity_name)?;
        let start = match after {
            Some(id) => EntityKey::new(entity_name, id)?.to_bytes(),
            None => prefix.clone(),
        };

        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(entities_cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if after.is_some() && *key == *start.as_slice() {
                continue;
            }
            ids.push(EntityKey::from_bytes(&key)?.entity_id);
            if ids.len() >= limit {
                break;
            }
        }
        Ok(ids)
    }

    /// Load entities by id; missing ids are skipped.
    pub fn get_entities(
        &self,
        entity_name: &str,
        ids: &[String],
    ) -> Result<Vec<EntityRecord>, StorageError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_entity(entity_name, id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Number of stored entities of one type
    pub fn count_entities(&self, entity_name: &str) -> Result<u64, StorageError> {
        let entities_cf = self.cf(CF_ENTITIES)?;
        let prefix = EntityKey::type_prefix(entity_name)?;
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(entities_cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Store a checkpoint for a job
    pub fn put_checkpoint(&self, job_name: &str, checkpoint_bytes: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let txn = self.db.transaction();
        txn.put_cf(cf, CheckpointKey::new(job_name).to_bytes(), checkpoint_bytes)?;
        txn.commit()?;
        Ok(())
    }

    /// Get a checkpoint for a job
    pub fn get_checkpoint(&self, job_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        Ok(self.db.get_cf(cf, CheckpointKey::new(job_name).to_bytes())?)
    }

    /// Remove a checkpoint
    pub fn delete_checkpoint(&self, job_name: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let txn = self.db.transaction();
        txn.delete_cf(cf, CheckpointKey::new(job_name).to_bytes())?;
        txn.commit()?;
        Ok(())
    }

    /// Decode every outbox event in id order.
    pub(crate) fn scan_outbox(
        &self,
        mut visit: impl FnMut(OutboxEvent) -> bool,
    ) -> Result<(), StorageError> {
        let cf = self.cf(CF_OUTBOX)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            if !visit(OutboxEvent::from_bytes(&value)?) {
                break;
            }
        }
        Ok(())
    }

    /// Flush all memtables to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for name in [CF_ENTITIES, CF_OUTBOX, CF_MEMBERS, CF_CHECKPOINTS] {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    /// Trigger manual compaction on all column families
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction");
        for name in [CF_ENTITIES, CF_OUTBOX, CF_MEMBERS, CF_CHECKPOINTS] {
            self.db
                .compact_range_cf(self.cf(name)?, None::<&[u8]>, None::<&[u8]>);
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        let entities_cf = self.cf(CF_ENTITIES)?;
        for item in self.db.iterator_cf(entities_cf, IteratorMode::Start) {
            item?;
            stats.entity_count += 1;
        }

        self.scan_outbox(|event| {
            match event.status {
                EventStatus::Pending => stats.pending_events += 1,
                EventStatus::Processing => stats.processing_events += 1,
                EventStatus::Aborted => stats.aborted_events += 1,
            }
            true
        })?;

        let members_cf = self.cf(CF_MEMBERS)?;
        for item in self.db.iterator_cf(members_cf, IteratorMode::Start) {
            item?;
            stats.member_count += 1;
        }

        Ok(stats)
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub entity_count: u64,
    pub pending_events: u64,
    pub processing_events: u64,
    pub aborted_events: u64,
    /// Known processor instances, live or not
    pub member_count: u64,
}
