//! Key encoding and decoding for the storage layer.
//!
//! Every key is a readable, prefix-tagged string so that RocksDB's
//! lexicographic order matches the scan order callers need:
//! - `outbox:{id:020}`: ascending event id
//! - `entity:{entity_name}:{entity_id}`: ids grouped per entity type
//! - `member:{instance_id}`
//! - `checkpoint:{job_name}`

use crate::error::StorageError;

/// Key for outbox events
/// Format: outbox:{id:020}
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutboxKey {
    pub id: u64,
}

impl OutboxKey {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("outbox:{:020}", self.id).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        let id = s
            .strip_prefix("outbox:")
            .ok_or_else(|| StorageError::Key(format!("Invalid outbox key format: {}", s)))?
            .parse()
            .map_err(|e| StorageError::Key(format!("Invalid outbox id: {}", e)))?;
        Ok(Self { id })
    }
}

/// Key for entity rows
/// Format: entity:{entity_name}:{entity_id}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKey {
    pub entity_name: String,
    pub entity_id: String,
}

impl EntityKey {
    /// Entity names may not contain `:`; ids may.
    pub fn new(entity_name: &str, entity_id: &str) -> Result<Self, StorageError> {
        validate_entity_name(entity_name)?;
        Ok(Self {
            entity_name: entity_name.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Prefix shared by every key of one entity type
    pub fn type_prefix(entity_name: &str) -> Result<Vec<u8>, StorageError> {
        validate_entity_name(entity_name)?;
        Ok(format!("entity:{}:", entity_name).into_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("entity:{}:{}", self.entity_name, self.entity_id).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
        let rest = s
            .strip_prefix("entity:")
            .ok_or_else(|| StorageError::Key(format!("Invalid entity key format: {}", s)))?;
        let (entity_name, entity_id) = rest
            .split_once(':')
            .ok_or_else(|| StorageError::Key(format!("Invalid entity key format: {}", s)))?;
        Ok(Self {
            entity_name: entity_name.to_string(),
            entity_id: entity_id.to_string(),
        })
    }
}

fn validate_entity_name(entity_name: &str) -> Result<(), StorageError> {
    if entity_name.is_empty() || entity_name.contains(':') {
        return Err(StorageError::Key(format!(
            "Invalid entity name: {:?}",
            entity_name
        )));
    }
    Ok(())
}

/// Key for membership heartbeats
/// Format: member:{instance_id}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberKey {
    pub instance_id: String,
}

impl MemberKey {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("member:{}", self.instance_id).into_bytes()
    }
}

/// Key for job checkpoints
/// Format: checkpoint:{job_name}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    pub job_name: String,
}

impl CheckpointKey {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("checkpoint:{}", self.job_name).into_bytes()
    }
}
