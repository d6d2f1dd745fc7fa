//! Outbox event types.
//!
//! Outbox events are written in the same transaction as the entity
//! mutation they describe. Processors on any instance claim them with an
//! optimistic lock, turn them into Works and delete them on success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be claimed once `process_after` has passed
    Pending,
    /// Claimed by a processor
    Processing,
    /// Retry budget exhausted; only an operator can bring it back
    Aborted,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Aborted => "aborted",
        }
    }
}

/// Kind of entity change recorded in an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// Serialized payload of an outbox event.
///
/// Add and Update are resolved against the entity's state at processing
/// time, so the payload itself never carries the entity body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub change: ChangeKind,
}

impl ChangeDescriptor {
    pub fn new(change: ChangeKind) -> Self {
        Self { change }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An event as supplied by the writer, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub entity_name: String,
    pub entity_id: String,
    pub routing_key: Option<String>,
    pub tenant_id: Option<String>,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    /// Event describing `change` to the given entity.
    pub fn for_change(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        change: ChangeKind,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
            routing_key: None,
            tenant_id: None,
            payload: ChangeDescriptor::new(change).to_bytes()?,
        })
    }

    pub fn with_routing_key(mut self, routing_key: Option<String>) -> Self {
        self.routing_key = routing_key;
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

/// A durable outbox event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic, unique id assigned by the store
    pub id: u64,
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Serialized [`ChangeDescriptor`]
    pub payload: Vec<u8>,
    pub status: EventStatus,
    /// Only ever increases
    pub retry_count: u32,
    /// `retry_count` at the last operator reprocess; the retry budget counts from here
    #[serde(default)]
    pub retry_floor: u32,
    /// Not eligible for polling before this instant
    pub process_after: DateTime<Utc>,
    /// Optimistic-lock version, bumped on every transition
    pub version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Materialize a new pending event.
    pub fn from_new(id: u64, new: NewOutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_name: new.entity_name,
            entity_id: new.entity_id,
            routing_key: new.routing_key,
            tenant_id: new.tenant_id,
            payload: new.payload,
            status: EventStatus::Pending,
            retry_count: 0,
            retry_floor: 0,
            process_after: now,
            version: 0,
            created_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
        }
    }

    /// Failed attempts counted against the current retry budget.
    pub fn budgeted_retries(&self) -> u32 {
        self.retry_count.saturating_sub(self.retry_floor)
    }

    /// Decode the payload.
    pub fn change(&self) -> Result<ChangeDescriptor, serde_json::Error> {
        ChangeDescriptor::from_bytes(&self.payload)
    }

    pub fn belongs_to_tenant(&self, tenant_id: Option<&str>) -> bool {
        match tenant_id {
            Some(tenant) => self.tenant_id.as_deref() == Some(tenant),
            None => true,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
