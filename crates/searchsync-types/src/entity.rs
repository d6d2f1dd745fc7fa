//! Entity records from the system of record.

use serde::{Deserialize, Serialize};

/// One entity as loaded from the system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Entity state as JSON
    pub data: serde_json::Value,
}

impl EntityRecord {
    pub fn new(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
            routing_key: None,
            tenant_id: None,
            data,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
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
