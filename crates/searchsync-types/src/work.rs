//! Work: the unit of index mutation.
//!
//! A Work targets one document identity, `(document_id, routing_key)`,
//! within one index. Works for the same identity must reach the backend
//! in the order they were submitted; the orchestrator enforces this by
//! bucketing on [`DocumentKey`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of index mutation carried by a [`Work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOperation {
    /// Insert the document, replacing any document with the same key
    Add,
    /// Replace the document with a new version
    Update,
    /// Remove the document with this exact key
    Delete,
    /// Remove every document carrying this id, whatever its routing key
    Purge,
    /// Remove every document of the index
    PurgeAll,
}

impl WorkOperation {
    /// Whether this operation carries a document payload.
    pub fn carries_payload(&self) -> bool {
        matches!(self, WorkOperation::Add | WorkOperation::Update)
    }
}

impl fmt::Display for WorkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkOperation::Add => "add",
            WorkOperation::Update => "update",
            WorkOperation::Delete => "delete",
            WorkOperation::Purge => "purge",
            WorkOperation::PurgeAll => "purge_all",
        };
        f.write_str(s)
    }
}

/// Identity of a document within an index.
///
/// Two documents with the same id but different routing keys are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub document_id: String,
    pub routing_key: Option<String>,
}

impl DocumentKey {
    pub fn new(document_id: impl Into<String>, routing_key: Option<String>) -> Self {
        Self {
            document_id: document_id.into(),
            routing_key,
        }
    }

    /// Flat string form used as the backend's unique term.
    ///
    /// Format: `{len}:{document_id}` or `{len}:{document_id}@{routing_key}`,
    /// where `len` is the byte length of the id. The prefix keeps ids that
    /// contain `@` from colliding with routed keys.
    pub fn encoded(&self) -> String {
        match &self.routing_key {
            Some(routing) => format!("{}:{}@{}", self.document_id.len(), self.document_id, routing),
            None => format!("{}:{}", self.document_id.len(), self.document_id),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.routing_key {
            Some(routing) => write!(f, "{}@{}", self.document_id, routing),
            None => f.write_str(&self.document_id),
        }
    }
}

/// A document produced by the document builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Entity type the document was built from
    pub entity_name: String,
    /// Document id (the entity id)
    pub id: String,
    /// Optional routing key
    #[serde(default)]
    pub routing_key: Option<String>,
    /// Indexed fields
    pub body: serde_json::Value,
}

impl Document {
    pub fn new(entity_name: impl Into<String>, id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: id.into(),
            routing_key: None,
            body,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey::new(self.id.clone(), self.routing_key.clone())
    }
}

/// One index mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub operation: WorkOperation,
    /// Empty for [`WorkOperation::PurgeAll`]
    pub document_id: String,
    #[serde(default)]
    pub routing_key: Option<String>,
    /// Present for Add and Update only
    #[serde(default)]
    pub payload: Option<Document>,
}

impl Work {
    pub fn add(document: Document) -> Self {
        Self::with_payload(WorkOperation::Add, document)
    }

    pub fn update(document: Document) -> Self {
        Self::with_payload(WorkOperation::Update, document)
    }

    pub fn delete(document_id: impl Into<String>, routing_key: Option<String>) -> Self {
        Self {
            operation: WorkOperation::Delete,
            document_id: document_id.into(),
            routing_key,
            payload: None,
        }
    }

    pub fn purge(document_id: impl Into<String>, routing_key: Option<String>) -> Self {
        Self {
            operation: WorkOperation::Purge,
            document_id: document_id.into(),
            routing_key,
            payload: None,
        }
    }

    pub fn purge_all() -> Self {
        Self {
            operation: WorkOperation::PurgeAll,
            document_id: String::new(),
            routing_key: None,
            payload: None,
        }
    }

    fn with_payload(operation: WorkOperation, document: Document) -> Self {
        Self {
            operation,
            document_id: document.id.clone(),
            routing_key: document.routing_key.clone(),
            payload: Some(document),
        }
    }

    /// Bucket key, or `None` for index-wide operations.
    pub fn key(&self) -> Option<DocumentKey> {
        match self.operation {
            WorkOperation::PurgeAll => None,
            _ => Some(DocumentKey::new(
                self.document_id.clone(),
                self.routing_key.clone(),
            )),
        }
    }

    pub fn is_purge_all(&self) -> bool {
        self.operation == WorkOperation::PurgeAll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_takes_identity_from_document() {
        let doc = Document::new("book", "7", json!({"title": "Dune"})).with_routing_key("tenant-a");
        let work = Work::add(doc);

        assert_eq!(work.operation, WorkOperation::Add);
        assert_eq!(work.document_id, "7");
        assert_eq!(work.routing_key.as_deref(), Some("tenant-a"));
        assert!(work.payload.is_some());
    }

    #[test]
    fn test_purge_all_has_no_bucket() {
        assert!(Work::purge_all().key().is_none());
        assert!(Work::purge_all().is_purge_all());
    }

    #[test]
    fn test_routing_key_distinguishes_buckets() {
        let a = Work::delete("1", None).key().unwrap();
        let b = Work::delete("1", Some("r".to_string())).key().unwrap();
        assert_ne!(a, b);
        assert_eq!(b.encoded(), "1:1@r");
        assert_eq!(a.encoded(), "1:1");
    }

    #[test]
    fn test_encoded_key_separates_at_sign_ids_from_routed_keys() {
        let email = DocumentKey::new("alice@example.com", None);
        let routed = DocumentKey::new("alice", Some("example.com".to_string()));
        assert_ne!(email.encoded(), routed.encoded());

        let empty_routing = DocumentKey::new("a", Some(String::new()));
        let plain = DocumentKey::new("a@", None);
        assert_ne!(empty_routing.encoded(), plain.encoded());
    }

    #[test]
    fn test_carries_payload() {
        assert!(WorkOperation::Add.carries_payload());
        assert!(WorkOperation::Update.carries_payload());
        assert!(!WorkOperation::Delete.carries_payload());
        assert!(!WorkOperation::PurgeAll.carries_payload());
    }
}
