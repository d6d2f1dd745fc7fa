//! Tantivy schema for synchronized documents.
//!
//! Every document carries its identity (`doc_key`, `doc_id`, `routing`),
//! the entity type it came from, the stored JSON body, and a full-text
//! field built from the body's string values.

use tantivy::schema::{Field, Schema, STORED, STRING, TEXT};

use crate::SearchError;

/// Schema field handles for efficient access
#[derive(Debug, Clone)]
pub struct SyncSchema {
    schema: Schema,
    /// Unique document key: `{id}` or `{id}@{routing}` (STRING | STORED)
    pub doc_key: Field,
    /// Document id without routing, used by purge (STRING | STORED)
    pub doc_id: Field,
    /// Routing key, empty when absent (STRING | STORED)
    pub routing: Field,
    /// Entity type (STRING | STORED)
    pub entity: Field,
    /// JSON body (STORED)
    pub body: Field,
    /// Searchable text extracted from the body (TEXT)
    pub text: Field,
}

impl SyncSchema {
    /// Get the underlying Tantivy schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Create a SyncSchema from an existing Tantivy Schema
    pub fn from_schema(schema: Schema) -> Result<Self, SearchError> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| SearchError::SchemaMismatch(format!("missing {} field", name)))
        };
        Ok(Self {
            doc_key: field("doc_key")?,
            doc_id: field("doc_id")?,
            routing: field("routing")?,
            entity: field("entity")?,
            body: field("body")?,
            text: field("text")?,
            schema,
        })
    }
}

/// Build the schema used by every synchronized index.
pub fn build_sync_schema() -> SyncSchema {
    let mut builder = Schema::builder();

    let doc_key = builder.add_text_field("doc_key", STRING | STORED);
    let doc_id = builder.add_text_field("doc_id", STRING | STORED);
    let routing = builder.add_text_field("routing", STRING | STORED);
    let entity = builder.add_text_field("entity", STRING | STORED);
    let body = builder.add_text_field("body", STORED);
    let text = builder.add_text_field("text", TEXT);

    SyncSchema {
        schema: builder.build(),
        doc_key,
        doc_id,
        routing,
        entity,
        body,
        text,
    }
}

/// Concatenate every string value in a JSON tree, depth first.
pub fn extract_text(value: &serde_json::Value) -> String {
    fn walk(value: &serde_json::Value, out: &mut Vec<String>) {
        match value {
            serde_json::Value::String(s) => out.push(s.clone()),
            serde_json::Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            serde_json::Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            serde_json::Value::Number(n) => out.push(n.to_string()),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join(" ")
}
