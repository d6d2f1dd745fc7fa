//! Document builders: entity records to index documents.

use std::fmt::Debug;

use searchsync_types::{Document, EntityRecord};
use serde_json::{Map, Value};

use crate::error::IndexingError;

/// Turns an entity into the document indexed for it.
pub trait DocumentBuilder: Send + Sync + Debug {
    fn build(&self, entity: &EntityRecord) -> Result<Document, IndexingError>;
}

/// Indexes an entity's JSON object as the document body.
///
/// With a field list, only those top-level fields are kept. Entities whose
/// data is not a JSON object are rejected.
#[derive(Debug, Clone, Default)]
pub struct JsonDocumentBuilder {
    fields: Option<Vec<String>>,
}

impl JsonDocumentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

impl DocumentBuilder for JsonDocumentBuilder {
    fn build(&self, entity: &EntityRecord) -> Result<Document, IndexingError> {
        let Value::Object(object) = &entity.data else {
            return Err(IndexingError::Build {
                entity: entity.entity_name.clone(),
                id: entity.entity_id.clone(),
                reason: "entity data is not a JSON object".to_string(),
            });
        };

        let body = match &self.fields {
            None => Value::Object(object.clone()),
            Some(fields) => {
                let selected: Map<String, Value> = fields
                    .iter()
                    .filter_map(|f| object.get(f).map(|v| (f.clone(), v.clone())))
                    .collect();
                Value::Object(selected)
            }
        };

        let mut document = Document::new(&entity.entity_name, &entity.entity_id, body);
        document.routing_key = entity.routing_key.clone();
        Ok(document)
    }
}
