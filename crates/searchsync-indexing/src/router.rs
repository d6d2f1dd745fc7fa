//! Routes entity types to their index orchestrator and document builder.

use std::collections::HashMap;
use std::sync::Arc;

use searchsync_types::{Document, EntityRecord};
use tracing::{info, warn};

use crate::document::DocumentBuilder;
use crate::error::IndexingError;
use crate::orchestrator::WorkOrchestrator;

#[derive(Debug, Clone)]
struct Route {
    index: String,
    builder: Arc<dyn DocumentBuilder>,
}

/// Entity type to index mapping, owning one orchestrator per index.
///
/// Several entity types may share an index.
#[derive(Default)]
pub struct IndexRouter {
    orchestrators: HashMap<String, Arc<WorkOrchestrator>>,
    routes: HashMap<String, Route>,
}

impl IndexRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the orchestrator for an index.
    pub fn add_index(&mut self, orchestrator: Arc<WorkOrchestrator>) {
        let name = orchestrator.index_name().to_string();
        if self.orchestrators.insert(name.clone(), orchestrator).is_some() {
            warn!(index = %name, "Replaced orchestrator for index");
        }
    }

    /// Send `entity_type` to `index`, building documents with `builder`.
    pub fn route(
        &mut self,
        entity_type: impl Into<String>,
        index: impl Into<String>,
        builder: Arc<dyn DocumentBuilder>,
    ) -> Result<(), IndexingError> {
        let entity_type = entity_type.into();
        let index = index.into();
        if !self.orchestrators.contains_key(&index) {
            return Err(IndexingError::Config(format!(
                "entity type {} routed to unknown index {}",
                entity_type, index
            )));
        }
        info!(entity = %entity_type, index = %index, "Routed entity type");
        self.routes.insert(entity_type, Route { index, builder });
        Ok(())
    }

    fn route_for(&self, entity_type: &str) -> Result<&Route, IndexingError> {
        self.routes
            .get(entity_type)
            .ok_or_else(|| IndexingError::UnknownEntity(entity_type.to_string()))
    }

    pub fn index_for(&self, entity_type: &str) -> Result<&str, IndexingError> {
        Ok(&self.route_for(entity_type)?.index)
    }

    pub fn orchestrator(&self, index: &str) -> Result<&Arc<WorkOrchestrator>, IndexingError> {
        self.orchestrators
            .get(index)
            .ok_or_else(|| IndexingError::Config(format!("no orchestrator for index {}", index)))
    }

    pub fn orchestrator_for(
        &self,
        entity_type: &str,
    ) -> Result<&Arc<WorkOrchestrator>, IndexingError> {
        let index = self.index_for(entity_type)?;
        self.orchestrator(index)
    }

    /// Build the document for `entity` with its type's builder.
    pub fn build(&self, entity: &EntityRecord) -> Result<Document, IndexingError> {
        self.route_for(&entity.entity_name)?.builder.build(entity)
    }

    /// Routed entity types, sorted.
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn orchestrators(&self) -> impl Iterator<Item = &Arc<WorkOrchestrator>> {
        self.orchestrators.values()
    }

    /// Flush every index: apply, commit and refresh what was submitted.
    pub async fn flush_all(&self) -> Result<(), IndexingError> {
        for orchestrator in self.orchestrators.values() {
            orchestrator.flush().await?;
        }
        Ok(())
    }

    /// Shut down every orchestrator.
    pub async fn shutdown(&self) -> Result<(), IndexingError> {
        for orchestrator in self.orchestrators.values() {
            orchestrator.shutdown().await?;
        }
        Ok(())
    }
}
