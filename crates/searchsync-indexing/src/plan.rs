//! Indexing plan: per-unit-of-work accumulator of Works.
//!
//! Operations recorded against the same document collapse into the one
//! Work that reproduces their combined effect:
//!
//! | first  | then   | result                   |
//! |--------|--------|--------------------------|
//! | add    | update | add, newer payload       |
//! | add    | delete | delete                   |
//! | update | delete | delete                   |
//! | delete | add    | add                      |
//! | other  | other  | the later operation      |
//!
//! A purge removes the document under every routing key, so it discards
//! pending Works for that id whatever their routing. A purge-all discards
//! every pending Work. Operations recorded after either are kept and
//! flushed after them.

use std::collections::HashMap;

use searchsync_types::{Document, DocumentKey, Work, WorkOperation};

use crate::error::IndexingError;
use crate::orchestrator::{WorkHandle, WorkOrchestrator};

/// Accumulates and merges Works for one index.
#[derive(Debug, Default)]
pub struct IndexingPlan {
    purge_all: bool,
    purges: Vec<Work>,
    pending: HashMap<DocumentKey, Work>,
    /// First-touch order of pending keys
    order: Vec<DocumentKey>,
}

impl IndexingPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, document: Document) {
        self.record(Work::add(document));
    }

    pub fn update(&mut self, document: Document) {
        self.record(Work::update(document));
    }

    pub fn delete(&mut self, document_id: impl Into<String>, routing_key: Option<String>) {
        self.record(Work::delete(document_id, routing_key));
    }

    pub fn purge(&mut self, document_id: impl Into<String>, routing_key: Option<String>) {
        self.record(Work::purge(document_id, routing_key));
    }

    pub fn purge_all(&mut self) {
        self.purge_all = true;
        self.purges.clear();
        self.pending.clear();
        self.order.clear();
    }

    /// Record any Work, merging it with what is already pending.
    pub fn record(&mut self, work: Work) {
        let Some(key) = work.key() else {
            self.purge_all();
            return;
        };
        if work.operation == WorkOperation::Purge {
            let id = work.document_id.clone();
            self.pending.retain(|k, _| k.document_id != id);
            self.order.retain(|k| k.document_id != id);
            if !self.purges.iter().any(|p| p.document_id == id) {
                self.purges.push(work);
            }
            return;
        }

        match self.pending.get_mut(&key) {
            Some(existing) => *existing = merge(existing, work),
            None => {
                self.order.push(key.clone());
                self.pending.insert(key, work);
            }
        }
    }

    /// Number of Works a flush would produce.
    pub fn len(&self) -> usize {
        self.pending.len() + self.purges.len() + usize::from(self.purge_all)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the plan: purge-all first if recorded, then purges, then
    /// per-document Works in first-touch order. Flushing an empty plan
    /// yields nothing.
    pub fn flush(&mut self) -> Vec<Work> {
        let mut works = Vec::with_capacity(self.len());
        if std::mem::take(&mut self.purge_all) {
            works.push(Work::purge_all());
        }
        works.append(&mut self.purges);
        for key in self.order.drain(..) {
            if let Some(work) = self.pending.remove(&key) {
                works.push(work);
            }
        }
        works
    }

    /// Flush and submit every Work to `orchestrator`.
    ///
    /// Waits for queue capacity but not for the Works to be applied; await
    /// the returned handles for that.
    pub async fn execute(
        &mut self,
        orchestrator: &WorkOrchestrator,
    ) -> Result<Vec<(Work, WorkHandle)>, IndexingError> {
        let mut handles = Vec::with_capacity(self.len());
        for work in self.flush() {
            let handle = orchestrator.submit(work.clone()).await?;
            handles.push((work, handle));
        }
        Ok(handles)
    }
}

fn merge(existing: &Work, next: Work) -> Work {
    use WorkOperation::*;

    match (existing.operation, next.operation) {
        (Add, Update) => Work {
            operation: Add,
            ..next
        },
        _ => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, v: i64) -> Document {
        Document::new("book", id, json!({ "v": v }))
    }

    fn single(plan: &mut IndexingPlan) -> Work {
        let mut works = plan.flush();
        assert_eq!(works.len(), 1, "expected one merged work, got {:?}", works);
        works.remove(0)
    }

    #[test]
    fn test_add_then_delete_is_delete() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("1", 1));
        plan.delete("1", None);
        assert_eq!(single(&mut plan).operation, WorkOperation::Delete);
    }

    #[test]
    fn test_delete_then_add_is_add() {
        let mut plan = IndexingPlan::new();
        plan.delete("1", None);
        plan.add(doc("1", 2));
        let work = single(&mut plan);
        assert_eq!(work.operation, WorkOperation::Add);
        assert_eq!(work.payload.unwrap().body, json!({"v": 2}));
    }

    #[test]
    fn test_update_then_delete_is_delete() {
        let mut plan = IndexingPlan::new();
        plan.update(doc("1", 1));
        plan.delete("1", None);
        assert_eq!(single(&mut plan).operation, WorkOperation::Delete);
    }

    #[test]
    fn test_add_then_update_keeps_add_with_newer_payload() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("1", 1));
        plan.update(doc("1", 2));
        let work = single(&mut plan);
        assert_eq!(work.operation, WorkOperation::Add);
        assert_eq!(work.payload.unwrap().body, json!({"v": 2}));
    }

    #[test]
    fn test_routing_keys_are_separate_documents() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("1", 1).with_routing_key("a"));
        plan.delete("1", Some("b".to_string()));
        assert_eq!(plan.flush().len(), 2);
    }

    #[test]
    fn test_purge_all_discards_earlier_and_keeps_later() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("1", 1));
        plan.add(doc("2", 1));
        plan.purge_all();
        plan.add(doc("3", 1));

        let works = plan.flush();
        assert_eq!(works.len(), 2);
        assert!(works[0].is_purge_all());
        assert_eq!(works[1].document_id, "3");
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut plan = IndexingPlan::new();
        assert!(plan.flush().is_empty());

        plan.add(doc("1", 1));
        assert_eq!(plan.flush().len(), 1);
        assert!(plan.flush().is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_first_touch_order() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("b", 1));
        plan.add(doc("a", 1));
        plan.update(doc("b", 2));

        let ids: Vec<String> = plan.flush().into_iter().map(|w| w.document_id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_purge_discards_every_routing_and_precedes_later_adds() {
        let mut plan = IndexingPlan::new();
        plan.add(doc("1", 1).with_routing_key("a"));
        plan.add(doc("1", 1).with_routing_key("b"));
        plan.add(doc("2", 1));
        plan.purge("1", None);
        plan.add(doc("1", 2).with_routing_key("a"));

        let works = plan.flush();
        let ops: Vec<(WorkOperation, &str)> = works
            .iter()
            .map(|w| (w.operation, w.document_id.as_str()))
            .collect();
        assert_eq!(
            ops,
            vec![
                (WorkOperation::Purge, "1"),
                (WorkOperation::Add, "2"),
                (WorkOperation::Add, "1"),
            ]
        );
    }

    #[test]
    fn test_any_then_purge_is_purge() {
        let mut plan = IndexingPlan::new();
        plan.update(doc("1", 1));
        plan.purge("1", None);
        assert_eq!(single(&mut plan).operation, WorkOperation::Purge);
    }
}
