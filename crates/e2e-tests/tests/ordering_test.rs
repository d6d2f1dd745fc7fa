//! End-to-end ordering tests for the work orchestrator.
//!
//! Works for one document reach the backend in submission order whatever
//! the batching, parallelism and backend latency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use e2e_tests::{fast_orchestrator, INDEX};
use searchsync_indexing::{IndexingPlan, PerChangesetCommit, WorkOrchestrator};
use searchsync_search::{InMemoryBackend, LatencyJitter};
use searchsync_types::{Document, DocumentKey, Work, WorkOperation};

fn jittery_backend(max_ms: u64) -> Arc<InMemoryBackend> {
    Arc::new(InMemoryBackend::new(INDEX).with_latency(LatencyJitter::new(
        Duration::ZERO,
        Duration::from_millis(max_ms),
    )))
}

fn doc(id: &str, version: u64) -> Document {
    Document::new("book", id, json!({ "version": version }))
}

/// Random interleaving of adds, updates and deletes over a few documents.
#[tokio::test]
async fn test_random_sequences_apply_in_submission_order() {
    let backend = jittery_backend(3);
    let orchestrator = WorkOrchestrator::start(
        INDEX,
        backend.clone(),
        Arc::new(PerChangesetCommit),
        fast_orchestrator().with_max_batch_size(5).with_parallelism(4),
    );

    let ids: Vec<String> = (0..8).map(|n| format!("doc-{}", n)).collect();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut expected: HashMap<String, Vec<(WorkOperation, Option<u64>)>> = HashMap::new();
    let mut handles = Vec::new();

    for version in 0..200u64 {
        let id = &ids[rng.random_range(0..ids.len())];
        let work = match rng.random_range(0..3) {
            0 => Work::add(doc(id, version)),
            1 => Work::update(doc(id, version)),
            _ => Work::delete(id.clone(), None),
        };
        let recorded_version = work.payload.as_ref().map(|_| version);
        expected
            .entry(id.clone())
            .or_default()
            .push((work.operation, recorded_version));
        handles.push(orchestrator.submit(work).await.unwrap());
    }

    for handle in handles {
        handle.await.unwrap();
    }
    orchestrator.flush().await.unwrap();

    assert_eq!(backend.overlap_violations(), 0);
    let log = backend.applied_log();
    for (id, sequence) in &expected {
        let applied: Vec<(WorkOperation, Option<u64>)> = log
            .iter()
            .filter(|w| &w.document_id == id)
            .map(|w| {
                let version = w
                    .payload
                    .as_ref()
                    .and_then(|d| d.body["version"].as_u64());
                (w.operation, version)
            })
            .collect();
        assert_eq!(&applied, sequence, "order differs for {}", id);

        let key = DocumentKey::new(id.clone(), None);
        match sequence.last() {
            Some((WorkOperation::Delete, _)) => assert!(backend.document(&key).is_none()),
            Some((_, Some(version))) => {
                let stored = backend.document(&key).unwrap();
                assert_eq!(stored.body, json!({ "version": version }));
            }
            _ => unreachable!(),
        }
    }

    orchestrator.shutdown().await.unwrap();
}

/// ADD, UPDATE, DELETE of one document under jitter: the document ends up
/// absent and never comes back.
#[tokio::test]
async fn test_add_update_delete_scenario_leaves_document_absent() {
    for round in 0..10 {
        let backend = jittery_backend(10);
        let orchestrator = WorkOrchestrator::start(
            INDEX,
            backend.clone(),
            Arc::new(PerChangesetCommit),
            fast_orchestrator().with_max_batch_size(1),
        );

        let add = orchestrator.submit(Work::add(doc("doc1", 1))).await.unwrap();
        let update = orchestrator.submit(Work::update(doc("doc1", 2))).await.unwrap();
        let delete = orchestrator
            .submit(Work::delete("doc1", None))
            .await
            .unwrap();
        let (a, u, d) = tokio::join!(add, update, delete);
        a.unwrap();
        u.unwrap();
        d.unwrap();
        orchestrator.flush().await.unwrap();

        let key = DocumentKey::new("doc1", None);
        assert_eq!(
            backend.applied_for(&key),
            vec![
                WorkOperation::Add,
                WorkOperation::Update,
                WorkOperation::Delete
            ],
            "round {}",
            round
        );
        assert!(backend.document(&key).is_none(), "round {}", round);
        assert!(backend.applied_document(&key).is_none(), "round {}", round);

        orchestrator.shutdown().await.unwrap();
        assert!(backend.document(&key).is_none(), "round {}", round);
    }
}

/// Routing keys split documents that share an id.
#[tokio::test]
async fn test_routing_keys_are_distinct_documents() {
    let backend = jittery_backend(2);
    let orchestrator = WorkOrchestrator::start(
        INDEX,
        backend.clone(),
        Arc::new(PerChangesetCommit),
        fast_orchestrator(),
    );

    orchestrator
        .submit_and_wait(Work::add(doc("42", 1).with_routing_key("eu")))
        .await
        .unwrap();
    orchestrator
        .submit_and_wait(Work::add(doc("42", 2).with_routing_key("us")))
        .await
        .unwrap();
    orchestrator
        .submit_and_wait(Work::delete("42", Some("eu".to_string())))
        .await
        .unwrap();
    orchestrator.flush().await.unwrap();

    assert!(backend
        .document(&DocumentKey::new("42", Some("eu".to_string())))
        .is_none());
    let us = backend
        .document(&DocumentKey::new("42", Some("us".to_string())))
        .unwrap();
    assert_eq!(us.body, json!({ "version": 2 }));

    orchestrator.shutdown().await.unwrap();
}

/// A unit of work merged by the plan reaches the backend as one Work per
/// document.
#[tokio::test]
async fn test_plan_execution_submits_merged_works() {
    let backend = jittery_backend(2);
    let orchestrator = WorkOrchestrator::start(
        INDEX,
        backend.clone(),
        Arc::new(PerChangesetCommit),
        fast_orchestrator(),
    );

    let mut plan = IndexingPlan::new();
    plan.add(doc("d1", 1));
    plan.delete("d1", None);
    plan.delete("d2", None);
    plan.add(doc("d2", 2));
    plan.add(doc("d3", 3));
    plan.update(doc("d3", 4));

    let handles = plan.execute(&orchestrator).await.unwrap();
    assert_eq!(handles.len(), 3);
    for (_, handle) in handles {
        handle.await.unwrap();
    }
    orchestrator.flush().await.unwrap();

    assert_eq!(
        backend.applied_for(&DocumentKey::new("d1", None)),
        vec![WorkOperation::Delete]
    );
    assert_eq!(
        backend.applied_for(&DocumentKey::new("d2", None)),
        vec![WorkOperation::Add]
    );
    assert_eq!(
        backend.applied_for(&DocumentKey::new("d3", None)),
        vec![WorkOperation::Add]
    );
    let d3 = backend.document(&DocumentKey::new("d3", None)).unwrap();
    assert_eq!(d3.body, json!({ "version": 4 }));
    assert!(plan.is_empty());
    assert!(backend.refresh_count() >= 1);

    orchestrator.shutdown().await.unwrap();
}
