//! Integration tests for the dependency graph and its executor
//!
//! These run graphs against the in-memory store and assert on the exact
//! sequence of store calls.

use kube::api::PropagationPolicy;
use serde_json::json;

use dataprotection_operator::error::{Error, StoreError};
use dataprotection_operator::model::{
    DependencyGraph, GraphExecutor, GraphOptions, KubeObject, ObjectKey, ObjectKind, Vertex,
    VertexAction,
};
use dataprotection_operator::store::memory::{MemoryStore, Verb};

// ============================================================================
// Test Helpers
// ============================================================================

fn cron_job(name: &str, schedule: &str) -> KubeObject {
    KubeObject::from_value(
        ObjectKind::CronJob,
        json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": {"name": name, "namespace": "db", "labels": {"app": "backup"}},
            "spec": {"schedule": schedule, "concurrencyPolicy": "Forbid"}
        }),
    )
    .unwrap()
}

fn backup(name: &str, method: &str) -> KubeObject {
    KubeObject::from_value(
        ObjectKind::Backup,
        json!({
            "apiVersion": "dataprotection.dbops.io/v1alpha1",
            "kind": "Backup",
            "metadata": {"name": name, "namespace": "db"},
            "spec": {"backupPolicyName": "mysql-policy", "backupMethod": method}
        }),
    )
    .unwrap()
}

fn write_trace(store: &MemoryStore) -> Vec<(Verb, String)> {
    store
        .writes()
        .into_iter()
        .map(|call| (call.verb, call.key.name.clone()))
        .collect()
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn reapplying_a_graph_makes_no_writes() {
    let store = MemoryStore::new();
    let existing = store.insert(cron_job("weekly", "0 1 * * 0")).unwrap();
    let stale = store.insert(cron_job("stale", "0 2 * * *")).unwrap();

    let mut graph = DependencyGraph::new();
    let created = graph.add_vertex(Vertex::create(
        cron_job("nightly", "0 3 * * *"),
        GraphOptions::default(),
    ));
    let patched = graph.add_vertex(
        Vertex::patch(
            existing.clone(),
            cron_job("weekly", "0 4 * * 0"),
            GraphOptions::default(),
        )
        .unwrap(),
    );
    let deleted = graph.add_vertex(Vertex::delete(stale, GraphOptions::default()));
    graph.add_edge(&deleted, &created).unwrap();
    graph.add_edge(&deleted, &patched).unwrap();

    let executor = GraphExecutor::new(&store);
    assert_eq!(executor.apply(&mut graph).await.unwrap(), 3);

    store.clear_calls();
    assert_eq!(executor.apply(&mut graph).await.unwrap(), 0);
    assert!(store.writes().is_empty());
}

// ============================================================================
// Topological Order
// ============================================================================

#[tokio::test]
async fn dependencies_are_written_first() {
    let store = MemoryStore::new();
    let mut graph = DependencyGraph::new();
    let a = graph.add_vertex(Vertex::create(cron_job("a", "0 1 * * *"), GraphOptions::default()));
    let b = graph.add_vertex(Vertex::create(cron_job("b", "0 2 * * *"), GraphOptions::default()));
    let c = graph.add_vertex(Vertex::create(cron_job("c", "0 3 * * *"), GraphOptions::default()));
    // a needs b, b needs c
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&b, &c).unwrap();

    GraphExecutor::new(&store).apply(&mut graph).await.unwrap();

    assert_eq!(
        write_trace(&store),
        vec![
            (Verb::Create, "c".to_string()),
            (Verb::Create, "b".to_string()),
            (Verb::Create, "a".to_string()),
        ]
    );
}

#[test]
fn independent_vertices_keep_insertion_order() {
    let mut graph = DependencyGraph::new();
    for name in ["x", "y", "z"] {
        graph.add_vertex(Vertex::create(cron_job(name, "0 1 * * *"), GraphOptions::default()));
    }
    let order: Vec<String> = graph
        .topo_order()
        .unwrap()
        .into_iter()
        .map(|k| k.name)
        .collect();
    assert_eq!(order, vec!["x", "y", "z"]);
}

// ============================================================================
// Acyclicity
// ============================================================================

#[tokio::test]
async fn cycles_are_rejected_before_any_call() {
    let store = MemoryStore::new();
    let mut graph = DependencyGraph::new();
    let a = graph.add_vertex(Vertex::create(cron_job("a", "0 1 * * *"), GraphOptions::default()));
    let b = graph.add_vertex(Vertex::create(cron_job("b", "0 2 * * *"), GraphOptions::default()));
    let c = graph.add_vertex(Vertex::create(cron_job("c", "0 3 * * *"), GraphOptions::default()));
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&b, &c).unwrap();

    let err = graph.add_edge(&c, &a).unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    let err = graph.add_edge(&a, &a).unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));

    // The graph is still usable after a rejected edge
    GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
    assert_eq!(store.len(), 3);
}

#[test]
fn edges_to_unknown_vertices_are_rejected() {
    let mut graph = DependencyGraph::new();
    let a = graph.add_vertex(Vertex::create(cron_job("a", "0 1 * * *"), GraphOptions::default()));
    let ghost = ObjectKey::new(ObjectKind::CronJob, "db", "ghost");
    assert!(matches!(
        graph.add_edge(&a, &ghost),
        Err(Error::VertexNotFound(_))
    ));
}

// ============================================================================
// Create Conflict Resolution
// ============================================================================

#[tokio::test]
async fn create_conflict_with_replace_issues_exactly_one_update() {
    let store = MemoryStore::new();
    store.insert(backup("nightly-binlog", "binlog")).unwrap();

    let mut desired = backup("nightly-binlog", "binlog");
    desired.object.data["spec"]["retentionPeriod"] = json!("30d");
    let mut graph = DependencyGraph::new();
    let key = graph.add_vertex(Vertex::create(
        desired,
        GraphOptions::default().replace_if_existing(),
    ));

    let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
    assert_eq!(applied, 1);

    let verbs: Vec<Verb> = store.calls().into_iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Create, Verb::Get, Verb::Update]);
    let stored = store.object(&key).unwrap();
    assert_eq!(stored.object.data["spec"]["retentionPeriod"], json!("30d"));
}

#[tokio::test]
async fn create_conflict_with_matching_object_makes_no_update() {
    let store = MemoryStore::new();
    store.insert(backup("nightly-binlog", "binlog")).unwrap();

    let mut graph = DependencyGraph::new();
    graph.add_vertex(Vertex::create(
        backup("nightly-binlog", "binlog"),
        GraphOptions::default().replace_if_existing(),
    ));

    let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
    assert_eq!(applied, 0);
    let verbs: Vec<Verb> = store.calls().into_iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Create, Verb::Get]);
}

#[tokio::test]
async fn update_conflict_fails_only_that_vertex() {
    let store = MemoryStore::new();
    let stale = store.insert(cron_job("a", "0 1 * * *")).unwrap();
    // Someone else writes after we read
    store.insert(cron_job("a", "0 9 * * *")).unwrap();

    let mut graph = DependencyGraph::new();
    graph.add_vertex(
        Vertex::update(stale, cron_job("a", "0 2 * * *"), GraphOptions::default()).unwrap(),
    );
    let other = graph.add_vertex(Vertex::create(cron_job("b", "0 3 * * *"), GraphOptions::default()));

    let err = GraphExecutor::new(&store)
        .apply(&mut graph)
        .await
        .unwrap_err();
    assert!(err.is_requeue(), "conflicts are retried, got {}", err);
    match err {
        Error::Apply { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, StoreError::Conflict { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(store.object(&other).is_some());
}

// ============================================================================
// Deletion Idempotence
// ============================================================================

#[tokio::test]
async fn deleting_an_absent_object_succeeds() {
    let store = MemoryStore::new();
    let gone = cron_job("gone", "0 1 * * *");
    let options = GraphOptions::default().with_propagation_policy(PropagationPolicy::Foreground);

    let mut graph = DependencyGraph::new();
    let key = graph.add_vertex(Vertex::delete(gone, options));
    let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
    assert_eq!(applied, 0);

    let calls = store.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].verb, Verb::Delete);
    assert!(matches!(
        calls[0].propagation,
        Some(PropagationPolicy::Foreground)
    ));

    // Once applied, the vertex holds neither side and issues nothing more
    let vertex = graph.get(&key).unwrap();
    assert!(vertex.observed.is_none() && vertex.desired.is_none());
    store.clear_calls();
    GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
    assert!(store.calls().is_empty());
}

// ============================================================================
// Status Patch Minimality
// ============================================================================

#[tokio::test]
async fn status_patch_sends_only_changed_fields() {
    let store = MemoryStore::new();
    let mut seeded = backup("nightly-full", "xtrabackup");
    seeded.object.data["status"] = json!({"phase": "Running", "failureReason": "none"});
    let observed = store.insert(seeded).unwrap();

    let mut desired = observed.clone();
    desired.object.data["status"] = json!({"phase": "Running"});

    let mut graph = DependencyGraph::new();
    graph.add_vertex(Vertex::status_patch(observed, desired, GraphOptions::default()).unwrap());
    GraphExecutor::new(&store).apply(&mut graph).await.unwrap();

    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].verb, Verb::PatchSubresource);
    assert_eq!(
        writes[0].body,
        Some(json!({"status": {"failureReason": null}}))
    );
}

#[test]
fn vertex_identity_comes_from_either_side() {
    let vertex = Vertex::new(
        Some(cron_job("a", "0 1 * * *")),
        None,
        VertexAction::Delete,
        GraphOptions::default(),
    )
    .unwrap();
    assert_eq!(vertex.key().name, "a");

    let mismatched = Vertex::update(
        cron_job("a", "0 1 * * *"),
        cron_job("b", "0 1 * * *"),
        GraphOptions::default(),
    );
    assert!(matches!(mismatched, Err(Error::InvalidVertex { .. })));
}
