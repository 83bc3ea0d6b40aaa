//! Graph executor: applies a dependency graph against the object store
//!
//! Vertices are applied one at a time in topological order. A failing
//! vertex does not roll back what was already applied; everything that
//! depends on it is skipped for this pass and the failures are reported
//! together. The next reconciliation re-reads state and picks up from there.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, StoreError, VertexFailure};
use crate::metrics;
use crate::model::{merge_diff, DependencyGraph, KubeObject, Vertex, VertexAction};
use crate::store::{ObjectStore, StoreResult};

const STATUS_SUBRESOURCE: &str = "status";

/// Applies graphs through an [`ObjectStore`]
pub struct GraphExecutor<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> GraphExecutor<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Apply every vertex in dependency order.
    ///
    /// Returns the number of vertices that changed the store. After a
    /// successful write the vertex's `observed` side holds the store's
    /// answer, so applying the same graph again is a no-op.
    ///
    /// # Errors
    ///
    /// `CycleDetected` before any call is made if the graph has a cycle;
    /// `Apply` listing the failed vertices if any vertex failed.
    pub async fn apply(&self, graph: &mut DependencyGraph) -> Result<usize> {
        let order = graph.topo_order()?;

        let mut applied = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();
        let mut blocked = HashSet::new();

        for key in order {
            let dependencies = graph.dependencies_of(&key)?;
            if let Some(dependency) = dependencies.iter().find(|d| blocked.contains(*d)) {
                debug!(object = %key, dependency = %dependency, "Skipping vertex, dependency failed");
                blocked.insert(key);
                skipped += 1;
                continue;
            }

            let Some(vertex) = graph.get_mut(&key) else {
                continue;
            };
            let action = vertex.action;
            match self.apply_vertex(vertex).await {
                Ok(true) => {
                    applied += 1;
                    metrics::GRAPH_VERTICES_APPLIED
                        .with_label_values(&[action.as_str()])
                        .inc();
                    debug!(object = %key, action = %action, "Vertex applied");
                }
                Ok(false) => {
                    debug!(object = %key, action = %action, "Vertex already converged");
                }
                Err(error) => {
                    warn!(object = %key, action = %action, error = %error, "Vertex failed");
                    metrics::GRAPH_VERTEX_FAILURES
                        .with_label_values(&[action.as_str()])
                        .inc();
                    blocked.insert(key.clone());
                    failures.push(VertexFailure { key, error });
                }
            }
        }

        if failures.is_empty() {
            if applied > 0 {
                info!(applied, "Dependency graph applied");
            }
            Ok(applied)
        } else {
            Err(Error::Apply {
                applied,
                skipped,
                failures,
            })
        }
    }

    /// Returns whether the store was changed
    async fn apply_vertex(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        match vertex.action {
            VertexAction::Noop => Ok(false),
            VertexAction::Create => self.create(vertex).await,
            VertexAction::Update => self.update(vertex).await,
            VertexAction::Patch => self.patch(vertex).await,
            VertexAction::StatusPatch => self.status_patch(vertex).await,
            VertexAction::Delete => self.delete(vertex).await,
        }
    }

    async fn create(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        // Applied in an earlier pass; converge like an update from here on
        if vertex.observed.is_some() {
            return self.update(vertex).await;
        }
        let desired = required(vertex, vertex.desired.as_ref(), "desired")?;
        match self.store.create(desired, &vertex.options.client).await {
            Ok(created) => {
                vertex.observed = Some(created);
                Ok(true)
            }
            Err(e) if e.is_already_exists() && vertex.options.replace_if_existing => {
                debug!(object = %vertex.key(), "Object already exists, adopting stored version");
                let current = self.store.get(vertex.key()).await?;
                vertex.observed = Some(current);
                self.update(vertex).await
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        let desired = required(vertex, vertex.desired.as_ref(), "desired")?;
        let observed = required(vertex, vertex.observed.as_ref(), "observed")?;
        if content(observed)? == content(desired)? {
            return Ok(false);
        }

        let mut body = desired.clone();
        body.set_resource_version(observed.resource_version().map(String::from));
        let updated = self.store.update(&body, &vertex.options.client).await?;
        vertex.observed = Some(updated);
        Ok(true)
    }

    async fn patch(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        let desired = required(vertex, vertex.desired.as_ref(), "desired")?;
        let observed = required(vertex, vertex.observed.as_ref(), "observed")?;
        let Some(diff) = merge_diff(&content(observed)?, &content(desired)?) else {
            return Ok(false);
        };

        let key = vertex.key();
        let client = &vertex.options.client;
        let patched = match vertex.options.sub_resource.as_deref() {
            Some(subresource) => {
                self.store
                    .patch_subresource(key, subresource, &diff, client)
                    .await?
            }
            None => self.store.patch(key, &diff, client).await?,
        };
        vertex.observed = Some(patched);
        Ok(true)
    }

    async fn status_patch(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        let desired = required(vertex, vertex.desired.as_ref(), "desired")?;
        let observed = required(vertex, vertex.observed.as_ref(), "observed")?;
        let Some(diff) = merge_diff(&observed.status(), &desired.status()) else {
            return Ok(false);
        };

        let subresource = vertex
            .options
            .sub_resource
            .as_deref()
            .unwrap_or(STATUS_SUBRESOURCE);
        let patched = self
            .store
            .patch_subresource(
                vertex.key(),
                subresource,
                &json!({ "status": diff }),
                &vertex.options.client,
            )
            .await?;
        vertex.observed = Some(patched);
        Ok(true)
    }

    async fn delete(&self, vertex: &mut Vertex) -> StoreResult<bool> {
        if vertex.observed.is_none() && vertex.desired.is_none() {
            return Ok(false);
        }
        let result = self
            .store
            .delete(
                vertex.key(),
                vertex.options.propagation_policy.clone(),
                &vertex.options.client,
            )
            .await;
        let changed = match result {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        vertex.observed = None;
        vertex.desired = None;
        Ok(changed)
    }
}

fn required<'v>(
    vertex: &Vertex,
    side: Option<&'v KubeObject>,
    name: &str,
) -> StoreResult<&'v KubeObject> {
    side.ok_or_else(|| StoreError::Invalid {
        key: vertex.key().clone(),
        message: format!("{} action needs a {} object", vertex.action, name),
    })
}

fn content(object: &KubeObject) -> StoreResult<Value> {
    object.content().map_err(|e| StoreError::Invalid {
        key: object.key(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphOptions, ObjectKind};
    use crate::store::memory::{MemoryStore, Verb};

    fn cron(name: &str, schedule: &str) -> KubeObject {
        KubeObject::from_value(
            ObjectKind::CronJob,
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {"name": name, "namespace": "db"},
                "spec": {"schedule": schedule}
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_noop_vertex_makes_no_calls() {
        let store = MemoryStore::new();
        let mut graph = DependencyGraph::new();
        graph.add_vertex(Vertex::noop(cron("a", "0 3 * * *")));

        let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
        assert_eq!(applied, 0);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_refreshes_observed() {
        let store = MemoryStore::new();
        let mut graph = DependencyGraph::new();
        let key = graph.add_vertex(Vertex::create(cron("a", "0 3 * * *"), GraphOptions::default()));

        let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
        assert_eq!(applied, 1);
        let observed = graph.get(&key).unwrap().observed.as_ref().unwrap();
        assert!(observed.resource_version().is_some());
    }

    #[tokio::test]
    async fn test_create_conflict_without_replace_is_transient() {
        let store = MemoryStore::new();
        store.insert(cron("a", "0 3 * * *")).unwrap();
        let mut graph = DependencyGraph::new();
        graph.add_vertex(Vertex::create(cron("a", "0 4 * * *"), GraphOptions::default()));

        let err = GraphExecutor::new(&store)
            .apply(&mut graph)
            .await
            .unwrap_err();
        assert!(err.is_requeue());
        assert!(store.writes().iter().all(|c| c.verb == Verb::Create));
    }

    #[tokio::test]
    async fn test_patch_without_diff_is_skipped() {
        let store = MemoryStore::new();
        let stored = store.insert(cron("a", "0 3 * * *")).unwrap();
        let mut graph = DependencyGraph::new();
        graph.add_vertex(
            Vertex::patch(stored.clone(), cron("a", "0 3 * * *"), GraphOptions::default()).unwrap(),
        );

        let applied = GraphExecutor::new(&store).apply(&mut graph).await.unwrap();
        assert_eq!(applied, 0);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_status_patch_targets_subresource() {
        let store = MemoryStore::new();
        let stored = store.insert(cron("a", "0 3 * * *")).unwrap();
        let mut desired = stored.clone();
        desired.object.data["status"] = json!({"lastScheduleTime": "2024-01-01T03:00:00Z"});
        desired.object.data["spec"] = json!({"schedule": "ignored"});

        let mut graph = DependencyGraph::new();
        graph.add_vertex(Vertex::status_patch(stored, desired, GraphOptions::default()).unwrap());
        GraphExecutor::new(&store).apply(&mut graph).await.unwrap();

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].verb, Verb::PatchSubresource);
        assert_eq!(writes[0].subresource.as_deref(), Some("status"));

        let object = store.object(&writes[0].key).unwrap();
        assert_eq!(object.object.data["spec"]["schedule"], json!("0 3 * * *"));
        assert_eq!(
            object.status()["lastScheduleTime"],
            json!("2024-01-01T03:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_dependents_of_failed_vertex_are_skipped() {
        let store = MemoryStore::new();
        let base = cron("base", "0 3 * * *");
        store.fail_next(
            Verb::Create,
            base.key(),
            StoreError::Invalid {
                key: base.key(),
                message: "spec.schedule: Invalid value".to_string(),
            },
        );

        let mut graph = DependencyGraph::new();
        let base_key = graph.add_vertex(Vertex::create(base, GraphOptions::default()));
        let child = graph.add_vertex(Vertex::create(cron("child", "0 4 * * *"), GraphOptions::default()));
        let other = graph.add_vertex(Vertex::create(cron("other", "0 5 * * *"), GraphOptions::default()));
        graph.add_edge(&child, &base_key).unwrap();

        let err = GraphExecutor::new(&store)
            .apply(&mut graph)
            .await
            .unwrap_err();
        match err {
            Error::Apply {
                applied,
                skipped,
                failures,
            } => {
                assert_eq!(applied, 1);
                assert_eq!(skipped, 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].key, base_key);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(store.object(&other).is_some());
        assert!(store.object(&child).is_none());
    }
}
