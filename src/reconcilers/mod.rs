//! Reconcile state machine shared by the domain controllers
//!
//! A pass reads the resource fresh from the store, derives its [`Lifecycle`]
//! and then either runs cleanup (terminating) or convergence (everything
//! else). The outcome of convergence is folded into `status`:
//!
//! - success: `phase: Available`, `observedGeneration` set, `failureReason` cleared
//! - retry signal: status untouched, requeue after the reconcile interval
//! - any other error: `phase: Failed` with the error text, a Warning event,
//!   and the error handed back to the controller for backoff
//!
//! Domain logic plugs in through [`Converge`].

pub mod backup_schedule;
pub mod scheduler;

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::PropagationPolicy;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{actions, EventPublisher};
use crate::metrics;
use crate::model::{
    ClientOptions, DependencyGraph, GraphExecutor, GraphOptions, KubeObject, ObjectKey, ObjectKind,
    Vertex,
};
use crate::store::{LabelSelector, ObjectStore};

pub const PHASE_AVAILABLE: &str = "Available";
pub const PHASE_FAILED: &str = "Failed";

/// A custom resource driven by the state machine
pub trait ManagedResource:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ObjectKind;
}

/// Domain logic for one resource type
#[async_trait]
pub trait Converge<R>: Send + Sync {
    /// Drive owned objects toward the resource's spec.
    ///
    /// May change `resource.spec`; the state machine persists the change.
    /// Metadata written to the store along the way must be copied back into
    /// `resource` so its resource version stays current.
    async fn converge(&self, resource: &mut R) -> Result<()>;

    /// Remove everything the resource owns. Must tolerate running twice.
    async fn cleanup(&self, resource: &R) -> Result<()>;
}

/// Where a resource is in its life, computed once per pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// No outcome recorded yet
    Initializing,
    Available,
    Failed,
    /// Deletion requested; `finalized` if our finalizer still blocks it
    Terminating { finalized: bool },
}

impl Lifecycle {
    pub fn of(object: &KubeObject, finalizer: &str) -> Self {
        if object.is_terminating() {
            return Lifecycle::Terminating {
                finalized: object.finalizers().iter().any(|f| f == finalizer),
            };
        }
        match object.status().get("phase").and_then(Value::as_str) {
            Some(PHASE_AVAILABLE) => Lifecycle::Available,
            Some(PHASE_FAILED) => Lifecycle::Failed,
            _ => Lifecycle::Initializing,
        }
    }
}

/// Runs reconcile passes against an object store
pub struct StateMachine<'a> {
    pub store: &'a dyn ObjectStore,
    pub events: &'a dyn EventPublisher,
    /// Finalizer that guards cleanup
    pub finalizer: &'a str,
    /// Event reason used when convergence fails
    pub failure_reason: &'a str,
    /// Requeue delay for the retry signal
    pub reconcile_interval: Duration,
    pub client: ClientOptions,
}

impl<'a> StateMachine<'a> {
    /// Run one pass for the resource at `key`
    pub async fn run<R, C>(&self, key: &ObjectKey, converger: &C) -> Result<Action>
    where
        R: ManagedResource,
        C: Converge<R> + ?Sized,
    {
        let object = match self.store.get(key).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                debug!(object = %key, "Resource is gone, nothing to do");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        let lifecycle = Lifecycle::of(&object, self.finalizer);
        debug!(object = %key, ?lifecycle, "Reconciling");
        match lifecycle {
            Lifecycle::Terminating { finalized: false } => Ok(Action::await_change()),
            Lifecycle::Terminating { finalized: true } => self.finalize(object, converger).await,
            Lifecycle::Initializing | Lifecycle::Available | Lifecycle::Failed => {
                self.apply(object, converger).await
            }
        }
    }

    async fn finalize<R, C>(&self, object: KubeObject, converger: &C) -> Result<Action>
    where
        R: ManagedResource,
        C: Converge<R> + ?Sized,
    {
        let key = object.key();
        info!(object = %key, "Cleaning up");
        let resource: R = object.parse()?;
        if let Err(error) = converger.cleanup(&resource).await {
            warn!(object = %key, error = %error, "Cleanup failed, keeping finalizer");
            self.warn(&object, crate::events::reasons::CLEANUP_FAILED, actions::DELETE, &error)
                .await;
            return Err(error);
        }

        remove_finalizer(self.store, &object, self.finalizer, &self.client).await?;
        metrics::CLEANUPS.with_label_values(&[R::KIND.as_str()]).inc();
        info!(object = %key, "Finalizer removed");
        Ok(Action::await_change())
    }

    async fn apply<R, C>(&self, object: KubeObject, converger: &C) -> Result<Action>
    where
        R: ManagedResource,
        C: Converge<R> + ?Sized,
    {
        let object = add_finalizer(self.store, object, self.finalizer, &self.client).await?;
        let original: R = object.parse()?;
        let mut resource = original.clone();

        match converger.converge(&mut resource).await {
            Ok(()) => self.record_available(&original, resource).await,
            Err(error) if error.is_requeue() => {
                info!(object = %object.key(), reason = %error, "Not ready yet, requeueing");
                metrics::REQUEUES
                    .with_label_values(&[R::KIND.as_str(), error.metric_label()])
                    .inc();
                Ok(Action::requeue(self.reconcile_interval))
            }
            Err(error) => {
                // Status reflects what is stored now, so re-read after convergence
                let current = self.store.get(&object.key()).await?;
                self.record_failed(current, error).await
            }
        }
    }

    async fn record_available<R: ManagedResource>(
        &self,
        original: &R,
        resource: R,
    ) -> Result<Action> {
        let mut current = KubeObject::from_resource(R::KIND, &resource)?;
        if spec_of(original)? != spec_of(&resource)? {
            info!(object = %current.key(), "Persisting spec changes");
            current = self.store.update(&current, &self.client).await?;
        }

        let generation = current.object.metadata.generation;
        let mut status = status_map(&current);
        status.insert("phase".to_string(), json!(PHASE_AVAILABLE));
        status.insert("observedGeneration".to_string(), json!(generation));
        status.remove("failureReason");
        self.patch_status(current, status).await?;
        Ok(Action::await_change())
    }

    async fn record_failed(&self, current: KubeObject, error: Error) -> Result<Action> {
        warn!(object = %current.key(), error = %error, "Reconciliation failed");
        let mut status = status_map(&current);
        status.insert("phase".to_string(), json!(PHASE_FAILED));
        status.insert("failureReason".to_string(), json!(error.to_string()));
        self.patch_status(current.clone(), status).await?;
        self.warn(&current, self.failure_reason, actions::RECONCILE, &error)
            .await;
        Err(error)
    }

    /// Patch `status` to `next`; no call is made when nothing changed
    async fn patch_status(&self, current: KubeObject, next: Map<String, Value>) -> Result<()> {
        let mut desired = current.clone();
        desired.object.data["status"] = Value::Object(next);

        let options = GraphOptions::default().with_client_options(self.client.clone());
        let mut graph = DependencyGraph::new();
        graph.add_vertex(Vertex::status_patch(current, desired, options)?);
        GraphExecutor::new(self.store).apply(&mut graph).await?;
        Ok(())
    }

    async fn warn(&self, object: &KubeObject, reason: &str, action: &str, error: &Error) {
        self.events
            .publish(
                &object_reference(object),
                EventType::Warning,
                reason,
                action,
                Some(error.to_string()),
            )
            .await;
    }
}

/// Reference used to attach events to an object
pub fn object_reference(object: &KubeObject) -> ObjectReference {
    object.object.object_ref(&object.kind.api_resource())
}

/// Ensure `finalizer` is on the object. Returns the stored object.
pub async fn add_finalizer(
    store: &dyn ObjectStore,
    object: KubeObject,
    finalizer: &str,
    client: &ClientOptions,
) -> Result<KubeObject> {
    if object.finalizers().iter().any(|f| f == finalizer) {
        return Ok(object);
    }
    let mut finalizers = object.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    debug!(object = %object.key(), finalizer, "Adding finalizer");
    let patch = finalizer_patch(&object, finalizers);
    Ok(store.patch(&object.key(), &patch, client).await?)
}

/// Remove `finalizer` from the object if present
pub async fn remove_finalizer(
    store: &dyn ObjectStore,
    object: &KubeObject,
    finalizer: &str,
    client: &ClientOptions,
) -> Result<()> {
    if !object.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = object
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let patch = finalizer_patch(object, finalizers);
    match store.patch(&object.key(), &patch, client).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge patches replace lists whole; the resource version makes the
/// replacement conditional on what we read.
fn finalizer_patch(object: &KubeObject, finalizers: Vec<String>) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": object.resource_version(),
        }
    })
}

/// Strip `finalizer` from every `kind` object matching `selector` and delete
/// it in the background. Returns how many objects were deleted.
pub async fn delete_children(
    store: &dyn ObjectStore,
    kind: ObjectKind,
    namespace: &str,
    selector: &LabelSelector,
    finalizer: &str,
    client: &ClientOptions,
) -> Result<usize> {
    let children = store.list(kind, namespace, selector).await?;
    let mut deleted = 0;
    for child in children {
        remove_finalizer(store, &child, finalizer, client).await?;
        match store
            .delete(&child.key(), Some(PropagationPolicy::Background), client)
            .await
        {
            Ok(()) => deleted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        debug!(object = %child.key(), "Deleted child");
    }
    Ok(deleted)
}

fn spec_of<R: Serialize>(resource: &R) -> Result<Value> {
    let value = serde_json::to_value(resource)?;
    Ok(value.get("spec").cloned().unwrap_or(Value::Null))
}

fn status_map(object: &KubeObject) -> Map<String, Value> {
    match object.status() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
