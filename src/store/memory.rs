//! In-memory object store
//!
//! [`MemoryStore`] keeps objects as JSON documents and mimics the parts of
//! API server behavior the engine depends on:
//!
//! - resource versions bump on every write; `update` is version-checked
//! - `metadata.generation` bumps when `spec` changes
//! - writes to the main resource leave `status` alone for kinds with a
//!   status subresource, and the `status` subresource only touches `status`
//! - delete of an object carrying finalizers only marks it terminating; it
//!   is purged once the last finalizer is removed
//!
//! Every call is recorded so tests can assert on the exact trace, and
//! one-shot faults can be injected per verb and object.
//!
//! Not suitable for production: no durability and no watch support.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::api::PropagationPolicy;
use serde_json::{json, Value};

use super::{selector_matches, LabelSelector, ObjectStore, StoreResult};
use crate::error::StoreError;
use crate::model::{ClientOptions, KubeObject, ObjectKey, ObjectKind};

/// The kind of call made against the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    PatchSubresource,
    Delete,
}

impl Verb {
    pub fn is_write(&self) -> bool {
        !matches!(self, Verb::Get | Verb::List)
    }
}

/// One recorded call
#[derive(Clone, Debug, PartialEq)]
pub struct StoreCall {
    pub verb: Verb,
    pub key: ObjectKey,
    pub subresource: Option<String>,
    pub propagation: Option<PropagationPolicy>,
    pub body: Option<Value>,
}

impl StoreCall {
    fn new(verb: Verb, key: ObjectKey) -> Self {
        Self {
            verb,
            key,
            subresource: None,
            propagation: None,
            body: None,
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
    calls: Vec<StoreCall>,
    faults: Vec<(Verb, ObjectKey, StoreError)>,
}

impl State {
    fn record(&mut self, call: StoreCall) -> StoreResult<()> {
        let position = self
            .faults
            .iter()
            .position(|(verb, key, _)| *verb == call.verb && *key == call.key);
        self.calls.push(call);
        match position {
            Some(i) => Err(self.faults.remove(i).2),
            None => Ok(()),
        }
    }

    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn current(&self, key: &ObjectKey) -> StoreResult<Value> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    /// Stamp a new version, bump generation on spec change, purge terminating
    /// objects without finalizers.
    fn commit(&mut self, key: &ObjectKey, previous: &Value, mut next: Value) -> StoreResult<KubeObject> {
        let generation = previous["metadata"]["generation"].as_i64().unwrap_or(1);
        let generation = if previous.get("spec") != next.get("spec") {
            generation + 1
        } else {
            generation
        };
        let version = self.next_version();
        set_metadata(&mut next, "resourceVersion", json!(version));
        set_metadata(&mut next, "generation", json!(generation));

        let terminating = !next["metadata"]["deletionTimestamp"].is_null();
        let finalizers_left = next["metadata"]["finalizers"]
            .as_array()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if terminating && !finalizers_left {
            self.objects.remove(key);
        } else {
            self.objects.insert(key.clone(), next.clone());
        }
        to_object(key, next)
    }
}

/// Thread-safe in-memory [`ObjectStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Transport("lock poisoned".to_string())
}

fn to_object(key: &ObjectKey, value: Value) -> StoreResult<KubeObject> {
    KubeObject::from_value(key.kind, value).map_err(|e| StoreError::Invalid {
        key: key.clone(),
        message: e.to_string(),
    })
}

fn to_value(object: &KubeObject) -> StoreResult<Value> {
    object.to_value().map_err(|e| StoreError::Invalid {
        key: object.key(),
        message: e.to_string(),
    })
}

fn set_metadata(value: &mut Value, field: &str, content: Value) {
    if !value["metadata"].is_object() {
        value["metadata"] = json!({});
    }
    value["metadata"][field] = content;
}

fn remove_metadata(value: &mut Value, field: &str) {
    if let Some(Value::Object(metadata)) = value.get_mut("metadata") {
        metadata.remove(field);
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a call. Returns the stored version.
    pub fn insert(&self, object: KubeObject) -> StoreResult<KubeObject> {
        let key = object.key();
        let mut value = to_value(&object)?;
        let mut state = self.state.lock().map_err(poison_err)?;
        let version = state.next_version();
        set_metadata(&mut value, "namespace", json!(key.namespace));
        set_metadata(&mut value, "resourceVersion", json!(version));
        if value["metadata"]["generation"].is_null() {
            set_metadata(&mut value, "generation", json!(1));
        }
        if value["metadata"]["uid"].is_null() {
            set_metadata(&mut value, "uid", json!(format!("uid-{}", version)));
        }
        state.objects.insert(key.clone(), value.clone());
        to_object(&key, value)
    }

    /// Read an object without recording a call
    pub fn object(&self, key: &ObjectKey) -> Option<KubeObject> {
        let state = self.state.lock().ok()?;
        let value = state.objects.get(key)?.clone();
        to_object(key, value).ok()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Only the mutating calls
    pub fn writes(&self) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb.is_write())
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    /// Make the next `verb` call on `key` fail with `error`
    pub fn fail_next(&self, verb: Verb, key: ObjectKey, error: StoreError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push((verb, key, error));
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<KubeObject> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.record(StoreCall::new(Verb::Get, key.clone()))?;
        let value = state.current(key)?;
        to_object(key, value)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<KubeObject>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.record(StoreCall::new(
            Verb::List,
            ObjectKey::new(kind, namespace, ""),
        ))?;
        let mut items = Vec::new();
        for (key, value) in state.objects.iter() {
            if key.kind != kind || key.namespace != namespace {
                continue;
            }
            let object = to_object(key, value.clone())?;
            if selector_matches(selector, &object.labels()) {
                items.push(object);
            }
        }
        Ok(items)
    }

    async fn create(
        &self,
        object: &KubeObject,
        _params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let key = object.key();
        let mut value = to_value(object)?;
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut call = StoreCall::new(Verb::Create, key.clone());
        call.body = Some(value.clone());
        state.record(call)?;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let version = state.next_version();
        set_metadata(&mut value, "namespace", json!(key.namespace));
        set_metadata(&mut value, "resourceVersion", json!(version));
        set_metadata(&mut value, "generation", json!(1));
        set_metadata(&mut value, "uid", json!(format!("uid-{}", version)));
        set_metadata(&mut value, "creationTimestamp", json!(now()));
        if key.kind.has_status_subresource() {
            if let Value::Object(map) = &mut value {
                map.remove("status");
            }
        }
        state.objects.insert(key.clone(), value.clone());
        to_object(&key, value)
    }

    async fn update(
        &self,
        object: &KubeObject,
        _params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let key = object.key();
        let mut next = to_value(object)?;
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut call = StoreCall::new(Verb::Update, key.clone());
        call.body = Some(next.clone());
        state.record(call)?;
        let current = state.current(&key)?;

        let current_version = current["metadata"]["resourceVersion"].as_str();
        if let Some(version) = object.resource_version() {
            if Some(version) != current_version {
                return Err(StoreError::Conflict {
                    key,
                    message: format!(
                        "resourceVersion {} does not match {}",
                        version,
                        current_version.unwrap_or_default()
                    ),
                });
            }
        }

        if key.kind.has_status_subresource() {
            next["status"] = current["status"].clone();
            if next["status"].is_null() {
                if let Value::Object(map) = &mut next {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match current["metadata"].get(field) {
                Some(v) => set_metadata(&mut next, field, v.clone()),
                None => remove_metadata(&mut next, field),
            }
        }
        state.commit(&key, &current, next)
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        _params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut call = StoreCall::new(Verb::Patch, key.clone());
        call.body = Some(patch.clone());
        state.record(call)?;
        let current = state.current(key)?;

        // A resourceVersion in the patch makes it conditional
        if let Some(version) = patch["metadata"]["resourceVersion"].as_str() {
            let current_version = current["metadata"]["resourceVersion"].as_str();
            if Some(version) != current_version {
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    message: format!(
                        "resourceVersion {} does not match {}",
                        version,
                        current_version.unwrap_or_default()
                    ),
                });
            }
        }

        let mut patch = patch.clone();
        if key.kind.has_status_subresource() {
            if let Value::Object(map) = &mut patch {
                map.remove("status");
            }
        }
        let mut next = current.clone();
        json_patch::merge(&mut next, &patch);
        state.commit(key, &current, next)
    }

    async fn patch_subresource(
        &self,
        key: &ObjectKey,
        subresource: &str,
        patch: &Value,
        _params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut call = StoreCall::new(Verb::PatchSubresource, key.clone());
        call.subresource = Some(subresource.to_string());
        call.body = Some(patch.clone());
        state.record(call)?;
        if subresource != "status" {
            return Err(StoreError::Invalid {
                key: key.clone(),
                message: format!("unknown subresource {:?}", subresource),
            });
        }
        let current = state.current(key)?;

        let mut next = current.clone();
        if let Some(status) = patch.get("status") {
            json_patch::merge(&mut next, &json!({ "status": status }));
        }
        state.commit(key, &current, next)
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: Option<PropagationPolicy>,
        _params: &ClientOptions,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let mut call = StoreCall::new(Verb::Delete, key.clone());
        call.propagation = propagation;
        state.record(call)?;
        let current = state.current(key)?;

        let has_finalizers = current["metadata"]["finalizers"]
            .as_array()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if !has_finalizers {
            state.objects.remove(key);
            return Ok(());
        }
        if current["metadata"]["deletionTimestamp"].is_null() {
            let mut next = current.clone();
            set_metadata(&mut next, "deletionTimestamp", json!(now()));
            state.commit(key, &current, next)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron(name: &str, schedule: &str) -> KubeObject {
        KubeObject::from_value(
            ObjectKind::CronJob,
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {"name": name, "namespace": "db", "labels": {"app": "backup"}},
                "spec": {"schedule": schedule}
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_conflicting_create() {
        let store = MemoryStore::new();
        let params = ClientOptions::default();

        let created = store.create(&cron("a", "0 3 * * *"), &params).await.unwrap();
        assert!(created.resource_version().is_some());

        let again = store.create(&cron("a", "0 3 * * *"), &params).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_update_is_version_checked() {
        let store = MemoryStore::new();
        let params = ClientOptions::default();
        let created = store.create(&cron("a", "0 3 * * *"), &params).await.unwrap();

        let mut first = cron("a", "0 4 * * *");
        first.set_resource_version(created.resource_version().map(String::from));
        let updated = store.update(&first, &params).await.unwrap();
        assert_eq!(updated.object.metadata.generation, Some(2));

        // Same base version again: someone else already moved the object on
        let stale = store.update(&first, &params).await;
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_main_patch_ignores_status() {
        let store = MemoryStore::new();
        let params = ClientOptions::default();
        let key = store.insert(cron("a", "0 3 * * *")).unwrap().key();

        store
            .patch(
                &key,
                &json!({"spec": {"suspend": true}, "status": {"active": []}}),
                &params,
            )
            .await
            .unwrap();
        let object = store.object(&key).unwrap();
        assert_eq!(object.object.data["spec"]["suspend"], json!(true));
        assert!(object.status().is_null());

        store
            .patch_subresource(&key, "status", &json!({"status": {"active": []}}), &params)
            .await
            .unwrap();
        assert_eq!(store.object(&key).unwrap().status(), json!({"active": []}));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let params = ClientOptions::default();
        let mut object = cron("a", "0 3 * * *");
        object.object.metadata.finalizers = Some(vec!["example.io/finalizer".to_string()]);
        let key = store.insert(object).unwrap().key();

        store.delete(&key, None, &params).await.unwrap();
        assert!(store.object(&key).unwrap().is_terminating());

        store
            .patch(&key, &json!({"metadata": {"finalizers": null}}), &params)
            .await
            .unwrap();
        assert!(store.object(&key).is_none());

        let missing = store.delete(&key, None, &params).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let store = MemoryStore::new();
        let key = store.insert(cron("a", "0 3 * * *")).unwrap().key();
        store.fail_next(
            Verb::Get,
            key.clone(),
            StoreError::Transport("connection reset".to_string()),
        );

        assert!(store.get(&key).await.is_err());
        assert!(store.get(&key).await.is_ok());
        assert_eq!(store.calls().len(), 2);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        store.insert(cron("a", "0 3 * * *")).unwrap();
        let mut other = cron("b", "0 3 * * *");
        other.object.metadata.labels = None;
        store.insert(other).unwrap();

        let selector: LabelSelector = [("app".to_string(), "backup".to_string())]
            .into_iter()
            .collect();
        let items = store
            .list(ObjectKind::CronJob, "db", &selector)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name(), "a");
    }
}
