//! Object store abstraction
//!
//! Everything the engine does to the outside world goes through
//! [`ObjectStore`]. Two implementations exist:
//!
//! - [`KubeStore`]: the Kubernetes API server through `kube::Api<DynamicObject>`
//! - [`MemoryStore`]: an in-process store with the same conflict semantics,
//!   used by tests and dry runs

mod kube_store;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::PropagationPolicy;
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{ClientOptions, KubeObject, ObjectKey, ObjectKind};

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Result of a single store call
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Equality-based label selector (`k1=v1,k2=v2`)
pub type LabelSelector = BTreeMap<String, String>;

/// Synchronous request/response access to the object store.
///
/// All writes are optimistic: `update` carries the resource version it was
/// computed from and the store rejects it with `Conflict` if the object
/// moved on in the meantime.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object, `NotFound` if absent
    async fn get(&self, key: &ObjectKey) -> StoreResult<KubeObject>;

    /// All objects of a kind in a namespace whose labels match `selector`
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<KubeObject>>;

    /// Create, `AlreadyExists` if the name is taken
    async fn create(&self, object: &KubeObject, params: &ClientOptions)
        -> StoreResult<KubeObject>;

    /// Full replace, version-checked against `object`'s resource version
    async fn update(&self, object: &KubeObject, params: &ClientOptions)
        -> StoreResult<KubeObject>;

    /// RFC 7386 merge patch against the main resource
    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject>;

    /// RFC 7386 merge patch against a named subresource
    async fn patch_subresource(
        &self,
        key: &ObjectKey,
        subresource: &str,
        patch: &Value,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject>;

    /// Delete with the given cascade mode
    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: Option<PropagationPolicy>,
        params: &ClientOptions,
    ) -> StoreResult<()>;
}

/// Render a selector the way the API server expects it
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfy every term of `selector`
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_rendering_and_matching() {
        let selector: LabelSelector = [
            ("app".to_string(), "db".to_string()),
            ("tier".to_string(), "backup".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(selector_string(&selector), "app=db,tier=backup");

        let mut labels = selector.clone();
        labels.insert("extra".to_string(), "x".to_string());
        assert!(selector_matches(&selector, &labels));

        labels.insert("tier".to_string(), "other".to_string());
        assert!(!selector_matches(&selector, &labels));
        assert!(selector_matches(&LabelSelector::new(), &labels));
    }
}
