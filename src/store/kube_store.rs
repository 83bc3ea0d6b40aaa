//! Object store backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::{selector_string, LabelSelector, ObjectStore, StoreResult};
use crate::error::StoreError;
use crate::model::{ClientOptions, KubeObject, ObjectKey, ObjectKind};

/// [`ObjectStore`] over `Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, kind: ObjectKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    fn field_manager(&self, params: &ClientOptions) -> Option<String> {
        Some(
            params
                .field_manager
                .clone()
                .unwrap_or_else(|| self.field_manager.clone()),
        )
    }

    fn post_params(&self, params: &ClientOptions) -> PostParams {
        PostParams {
            dry_run: params.dry_run,
            field_manager: self.field_manager(params),
        }
    }

    fn patch_params(&self, params: &ClientOptions) -> PatchParams {
        PatchParams {
            dry_run: params.dry_run,
            field_manager: self.field_manager(params),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<KubeObject> {
        let object = self
            .api(key.kind, &key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_error(key, e))?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(KubeObject {
            kind: key.kind,
            object,
        })
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<KubeObject>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| map_error(&ObjectKey::new(kind, namespace, ""), e))?;
        Ok(list
            .items
            .into_iter()
            .map(|object| KubeObject { kind, object })
            .collect())
    }

    async fn create(
        &self,
        object: &KubeObject,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let key = object.key();
        debug!(object = %key, "create");
        let created = self
            .api(key.kind, &key.namespace)
            .create(&self.post_params(params), &object.object)
            .await
            .map_err(|e| map_error(&key, e))?;
        Ok(KubeObject {
            kind: key.kind,
            object: created,
        })
    }

    async fn update(
        &self,
        object: &KubeObject,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        let key = object.key();
        debug!(object = %key, resource_version = ?object.resource_version(), "update");
        let updated = self
            .api(key.kind, &key.namespace)
            .replace(&key.name, &self.post_params(params), &object.object)
            .await
            .map_err(|e| map_error(&key, e))?;
        Ok(KubeObject {
            kind: key.kind,
            object: updated,
        })
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        debug!(object = %key, "merge patch");
        let patched = self
            .api(key.kind, &key.namespace)
            .patch(&key.name, &self.patch_params(params), &Patch::Merge(patch))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(KubeObject {
            kind: key.kind,
            object: patched,
        })
    }

    async fn patch_subresource(
        &self,
        key: &ObjectKey,
        subresource: &str,
        patch: &Value,
        params: &ClientOptions,
    ) -> StoreResult<KubeObject> {
        debug!(object = %key, subresource, "merge patch subresource");
        let patched = self
            .api(key.kind, &key.namespace)
            .patch_subresource(
                subresource,
                &key.name,
                &self.patch_params(params),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(KubeObject {
            kind: key.kind,
            object: patched,
        })
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: Option<PropagationPolicy>,
        params: &ClientOptions,
    ) -> StoreResult<()> {
        debug!(object = %key, propagation = ?propagation, "delete");
        let delete_params = DeleteParams {
            dry_run: params.dry_run,
            propagation_policy: propagation,
            ..Default::default()
        };
        self.api(key.kind, &key.namespace)
            .delete(&key.name, &delete_params)
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }
}

/// Translate an API server response into the store taxonomy
fn map_error(key: &ObjectKey, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) => match response.code {
            404 => StoreError::NotFound(key.clone()),
            409 if response.reason == "AlreadyExists" => StoreError::AlreadyExists(key.clone()),
            409 => StoreError::Conflict {
                key: key.clone(),
                message: response.message,
            },
            400 | 422 => StoreError::Invalid {
                key: key.clone(),
                message: response.message,
            },
            code => StoreError::Transport(format!("{} ({})", response.message, code)),
        },
        other => StoreError::Transport(other.to_string()),
    }
}
