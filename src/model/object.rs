//! Object kinds, identities and the generic object payload carried by vertices

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crd::{Backup, BackupPolicy, BackupSchedule};
use crate::error::Result;

/// Metadata fields owned by the API server. They never take part in diffs.
const SERVER_MANAGED_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Kinds of object the engine knows how to address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    BackupSchedule,
    BackupPolicy,
    Backup,
    CronJob,
    ServiceAccount,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::BackupSchedule => "BackupSchedule",
            ObjectKind::BackupPolicy => "BackupPolicy",
            ObjectKind::Backup => "Backup",
            ObjectKind::CronJob => "CronJob",
            ObjectKind::ServiceAccount => "ServiceAccount",
        }
    }

    /// Group, version and plural used to address this kind on the API server
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ObjectKind::BackupSchedule => ApiResource::erase::<BackupSchedule>(&()),
            ObjectKind::BackupPolicy => ApiResource::erase::<BackupPolicy>(&()),
            ObjectKind::Backup => ApiResource::erase::<Backup>(&()),
            ObjectKind::CronJob => ApiResource::erase::<CronJob>(&()),
            ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        }
    }

    /// Whether writes to the main resource ignore `status`
    pub fn has_status_subresource(&self) -> bool {
        !matches!(self, ObjectKind::ServiceAccount)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object: one vertex per key per graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A store object: an explicit kind tag plus the untyped payload
#[derive(Clone, Debug)]
pub struct KubeObject {
    pub kind: ObjectKind,
    pub object: DynamicObject,
}

impl KubeObject {
    /// An empty object of the given kind
    pub fn new(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        let object = DynamicObject::new(name, &kind.api_resource()).within(namespace);
        Self { kind, object }
    }

    /// Erase a typed resource into a store object
    pub fn from_resource<K: Serialize>(kind: ObjectKind, resource: &K) -> Result<Self> {
        Self::from_value(kind, serde_json::to_value(resource)?)
    }

    pub fn from_value(kind: ObjectKind, value: Value) -> Result<Self> {
        let object: DynamicObject = serde_json::from_value(value)?;
        Ok(Self { kind, object })
    }

    /// Recover the typed resource
    pub fn parse<K: DeserializeOwned>(&self) -> Result<K> {
        Ok(serde_json::from_value(self.to_value()?)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.object)?)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, self.namespace(), self.name())
    }

    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.object
            .metadata
            .namespace
            .as_deref()
            .unwrap_or("default")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }

    pub fn set_resource_version(&mut self, version: Option<String>) {
        self.object.metadata.resource_version = version;
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.object.metadata.labels.clone().unwrap_or_default()
    }

    pub fn finalizers(&self) -> &[String] {
        self.object.metadata.finalizers.as_deref().unwrap_or_default()
    }

    pub fn is_terminating(&self) -> bool {
        self.object.metadata.deletion_timestamp.is_some()
    }

    /// Everything the owner of the object controls outside of `status`
    pub fn content(&self) -> Result<Value> {
        let mut value = self.to_value()?;
        strip_server_managed(&mut value);
        if let Value::Object(map) = &mut value {
            map.remove("status");
        }
        Ok(value)
    }

    /// The `status` body alone, or null
    pub fn status(&self) -> Value {
        self.object.data.get("status").cloned().unwrap_or(Value::Null)
    }
}

/// Remove server-owned metadata so two objects can be compared structurally
pub fn strip_server_managed(value: &mut Value) {
    if let Some(Value::Object(metadata)) = value.get_mut("metadata") {
        for field in SERVER_MANAGED_METADATA {
            metadata.remove(*field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_api_resources() {
        let cron = ObjectKind::CronJob.api_resource();
        assert_eq!(cron.group, "batch");
        assert_eq!(cron.plural, "cronjobs");

        let schedule = ObjectKind::BackupSchedule.api_resource();
        assert_eq!(schedule.group, "dataprotection.dbops.io");
        assert_eq!(schedule.plural, "backupschedules");
    }

    #[test]
    fn test_content_ignores_server_fields_and_status() {
        let object = KubeObject::from_value(
            ObjectKind::CronJob,
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {
                    "name": "nightly",
                    "namespace": "db",
                    "resourceVersion": "42",
                    "uid": "abc",
                    "generation": 3
                },
                "spec": {"schedule": "0 3 * * *"},
                "status": {"active": []}
            }),
        )
        .unwrap();

        let content = object.content().unwrap();
        assert_eq!(
            content,
            json!({
                "apiVersion": "batch/v1",
                "kind": "CronJob",
                "metadata": {"name": "nightly", "namespace": "db"},
                "spec": {"schedule": "0 3 * * *"}
            })
        );
        assert_eq!(object.key().to_string(), "CronJob db/nightly");
        assert_eq!(object.resource_version(), Some("42"));
    }
}
