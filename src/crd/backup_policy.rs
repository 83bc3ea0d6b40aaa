//! BackupPolicy Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupPolicy resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.dbops.io",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    singular = "backuppolicy",
    shortname = "bp",
    namespaced,
    status = "BackupPolicyStatus",
    printcolumn = r#"{"name": "Repo", "type": "string", "jsonPath": ".spec.backupRepoName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// Repository backups are written to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_repo_name: Option<String>,

    /// Methods that schedules may reference
    #[serde(default)]
    pub backup_methods: Vec<BackupMethod>,
}

/// A way of taking a backup
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethod {
    /// Unique method name
    pub name: String,

    /// Action set executed by the backup worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_set_name: Option<String>,

    /// Continuous methods (e.g. log archiving) run as one long-lived Backup
    /// instead of a periodic job
    #[serde(default)]
    pub continuous: bool,
}

/// BackupPolicy status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyStatus {
    /// Available once the policy's repository and methods are resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BackupPolicy {
    /// Look up a method by name
    pub fn method(&self, name: &str) -> Option<&BackupMethod> {
        self.spec.backup_methods.iter().find(|m| m.name == name)
    }

    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|p| p == "Available")
            .unwrap_or(false)
    }
}
