//! Backup Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backup resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.dbops.io",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    singular = "backup",
    shortname = "bk",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name": "Policy", "type": "string", "jsonPath": ".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name": "Method", "type": "string", "jsonPath": ".spec.backupMethod"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Policy the backup was taken under
    pub backup_policy_name: String,

    /// Method from that policy
    pub backup_method: String,

    /// How long the backup is kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,
}

/// Kind of backup, carried in the backup type label
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
    Continuous,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "Full",
            BackupType::Incremental => "Incremental",
            BackupType::Differential => "Differential",
            BackupType::Continuous => "Continuous",
        }
    }
}

/// Backup status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase (New, Running, Completed, Failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
