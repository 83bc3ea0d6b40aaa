//! BackupSchedule Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupSchedule resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.dbops.io",
    version = "v1alpha1",
    kind = "BackupSchedule",
    plural = "backupschedules",
    singular = "backupschedule",
    shortname = "bs",
    namespaced,
    status = "BackupScheduleStatus",
    printcolumn = r#"{"name": "Policy", "type": "string", "jsonPath": ".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Name of the BackupPolicy this schedule runs
    pub backup_policy_name: String,

    /// Deadline in minutes for starting a scheduled backup that missed its time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_deadline_minutes: Option<i64>,

    /// One entry per backup method to schedule
    #[serde(default)]
    pub schedules: Vec<SchedulePolicy>,
}

/// Schedule for a single backup method
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePolicy {
    /// Whether the schedule is active
    #[serde(default)]
    pub enabled: bool,

    /// Backup method name from the referenced BackupPolicy
    pub backup_method: String,

    /// Cron expression in the standard five-field format
    pub cron_expression: String,

    /// How long backups produced by this schedule are kept (e.g. "7d")
    #[serde(default = "default_retention_period")]
    pub retention_period: String,
}

fn default_retention_period() -> String {
    "7d".to_string()
}

/// Outcome of the last completed reconciliation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupSchedulePhase {
    Available,
    Failed,
}

/// BackupSchedule status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleStatus {
    /// Phase of the last completed reconciliation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupSchedulePhase>,

    /// Generation of the spec last reconciled successfully
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Error message of the last failure; absent while available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
