//! Custom Resource Definitions for the Data Protection Operator

mod backup;
mod backup_policy;
mod backup_schedule;

pub use backup::*;
pub use backup_policy::*;
pub use backup_schedule::*;

use kube::CustomResourceExt;

/// Finalizer placed on schedules and the CronJobs they own
pub const DATA_PROTECTION_FINALIZER: &str = "dataprotection.dbops.io/finalizer";

/// Label on owned objects naming their BackupSchedule
pub const BACKUP_SCHEDULE_LABEL_KEY: &str = "dataprotection.dbops.io/backup-schedule";

/// Label naming the BackupPolicy a schedule or backup belongs to
pub const BACKUP_POLICY_LABEL_KEY: &str = "dataprotection.dbops.io/backup-policy";

/// Label naming the backup method a CronJob or Backup runs
pub const BACKUP_METHOD_LABEL_KEY: &str = "dataprotection.dbops.io/backup-method";

/// Label carrying the [`BackupType`] of a Backup
pub const BACKUP_TYPE_LABEL_KEY: &str = "dataprotection.dbops.io/backup-type";

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "dataprotection-operator";

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&BackupSchedule::crd())?,
        serde_yaml::to_string(&BackupPolicy::crd())?,
        serde_yaml::to_string(&Backup::crd())?,
    ])
}
