//! BackupSchedule reconciler
//!
//! Handles the business logic for backup schedules:
//! - Spec validation and canonicalization
//! - Resolving the referenced BackupPolicy
//! - Keeping the policy label on the schedule in sync
//! - Ensuring the worker ServiceAccount exists
//! - Planning and applying the CronJobs and continuous Backups

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use cron::Schedule;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::OperatorConfig;
use crate::crd::{
    BackupPolicy, BackupSchedule, BackupScheduleSpec, BACKUP_POLICY_LABEL_KEY,
    BACKUP_SCHEDULE_LABEL_KEY, DATA_PROTECTION_FINALIZER, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE,
};
use crate::error::{Error, Result};
use crate::model::{ClientOptions, KubeObject, ObjectKey, ObjectKind};
use crate::reconcilers::scheduler::{child_name, Scheduler};
use crate::reconcilers::{delete_children, Converge, ManagedResource};
use crate::store::{LabelSelector, ObjectStore};

/// One year; larger deadlines are meaningless for a cron schedule
const MAX_STARTING_DEADLINE_MINUTES: i64 = 525_600;

impl ManagedResource for BackupSchedule {
    const KIND: ObjectKind = ObjectKind::BackupSchedule;
}

/// Validate the BackupSchedule spec
pub fn validate(spec: &BackupScheduleSpec) -> Result<()> {
    if spec.backup_policy_name.trim().is_empty() {
        return Err(Error::validation("backupPolicyName must be specified"));
    }

    if let Some(minutes) = spec.starting_deadline_minutes {
        if !(0..=MAX_STARTING_DEADLINE_MINUTES).contains(&minutes) {
            return Err(Error::validation(format!(
                "startingDeadlineMinutes must be between 0 and {}, got {}",
                MAX_STARTING_DEADLINE_MINUTES, minutes
            )));
        }
    }

    let mut methods = HashSet::new();
    for entry in &spec.schedules {
        if entry.backup_method.is_empty() {
            return Err(Error::validation("backupMethod must be specified for every schedule"));
        }
        if !is_dns_label(&entry.backup_method) {
            return Err(Error::validation(format!(
                "backup method {:?} must be a lowercase RFC 1123 label",
                entry.backup_method
            )));
        }
        if !methods.insert(entry.backup_method.as_str()) {
            return Err(Error::validation(format!(
                "backup method {} is scheduled more than once",
                entry.backup_method
            )));
        }
        validate_cron(&entry.cron_expression)?;
    }
    Ok(())
}

/// Every entry must map to its own child object once names are truncated
pub fn validate_child_names(schedule: &str, spec: &BackupScheduleSpec) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for entry in &spec.schedules {
        let name = child_name(schedule, &entry.backup_method);
        if let Some(other) = seen.insert(name.clone(), &entry.backup_method) {
            return Err(Error::validation(format!(
                "backup methods {} and {} both map to child {}",
                other, entry.backup_method, name
            )));
        }
    }
    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first() != Some(&b'-')
        && bytes.last() != Some(&b'-')
}

/// CronJobs take five-field expressions; the `cron` crate wants a seconds
/// field in front.
fn validate_cron(expression: &str) -> Result<()> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(Error::validation(format!(
            "Invalid cron expression '{}': expected 5 fields, got {}",
            expression, fields
        )));
    }
    Schedule::from_str(&format!("0 {}", expression))
        .map(|_| ())
        .map_err(|e| Error::validation(format!("Invalid cron expression '{}': {}", expression, e)))
}

/// Collapse runs of whitespace in cron expressions. Returns whether the
/// spec changed.
pub fn canonicalize(spec: &mut BackupScheduleSpec) -> bool {
    let mut changed = false;
    for entry in &mut spec.schedules {
        let canonical = entry
            .cron_expression
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if canonical != entry.cron_expression {
            entry.cron_expression = canonical;
            changed = true;
        }
    }
    changed
}

/// Converges BackupSchedules through an object store
pub struct BackupScheduleReconciler<'a> {
    store: &'a dyn ObjectStore,
    config: &'a OperatorConfig,
    client: ClientOptions,
}

impl<'a> BackupScheduleReconciler<'a> {
    pub fn new(store: &'a dyn ObjectStore, config: &'a OperatorConfig) -> Self {
        Self {
            store,
            config,
            client: ClientOptions {
                field_manager: Some(config.field_manager.clone()),
                dry_run: false,
            },
        }
    }

    #[instrument(skip_all, fields(name = %schedule.name_any()))]
    async fn handle_schedule(&self, schedule: &mut BackupSchedule) -> Result<()> {
        let namespace = namespace_of(schedule);
        let policy = self
            .backup_policy(&namespace, &schedule.spec.backup_policy_name)
            .await?;
        for entry in &schedule.spec.schedules {
            if policy.method(&entry.backup_method).is_none() {
                return Err(Error::validation(format!(
                    "backup method {} not found in BackupPolicy {}",
                    entry.backup_method,
                    policy.name_any()
                )));
            }
        }

        self.patch_schedule_metadata(schedule).await?;
        let service_account = self.ensure_worker_service_account(&namespace).await?;

        Scheduler {
            store: self.store,
            schedule: &*schedule,
            policy: &policy,
            worker_service_account: &service_account,
            worker_image: &self.config.worker_image,
            client: self.client.clone(),
        }
        .schedule()
        .await?;
        Ok(())
    }

    /// Fetch the referenced policy. Missing is an error; not yet available
    /// is a retry signal.
    async fn backup_policy(&self, namespace: &str, name: &str) -> Result<BackupPolicy> {
        let key = ObjectKey::new(ObjectKind::BackupPolicy, namespace, name);
        let policy: BackupPolicy = self.store.get(&key).await?.parse()?;
        if !policy.is_available() {
            return Err(Error::requeue(format!(
                "BackupPolicy {} is not available yet",
                name
            )));
        }
        Ok(policy)
    }

    /// Label the schedule with its policy name so it can be found by policy
    async fn patch_schedule_metadata(&self, schedule: &mut BackupSchedule) -> Result<()> {
        let policy_name = schedule.spec.backup_policy_name.clone();
        if schedule.labels().get(BACKUP_POLICY_LABEL_KEY) == Some(&policy_name) {
            return Ok(());
        }
        debug!(policy = %policy_name, "Labelling schedule with its policy");
        let key = ObjectKey::new(
            ObjectKind::BackupSchedule,
            namespace_of(schedule),
            schedule.name_any(),
        );
        let mut labels = serde_json::Map::new();
        labels.insert(BACKUP_POLICY_LABEL_KEY.to_string(), json!(policy_name));
        let patch = json!({ "metadata": { "labels": labels } });
        let patched = self.store.patch(&key, &patch, &self.client).await?;
        *schedule.meta_mut() = patched.object.metadata;
        Ok(())
    }

    /// Create the worker ServiceAccount if it does not exist. Returns its name.
    async fn ensure_worker_service_account(&self, namespace: &str) -> Result<String> {
        let name = self.config.worker_service_account.clone();
        let key = ObjectKey::new(ObjectKind::ServiceAccount, namespace, &name);
        match self.store.get(&key).await {
            Ok(_) => return Ok(name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [(
                        MANAGED_BY_LABEL_KEY.to_string(),
                        MANAGED_BY_LABEL_VALUE.to_string(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        let object = KubeObject::from_resource(ObjectKind::ServiceAccount, &account)?;
        match self.store.create(&object, &self.client).await {
            Ok(_) => info!(service_account = %name, namespace, "Created worker ServiceAccount"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(name)
    }
}

#[async_trait]
impl<'a> Converge<BackupSchedule> for BackupScheduleReconciler<'a> {
    async fn converge(&self, schedule: &mut BackupSchedule) -> Result<()> {
        if canonicalize(&mut schedule.spec) {
            debug!(name = %schedule.name_any(), "Canonicalized cron expressions");
        }
        validate(&schedule.spec)?;
        validate_child_names(&schedule.name_any(), &schedule.spec)?;
        self.handle_schedule(schedule).await
    }

    async fn cleanup(&self, schedule: &BackupSchedule) -> Result<()> {
        let selector: LabelSelector = [(BACKUP_SCHEDULE_LABEL_KEY.to_string(), schedule.name_any())]
            .into_iter()
            .collect();
        let deleted = delete_children(
            self.store,
            ObjectKind::CronJob,
            &namespace_of(schedule),
            &selector,
            DATA_PROTECTION_FINALIZER,
            &self.client,
        )
        .await?;
        info!(name = %schedule.name_any(), deleted, "Deleted backup CronJobs");
        Ok(())
    }
}

fn namespace_of(schedule: &BackupSchedule) -> String {
    schedule
        .namespace()
        .unwrap_or_else(|| "default".to_string())
}
