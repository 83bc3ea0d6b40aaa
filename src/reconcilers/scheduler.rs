//! Backup schedule planner
//!
//! Turns a BackupSchedule into a dependency graph:
//!
//! - the schedule itself as a root `Noop` vertex
//! - one CronJob per enabled periodic method (`Create`, or `Patch` if it exists)
//! - one long-running Backup per enabled continuous method (`Create` with
//!   replace-if-existing)
//! - `Delete` vertices for children that are no longer wanted, ordered after
//!   every create or patch so replacements exist before anything is removed
//!
//! CronJobs carry the data protection finalizer. A stale CronJob is deleted
//! in one pass and released in the next, once it shows up as terminating.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::PropagationPolicy;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{
    Backup, BackupMethod, BackupPolicy, BackupSchedule, BackupSpec, BackupType, SchedulePolicy,
    BACKUP_METHOD_LABEL_KEY, BACKUP_POLICY_LABEL_KEY, BACKUP_SCHEDULE_LABEL_KEY,
    BACKUP_TYPE_LABEL_KEY, DATA_PROTECTION_FINALIZER, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE,
};
use crate::error::{Error, Result};
use crate::model::{
    ClientOptions, DependencyGraph, GraphExecutor, GraphOption, GraphOptions, KubeObject,
    ObjectKey, ObjectKind, Vertex,
};
use crate::store::{LabelSelector, ObjectStore};

/// Longest CronJob name the API server accepts
const MAX_CRONJOB_NAME_LEN: usize = 52;

/// Plans and applies the children of one BackupSchedule
pub struct Scheduler<'a> {
    pub store: &'a dyn ObjectStore,
    pub schedule: &'a BackupSchedule,
    pub policy: &'a BackupPolicy,
    pub worker_service_account: &'a str,
    pub worker_image: &'a str,
    pub client: ClientOptions,
}

impl<'a> Scheduler<'a> {
    /// Build the graph and apply it. Returns the number of objects changed.
    pub async fn schedule(&self) -> Result<usize> {
        let mut graph = self.plan().await?;
        let applied = GraphExecutor::new(self.store).apply(&mut graph).await?;
        if applied > 0 {
            info!(
                schedule = %self.schedule.name_any(),
                applied,
                "Backup schedule children updated"
            );
        }
        Ok(applied)
    }

    /// Read current children and build the graph that converges them
    pub async fn plan(&self) -> Result<DependencyGraph> {
        let namespace = self.namespace();
        let mut graph = DependencyGraph::new();
        let root = graph.add_vertex(Vertex::noop(KubeObject::from_resource(
            ObjectKind::BackupSchedule,
            self.schedule,
        )?));

        let mut existing: BTreeMap<String, KubeObject> = self
            .store
            .list(ObjectKind::CronJob, &namespace, &self.children_selector())
            .await?
            .into_iter()
            .map(|cron_job| (cron_job.name().to_string(), cron_job))
            .collect();

        let mut wanted = Vec::new();
        let mut unwanted = Vec::new();

        // Terminating CronJobs only need our finalizer released
        let terminating: Vec<String> = existing
            .iter()
            .filter(|(_, cron_job)| cron_job.is_terminating())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &terminating {
            if let Some(cron_job) = existing.remove(name) {
                if let Some(vertex) = release_vertex(cron_job, &self.client)? {
                    unwanted.push(graph.add_vertex(vertex));
                }
            }
        }

        for entry in &self.schedule.spec.schedules {
            let method = self.method(&entry.backup_method)?;
            if method.continuous {
                let key = self.plan_continuous(&mut graph, entry, method).await?;
                match (key, entry.enabled) {
                    (Some(key), true) => wanted.push(key),
                    (Some(key), false) => unwanted.push(key),
                    (None, _) => {}
                }
                continue;
            }

            let name = child_name(&self.schedule.name_any(), &method.name);
            if !entry.enabled || terminating.contains(&name) {
                continue;
            }
            let owned = self.cron_job(&name, entry)?;
            let vertex = match existing.remove(&name) {
                Some(observed) => {
                    let desired = merge_owned(&observed, owned)?;
                    Vertex::patch(observed, desired, self.options())?
                }
                None => Vertex::create(owned, self.options()),
            };
            wanted.push(graph.add_vertex(vertex));
        }

        for (name, observed) in existing {
            debug!(cron_job = %name, "CronJob is no longer scheduled");
            let options = self
                .options()
                .with_propagation_policy(PropagationPolicy::Background);
            unwanted.push(graph.add_vertex(Vertex::delete(observed, options)));
        }

        for stale in &unwanted {
            for replacement in &wanted {
                graph.add_edge(stale, replacement)?;
            }
        }

        let children: Vec<ObjectKey> = graph
            .find_all(ObjectKind::BackupSchedule, &[GraphOption::HaveDifferentTypeWith])
            .into_iter()
            .map(|v| v.key().clone())
            .collect();
        for child in &children {
            graph.add_edge(&root, child)?;
        }

        Ok(graph)
    }

    /// Adds the vertex for a continuous method's Backup, if there is anything to do
    async fn plan_continuous(
        &self,
        graph: &mut DependencyGraph,
        entry: &SchedulePolicy,
        method: &BackupMethod,
    ) -> Result<Option<ObjectKey>> {
        let name = child_name(&self.schedule.name_any(), &method.name);
        let key = ObjectKey::new(ObjectKind::Backup, self.namespace(), &name);
        let observed = match self.store.get(&key).await {
            Ok(observed) => Some(observed),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        if observed.as_ref().map(KubeObject::is_terminating).unwrap_or(false) {
            return Ok(None);
        }

        let vertex = match (entry.enabled, observed) {
            (true, Some(observed)) => {
                let desired = merge_owned(&observed, self.continuous_backup(&name, entry)?)?;
                Vertex::patch(observed, desired, self.options())?
            }
            (true, None) => Vertex::create(
                self.continuous_backup(&name, entry)?,
                self.options().replace_if_existing(),
            ),
            (false, Some(observed)) => Vertex::delete(
                observed,
                self.options()
                    .with_propagation_policy(PropagationPolicy::Background),
            ),
            (false, None) => return Ok(None),
        };
        Ok(Some(graph.add_vertex(vertex)))
    }

    fn cron_job(&self, name: &str, entry: &SchedulePolicy) -> Result<KubeObject> {
        let schedule_name = self.schedule.name_any();
        let labels = self.labels(&entry.backup_method);
        let spec = &self.schedule.spec;

        let container = Container {
            name: "backup".to_string(),
            image: Some(self.worker_image.to_string()),
            args: Some(vec!["create-backup".to_string()]),
            env: Some(vec![
                env("BACKUP_NAMESPACE", &self.namespace()),
                env("BACKUP_SCHEDULE", &schedule_name),
                env("BACKUP_POLICY", &spec.backup_policy_name),
                env("BACKUP_METHOD", &entry.backup_method),
                env("RETENTION_PERIOD", &entry.retention_period),
            ]),
            ..Default::default()
        };
        let pod_labels = Some(labels.clone());

        let cron_job = CronJob {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace()),
                labels: Some(labels.clone()),
                finalizers: Some(vec![DATA_PROTECTION_FINALIZER.to_string()]),
                owner_references: Some(vec![self.owner_reference()?]),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                schedule: entry.cron_expression.clone(),
                concurrency_policy: Some("Forbid".to_string()),
                starting_deadline_seconds: self.starting_deadline_seconds()?,
                successful_jobs_history_limit: Some(1),
                failed_jobs_history_limit: Some(1),
                job_template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: pod_labels.clone(),
                        ..Default::default()
                    }),
                    spec: Some(JobSpec {
                        backoff_limit: Some(0),
                        template: PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: pod_labels,
                                ..Default::default()
                            }),
                            spec: Some(PodSpec {
                                service_account_name: Some(
                                    self.worker_service_account.to_string(),
                                ),
                                restart_policy: Some("Never".to_string()),
                                containers: vec![container],
                                ..Default::default()
                            }),
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };
        KubeObject::from_resource(ObjectKind::CronJob, &cron_job)
    }

    fn starting_deadline_seconds(&self) -> Result<Option<i64>> {
        self.schedule
            .spec
            .starting_deadline_minutes
            .map(|minutes| {
                minutes.checked_mul(60).ok_or_else(|| {
                    Error::validation(format!(
                        "startingDeadlineMinutes {} is out of range",
                        minutes
                    ))
                })
            })
            .transpose()
    }

    fn continuous_backup(&self, name: &str, entry: &SchedulePolicy) -> Result<KubeObject> {
        let mut labels = self.labels(&entry.backup_method);
        labels.insert(
            BACKUP_TYPE_LABEL_KEY.to_string(),
            BackupType::Continuous.as_str().to_string(),
        );

        let mut backup = Backup::new(
            name,
            BackupSpec {
                backup_policy_name: self.schedule.spec.backup_policy_name.clone(),
                backup_method: entry.backup_method.clone(),
                retention_period: Some(entry.retention_period.clone()),
            },
        );
        backup.metadata.namespace = Some(self.namespace());
        backup.metadata.labels = Some(labels);
        backup.metadata.owner_references = Some(vec![self.owner_reference()?]);
        KubeObject::from_resource(ObjectKind::Backup, &backup)
    }

    fn labels(&self, method: &str) -> BTreeMap<String, String> {
        let mut labels = self.children_selector();
        labels.insert(
            BACKUP_POLICY_LABEL_KEY.to_string(),
            self.schedule.spec.backup_policy_name.clone(),
        );
        labels.insert(BACKUP_METHOD_LABEL_KEY.to_string(), method.to_string());
        labels.insert(
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        );
        labels
    }

    /// Labels that tie a child back to this schedule
    fn children_selector(&self) -> LabelSelector {
        [(
            BACKUP_SCHEDULE_LABEL_KEY.to_string(),
            self.schedule.name_any(),
        )]
        .into_iter()
        .collect()
    }

    fn owner_reference(&self) -> Result<OwnerReference> {
        self.schedule.controller_owner_ref(&()).ok_or_else(|| {
            Error::validation(format!(
                "BackupSchedule {} has no uid yet",
                self.schedule.name_any()
            ))
        })
    }

    fn method(&self, name: &str) -> Result<&'a BackupMethod> {
        self.policy.method(name).ok_or_else(|| {
            Error::validation(format!(
                "backup method {} not found in BackupPolicy {}",
                name,
                self.policy.name_any()
            ))
        })
    }

    fn namespace(&self) -> String {
        self.schedule
            .namespace()
            .unwrap_or_else(|| "default".to_string())
    }

    fn options(&self) -> GraphOptions {
        GraphOptions::default().with_client_options(self.client.clone())
    }
}

/// Name of the child object running `method` for `schedule`
pub fn child_name(schedule: &str, method: &str) -> String {
    let mut name = format!("{}-{}", schedule, method).to_lowercase();
    if name.len() > MAX_CRONJOB_NAME_LEN {
        let mut end = MAX_CRONJOB_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Lay the fields we own over the stored object, keeping fields the server
/// or other controllers set and any foreign finalizers.
fn merge_owned(observed: &KubeObject, owned: KubeObject) -> Result<KubeObject> {
    let mut owned = owned;
    if !owned.finalizers().is_empty() {
        let mut finalizers = observed.finalizers().to_vec();
        for finalizer in owned.finalizers() {
            if !finalizers.contains(finalizer) {
                finalizers.push(finalizer.clone());
            }
        }
        owned.object.metadata.finalizers = Some(finalizers);
    } else {
        owned.object.metadata.finalizers = None;
    }

    let mut desired = observed.to_value()?;
    overlay(&mut desired, &owned.to_value()?);
    KubeObject::from_value(observed.kind, desired)
}

/// Merge-patch `owned` into `target`, except that lists of named entries
/// (containers, env vars, owner references) are matched by `name` and
/// merged entry by entry, so defaults the server filled in survive.
/// Entries missing from `owned` are dropped; order follows `owned`.
fn overlay(target: &mut Value, owned: &Value) {
    match (target, owned) {
        (Value::Object(target), Value::Object(owned)) => {
            for (key, value) in owned {
                if value.is_null() {
                    target.remove(key);
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, Value::Array(owned)) if target.is_array() && is_named_list(owned) => {
            let mut current = match target.take() {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            let merged = owned
                .iter()
                .map(|item| {
                    let position = current
                        .iter()
                        .position(|existing| existing.get("name") == item.get("name"));
                    match position {
                        Some(i) => {
                            let mut existing = current.swap_remove(i);
                            overlay(&mut existing, item);
                            existing
                        }
                        None => item.clone(),
                    }
                })
                .collect();
            *target = Value::Array(merged);
        }
        (target, owned) => *target = owned.clone(),
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get("name").and_then(Value::as_str).is_some())
}

/// Drops our finalizer from a terminating child so deletion can finish
fn release_vertex(observed: KubeObject, client: &ClientOptions) -> Result<Option<Vertex>> {
    if !observed
        .finalizers()
        .iter()
        .any(|f| f == DATA_PROTECTION_FINALIZER)
    {
        return Ok(None);
    }
    let mut desired = observed.clone();
    desired.object.metadata.finalizers = Some(
        observed
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != DATA_PROTECTION_FINALIZER)
            .cloned()
            .collect(),
    );
    let options = GraphOptions::default().with_client_options(client.clone());
    Ok(Some(Vertex::patch(observed, desired, options)?))
}
