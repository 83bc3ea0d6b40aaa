//! BackupSchedule controller
//!
//! Watches BackupSchedule resources, the CronJobs they own and continuous
//! Backups, and triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::CronJob;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::{Backup, BackupSchedule, BackupType, BACKUP_SCHEDULE_LABEL_KEY, BACKUP_TYPE_LABEL_KEY};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{ObjectKey, ObjectKind};
use crate::reconcilers::backup_schedule::BackupScheduleReconciler;

const KIND: &str = "BackupSchedule";

/// Run the BackupSchedule controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<BackupSchedule> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("BackupSchedule CRD not installed: {}", e);
        return;
    }

    info!("Starting BackupSchedule controller");

    let cron_jobs: Api<CronJob> = Api::all(client.clone());
    let backups: Api<Backup> = Api::all(client);
    let config = ControllerConfig::default().concurrency(context.config.concurrency);

    Controller::new(api, WatcherConfig::default())
        .watches(
            cron_jobs,
            WatcherConfig::default().labels(BACKUP_SCHEDULE_LABEL_KEY),
            schedule_for_cron_job,
        )
        .watches(backups, WatcherConfig::default(), schedule_for_backup)
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled BackupSchedule"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
}

/// CronJobs point back at their schedule through the schedule label
pub fn schedule_for_cron_job(cron_job: CronJob) -> Option<ObjectRef<BackupSchedule>> {
    let name = cron_job.labels().get(BACKUP_SCHEDULE_LABEL_KEY)?.clone();
    let namespace = cron_job.namespace()?;
    Some(ObjectRef::new(&name).within(&namespace))
}

/// Continuous Backups trigger a reconcile of the schedule named by the
/// schedule label key itself, not the label's value.
// TODO: enqueue the schedule named by the label value; the key-named request
// only resolves if a schedule is literally called that.
pub fn schedule_for_backup(backup: Backup) -> Option<ObjectRef<BackupSchedule>> {
    let continuous = backup.labels().get(BACKUP_TYPE_LABEL_KEY).map(String::as_str)
        == Some(BackupType::Continuous.as_str());
    if !continuous {
        return None;
    }
    let namespace = backup.namespace()?;
    Some(ObjectRef::new(BACKUP_SCHEDULE_LABEL_KEY).within(&namespace))
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<BackupSchedule>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let key = schedule_key(&obj);
    let reconciler = BackupScheduleReconciler::new(ctx.store.as_ref(), &ctx.config);
    let action = ctx
        .backup_schedule_machine()
        .run::<BackupSchedule, _>(&key, &reconciler)
        .await?;
    ctx.backoff.reset(&key);
    Ok(action)
}

/// Error policy for the controller
fn error_policy(obj: Arc<BackupSchedule>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[KIND, error.metric_label()])
        .inc();

    let delay = ctx.backoff.next_delay(&schedule_key(&obj));
    error!(
        name = %obj.name_any(),
        error = %error,
        retry_in_secs = delay.as_secs(),
        "Reconciliation failed, scheduling retry"
    );
    Action::requeue(delay)
}

fn schedule_key(obj: &BackupSchedule) -> ObjectKey {
    ObjectKey::new(
        ObjectKind::BackupSchedule,
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any(),
    )
}
