//! Kubernetes controllers for the data protection CRDs
//!
//! This module contains the controller wiring that watches for changes and
//! hands each BackupSchedule to the reconcile state machine.

mod backup_schedule_controller;

pub use backup_schedule_controller::{
    run as run_backup_schedule_controller, schedule_for_backup, schedule_for_cron_job,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;

use crate::config::OperatorConfig;
use crate::crd::DATA_PROTECTION_FINALIZER;
use crate::events::{reasons, EventPublisher, KubeEventPublisher};
use crate::model::{ClientOptions, ObjectKey};
use crate::reconcilers::StateMachine;
use crate::store::{KubeStore, ObjectStore};

/// Name reported on events and used as the default field manager
pub const CONTROLLER_NAME: &str = "backup-schedule-controller";

/// Shared context for all controllers
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventPublisher>,
    pub config: OperatorConfig,
    pub backoff: Backoff,
}

impl Context {
    /// Context talking to the cluster behind `client`
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
        let events = Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME));
        Self::with_parts(store, events, config)
    }

    pub fn with_parts(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventPublisher>,
        config: OperatorConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            store,
            events,
            config,
            backoff,
        }
    }

    /// State machine configured for BackupSchedules
    pub fn backup_schedule_machine(&self) -> StateMachine<'_> {
        StateMachine {
            store: self.store.as_ref(),
            events: self.events.as_ref(),
            finalizer: DATA_PROTECTION_FINALIZER,
            failure_reason: reasons::HANDLE_BACKUP_SCHEDULE_FAILED,
            reconcile_interval: self.config.reconcile_interval,
            client: ClientOptions {
                field_manager: Some(self.config.field_manager.clone()),
                dry_run: false,
            },
        }
    }
}

/// Per-object exponential backoff for failed reconciliations
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return how long to wait: `base * 2^(n-1)`,
    /// capped at `max`, for the n-th consecutive failure.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let failures = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.clone()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        };
        let factor = 2u32.saturating_pow(failures - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Forget past failures after a successful pass
    pub fn reset(&self, key: &ObjectKey) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let key = ObjectKey::new(ObjectKind::BackupSchedule, "db", "nightly");
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay(&key).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);

        backoff.reset(&key);
        assert_eq!(backoff.next_delay(&key), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_per_object() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let a = ObjectKey::new(ObjectKind::BackupSchedule, "db", "a");
        let b = ObjectKey::new(ObjectKind::BackupSchedule, "db", "b");
        backoff.next_delay(&a);
        backoff.next_delay(&a);
        assert_eq!(backoff.next_delay(&b), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_survives_many_failures() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let key = ObjectKey::new(ObjectKind::BackupSchedule, "db", "nightly");
        for _ in 0..100 {
            backoff.next_delay(&key);
        }
        assert_eq!(backoff.next_delay(&key), Duration::from_secs(300));
    }
}
