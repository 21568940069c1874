//! Reconciliation worker.
//!
//! Compares persisted intent with what the runtimes can observe on the host.
//! Each pass resumes `ENDING` labs whose driver is gone, fails abandoned
//! `REQUESTED`/`PROVISIONING` rows, marks labs whose instance vanished as
//! `lost_process`, and reports instances no lab row accounts for.
//! Orphans are only terminated when `kill_orphans` is set.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{LabError, LabResult};
use crate::lab::{FailureReason, Lab, LabManager, LabStatus};
use crate::runtime::{ObservedInstance, RuntimeStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    /// Instances with no non-terminal lab row.
    pub orphaned: Vec<ObservedInstance>,
    /// Labs expected to be running whose instance is gone.
    pub missing: Vec<Uuid>,
    /// `ENDING` labs whose teardown was resumed.
    pub resumed: Vec<Uuid>,
    /// Abandoned `REQUESTED`/`PROVISIONING` labs that were failed.
    pub interrupted: Vec<Uuid>,
    /// Orphan locators that were terminated.
    pub terminated: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.missing.is_empty()
    }

    /// One `lost_process` per missing lab and one `leak` per orphan.
    pub fn findings(&self) -> Vec<LabError> {
        self.missing
            .iter()
            .map(|lab_id| LabError::LostProcess(*lab_id))
            .chain(
                self.orphaned
                    .iter()
                    .map(|instance| LabError::Leak(instance.locator.clone())),
            )
            .collect()
    }
}

pub struct Reconciler {
    manager: Arc<LabManager>,
    config: WorkerConfig,
}

impl Reconciler {
    pub fn new(manager: Arc<LabManager>, config: WorkerConfig) -> Self {
        Self { manager, config }
    }

    /// Look only. Nothing is transitioned or terminated.
    pub async fn detect_drift(&self) -> LabResult<DriftReport> {
        let active = self.manager.store().list_by_status(&LabStatus::ACTIVE)?;
        let expecting: Vec<Lab> = active
            .iter()
            .filter(|lab| lab.status.expects_instance() && !self.manager.is_busy(&lab.lab_id))
            .cloned()
            .collect();
        Ok(DriftReport {
            missing: self.missing(&expecting).await,
            orphaned: self.orphans(&active).await,
            ..DriftReport::default()
        })
    }

    /// One reconciliation pass.
    pub async fn tick(&self) -> LabResult<DriftReport> {
        let mut report = DriftReport::default();
        let store = self.manager.store();

        for lab in store.list_by_status(&[LabStatus::Ending])? {
            match self.manager.resume_teardown(&lab.lab_id).await {
                Ok(true) => {
                    info!(lab_id = %lab.lab_id, "resumed teardown");
                    report.resumed.push(lab.lab_id);
                }
                Ok(false) => debug!(lab_id = %lab.lab_id, "teardown in progress"),
                Err(e) => error!(lab_id = %lab.lab_id, error = %e, "resumed teardown failed"),
            }
        }

        let pending = [LabStatus::Requested, LabStatus::Provisioning];
        let now = Utc::now();
        for lab in store.list_by_status(&pending)? {
            let idle = (now - lab.updated_at).num_seconds();
            if idle < self.stale_secs() || self.manager.is_busy(&lab.lab_id) {
                continue;
            }
            let detail = format!("no provisioning driver since {}", lab.updated_at.to_rfc3339());
            match self
                .manager
                .fail_unowned(&lab.lab_id, &pending, FailureReason::Interrupted, Some(detail))
                .await
            {
                Ok(true) => report.interrupted.push(lab.lab_id),
                Ok(false) => {}
                Err(e) => error!(lab_id = %lab.lab_id, error = %e, "could not fail abandoned lab"),
            }
        }

        let expecting: Vec<Lab> = store
            .list_by_status(&[LabStatus::Provisioning, LabStatus::Ready])?
            .into_iter()
            .filter(|lab| !self.manager.is_busy(&lab.lab_id))
            .collect();
        for lab_id in self.missing(&expecting).await {
            let expected = [LabStatus::Provisioning, LabStatus::Ready];
            match self
                .manager
                .fail_unowned(
                    &lab_id,
                    &expected,
                    FailureReason::LostProcess,
                    Some("runtime reports no instance".into()),
                )
                .await
            {
                Ok(true) => report.missing.push(lab_id),
                Ok(false) => {}
                Err(e) => error!(lab_id = %lab_id, error = %e, "could not fail lost lab"),
            }
        }

        let active = store.list_by_status(&LabStatus::ACTIVE)?;
        report.orphaned = self.orphans(&active).await;
        if self.config.kill_orphans {
            for instance in &report.orphaned {
                let Ok(runtime) = self.manager.runtimes().get(instance.runtime_kind) else {
                    continue;
                };
                let outcome = runtime.terminate(instance).await;
                if outcome.is_clean() {
                    warn!(locator = %instance.locator, pid = ?instance.pid, "orphan terminated");
                    report.terminated.push(instance.locator.clone());
                } else {
                    error!(locator = %instance.locator, ?outcome, "orphan termination incomplete");
                }
            }
        }

        for finding in report.findings() {
            warn!(kind = finding.kind(), error = %finding, "drift");
        }
        Ok(report)
    }

    fn stale_secs(&self) -> i64 {
        i64::try_from(self.config.stale_request_secs).unwrap_or(i64::MAX)
    }

    async fn missing(&self, labs: &[Lab]) -> Vec<Uuid> {
        let checks = labs.iter().map(|lab| async move {
            let runtime = self.manager.runtimes().get(lab.runtime_kind).ok()?;
            (runtime.status(lab).await == RuntimeStatus::Gone).then_some(lab.lab_id)
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn orphans(&self, active: &[Lab]) -> Vec<ObservedInstance> {
        let known: HashSet<Uuid> = active.iter().map(|lab| lab.lab_id).collect();
        let observations = join_all(self.manager.runtimes().all().map(|runtime| async move {
            match runtime.observe().await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(runtime = %runtime.kind(), error = %e, "observe failed");
                    Vec::new()
                }
            }
        }))
        .await;

        let mut orphans: Vec<ObservedInstance> = observations
            .into_iter()
            .flatten()
            .filter(|instance| !instance.lab_id.is_some_and(|id| known.contains(&id)))
            .collect();
        orphans.sort_by(|a, b| a.locator.cmp(&b.locator));
        orphans
    }

    /// Run passes until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report == DriftReport::default() => {}
                        Ok(report) => info!(
                            resumed = report.resumed.len(),
                            interrupted = report.interrupted.len(),
                            missing = report.missing.len(),
                            orphaned = report.orphaned.len(),
                            terminated = report.terminated.len(),
                            "reconciliation pass"
                        ),
                        Err(e) => error!(error = %e, "reconciliation pass failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::lab::{LabStore, LabUpdate};
    use crate::recipe::{EndpointSpec, Recipe, StaticCatalog};
    use crate::runtime::{NoopRuntime, RuntimeKind, RuntimeRegistry};

    fn setup(kill_orphans: bool) -> (Arc<LabManager>, Arc<NoopRuntime>, Reconciler) {
        let noop = Arc::new(NoopRuntime::new());
        let catalog = StaticCatalog::new().with(Recipe {
            recipe_ref: "web-basic".into(),
            runtime: None,
            compose_file: "compose.yaml".into(),
            endpoint: EndpointSpec {
                service: "web".into(),
                port: 8080,
            },
            files: Vec::new(),
        });
        let manager = LabManager::new(
            Arc::new(LabStore::open_in_memory().unwrap()),
            RuntimeRegistry::new().with(noop.clone()),
            Arc::new(catalog),
            ManagerConfig {
                default_runtime: RuntimeKind::Noop,
                ..ManagerConfig::default()
            },
        );
        let reconciler = Reconciler::new(
            manager.clone(),
            WorkerConfig {
                interval_secs: 1,
                stale_request_secs: 0,
                kill_orphans,
            },
        );
        (manager, noop, reconciler)
    }

    fn ready_lab(manager: &LabManager, noop: &NoopRuntime, owner: &str) -> Uuid {
        let lab = Lab::new(owner, "web-basic", RuntimeKind::Noop);
        manager.store().insert_new(&lab, 16).unwrap();
        let store = manager.store();
        store
            .transition(&lab.lab_id, LabStatus::Provisioning, LabUpdate::default())
            .unwrap();
        store
            .transition(&lab.lab_id, LabStatus::Ready, LabUpdate::ready("noop://x".into()))
            .unwrap();
        noop.spawn_stray(Some(lab.lab_id));
        lab.lab_id
    }

    #[tokio::test]
    async fn clean_host_reports_nothing() {
        let (manager, noop, reconciler) = setup(false);
        ready_lab(&manager, &noop, "u1");
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report, DriftReport::default());
    }

    #[tokio::test]
    async fn vanished_instance_fails_the_lab() {
        let (manager, noop, reconciler) = setup(false);
        let lab_id = ready_lab(&manager, &noop, "u1");
        noop.lose(&lab_id);

        let drift = reconciler.detect_drift().await.unwrap();
        assert_eq!(drift.missing, vec![lab_id]);
        assert_eq!(
            manager.store().get(&lab_id).unwrap().unwrap().status,
            LabStatus::Ready
        );

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.missing, vec![lab_id]);
        let lab = manager.store().get(&lab_id).unwrap().unwrap();
        assert_eq!(lab.status, LabStatus::Failed);
        assert_eq!(lab.failure_reason, Some(FailureReason::LostProcess));
        assert_eq!(lab.connection_endpoint, None);
    }

    #[tokio::test]
    async fn orphans_are_reported_and_optionally_killed() {
        let (_, noop, reconciler) = setup(false);
        let stray = noop.spawn_stray(None);
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].locator, stray);
        assert!(report.terminated.is_empty());
        assert_eq!(noop.instance_count(), 1);

        let (_, noop, reconciler) = setup(true);
        noop.spawn_stray(Some(Uuid::new_v4()));
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
        assert_eq!(noop.instance_count(), 0);
    }

    #[tokio::test]
    async fn drift_is_classified_as_lost_process_and_leak() {
        let (manager, noop, reconciler) = setup(false);
        let lab_id = ready_lab(&manager, &noop, "u1");
        noop.lose(&lab_id);
        let stray = noop.spawn_stray(None);

        let report = reconciler.tick().await.unwrap();
        let findings = report.findings();
        let kinds: Vec<_> = findings.iter().map(LabError::kind).collect();
        assert_eq!(kinds, ["lost_process", "leak"]);
        assert!(findings[0].to_string().contains(&lab_id.to_string()));
        assert!(findings[1].to_string().contains(&stray));
    }

    #[tokio::test]
    async fn ending_labs_are_finished() {
        let (manager, noop, reconciler) = setup(false);
        let lab_id = ready_lab(&manager, &noop, "u1");
        manager
            .store()
            .transition(&lab_id, LabStatus::Ending, LabUpdate::default())
            .unwrap();

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.resumed, vec![lab_id]);
        assert_eq!(
            manager.store().get(&lab_id).unwrap().unwrap().status,
            LabStatus::Finished
        );
        assert!(!noop.is_running(&lab_id));
    }

    #[tokio::test]
    async fn abandoned_requests_are_interrupted() {
        let (manager, _, reconciler) = setup(false);
        let lab = Lab::new("u1", "web-basic", RuntimeKind::Noop);
        manager.store().insert_new(&lab, 16).unwrap();

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.interrupted, vec![lab.lab_id]);
        let failed = manager.store().get(&lab.lab_id).unwrap().unwrap();
        assert_eq!(failed.failure_reason, Some(FailureReason::Interrupted));
    }
}
