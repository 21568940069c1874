//! Lab Lifecycle Manager.
//!
//! Validates create requests synchronously (input, recipe, runtime
//! preflight, tenancy, quota), persists the lab as `REQUESTED` and hands the
//! slow part to a spawned driver task. Callers never wait on a hypervisor.
//!
//! Work on one lab is serialized through a per-lab async lock. A driver
//! holds it for the whole provisioning or teardown run, so the worker can
//! tell a live driver from an abandoned row with a `try_lock`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::store::{LabStore, LabUpdate};
use super::{FailureReason, Lab, LabStatus};
use crate::config::ManagerConfig;
use crate::error::{LabError, LabResult};
use crate::recipe::{Recipe, RecipeCatalog};
use crate::runtime::{LabRuntime, RuntimeRegistry, RuntimeStatus, TeardownReport};

const READINESS_POLL: Duration = Duration::from_millis(250);
const MAX_OWNER_ID_LEN: usize = 128;

type LabLock = Arc<tokio::sync::Mutex<()>>;

pub struct LabManager {
    store: Arc<LabStore>,
    runtimes: RuntimeRegistry,
    recipes: Arc<dyn RecipeCatalog>,
    config: ManagerConfig,
    locks: Mutex<HashMap<Uuid, LabLock>>,
}

fn validate_owner(owner_id: &str) -> LabResult<()> {
    if owner_id.is_empty()
        || owner_id.len() > MAX_OWNER_ID_LEN
        || owner_id.chars().any(|c| c.is_control())
    {
        return Err(LabError::InvalidInput("owner_id is malformed".into()));
    }
    Ok(())
}

impl LabManager {
    pub fn new(
        store: Arc<LabStore>,
        runtimes: RuntimeRegistry,
        recipes: Arc<dyn RecipeCatalog>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtimes,
            recipes,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<LabStore> {
        &self.store
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }

    // -----------------------------------------------------------------------
    // Per-lab locks
    // -----------------------------------------------------------------------

    fn lab_lock(&self, lab_id: &Uuid) -> LabResult<LabLock> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LabError::Internal("lab lock map poisoned".into()))?;
        Ok(Arc::clone(locks.entry(*lab_id).or_default()))
    }

    /// Forget the lock for a lab nobody else is holding or waiting on.
    fn forget_lock(&self, lab_id: &Uuid) {
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(lab_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(lab_id);
            }
        }
    }

    /// True while a driver is working on the lab.
    pub fn is_busy(&self, lab_id: &Uuid) -> bool {
        match self.locks.lock() {
            Ok(locks) => locks.get(lab_id).is_some_and(|l| l.try_lock().is_err()),
            Err(_) => true,
        }
    }

    fn try_claim(&self, lab_id: &Uuid) -> LabResult<Option<OwnedMutexGuard<()>>> {
        Ok(self.lab_lock(lab_id)?.try_lock_owned().ok())
    }

    // -----------------------------------------------------------------------
    // Tenant operations
    // -----------------------------------------------------------------------

    /// Validate, persist as `REQUESTED` and start provisioning in the
    /// background. Every rejection happens before anything is persisted.
    pub async fn create_lab(self: &Arc<Self>, owner_id: &str, recipe_ref: &str) -> LabResult<Lab> {
        validate_owner(owner_id)?;
        let recipe = self.recipes.resolve(recipe_ref)?;
        let kind = recipe.runtime.unwrap_or(self.config.default_runtime);
        let runtime = self.runtimes.get(kind)?;
        runtime.preflight().await?;

        let lab = Lab::new(owner_id, recipe_ref, kind);
        // Held before the row exists, so the worker never sees it unowned.
        let guard = self.lab_lock(&lab.lab_id)?.lock_owned().await;
        if let Err(e) = self.store.insert_new(&lab, self.config.max_concurrent_labs) {
            drop(guard);
            self.forget_lock(&lab.lab_id);
            return Err(e);
        }
        info!(lab_id = %lab.lab_id, owner_id, recipe = recipe_ref, runtime = %kind, "lab requested");

        let manager = Arc::clone(self);
        let lab_id = lab.lab_id;
        tokio::spawn(async move {
            manager.drive_provisioning(lab_id, recipe, runtime, guard).await;
            manager.forget_lock(&lab_id);
        });
        Ok(lab)
    }

    /// The lab, if `owner_id` owns it. Foreign and unknown labs are both
    /// `NotFound`.
    pub fn get_lab(&self, lab_id: &Uuid, owner_id: &str) -> LabResult<Lab> {
        self.store.get_owned(lab_id, owner_id)
    }

    /// Move the lab to `ENDING` and tear it down in the background. The
    /// endpoint is cleared as part of the transition. Ending a terminal
    /// or already-ending lab is accepted and changes nothing.
    pub async fn end_lab(self: &Arc<Self>, lab_id: &Uuid, owner_id: &str) -> LabResult<Lab> {
        let mut lab = self.store.get_owned(lab_id, owner_id)?;
        // A provisioning driver may move the lab while we look at it.
        for _ in 0..3 {
            if lab.status.is_terminal() || lab.status == LabStatus::Ending {
                return Ok(lab);
            }
            match self
                .store
                .transition(lab_id, LabStatus::Ending, LabUpdate::default())
            {
                Ok(ending) => {
                    info!(lab_id = %lab_id, from = %lab.status, "lab ending");
                    self.spawn_teardown(*lab_id);
                    return Ok(ending);
                }
                Err(LabError::InvalidTransition { .. }) => {
                    lab = self.store.get_owned(lab_id, owner_id)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(LabError::Internal(format!(
            "lab {lab_id} kept changing state during end"
        )))
    }

    fn spawn_teardown(self: &Arc<Self>, lab_id: Uuid) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let lock = match manager.lab_lock(&lab_id) {
                Ok(lock) => lock,
                Err(e) => {
                    error!(lab_id = %lab_id, error = %e, "teardown not started");
                    return;
                }
            };
            let guard = lock.lock_owned().await;
            if let Err(e) = manager.run_teardown(&lab_id).await {
                error!(lab_id = %lab_id, error = %e, "teardown failed");
            }
            drop(guard);
            manager.forget_lock(&lab_id);
        });
    }

    // -----------------------------------------------------------------------
    // Drivers
    // -----------------------------------------------------------------------

    async fn drive_provisioning(
        &self,
        lab_id: Uuid,
        recipe: Recipe,
        runtime: Arc<dyn LabRuntime>,
        guard: OwnedMutexGuard<()>,
    ) {
        // Recorded before the runtime touches the host, so a crash mid-create
        // leaves a PROVISIONING row the worker can interrupt and clean up.
        let lab = match self
            .store
            .transition(&lab_id, LabStatus::Provisioning, LabUpdate::default())
        {
            Ok(lab) => lab,
            Err(e) => {
                info!(lab_id = %lab_id, reason = %e, "provisioning not started");
                return;
            }
        };

        match runtime.create_lab(&lab, &recipe).await {
            Ok(launched) => {
                let lab = match self
                    .store
                    .attach_handles(&lab_id, launched.network.clone(), launched.vm.clone())
                {
                    Ok(lab) => lab,
                    Err(e) => {
                        error!(lab_id = %lab_id, error = %e, "could not record handles");
                        lab
                    }
                };

                if !self.await_running(runtime.as_ref(), &lab).await {
                    error!(lab_id = %lab_id, "lab did not report running in time");
                    self.fail_and_destroy(
                        runtime.as_ref(),
                        &lab_id,
                        FailureReason::ReadinessTimeout,
                        None,
                    )
                    .await;
                    return;
                }

                match self
                    .store
                    .transition(&lab_id, LabStatus::Ready, LabUpdate::ready(launched.endpoint))
                {
                    Ok(_) => info!(lab_id = %lab_id, "lab ready"),
                    Err(LabError::InvalidTransition { from, .. }) => {
                        // Ended while provisioning; the teardown driver is
                        // waiting for this lock.
                        info!(lab_id = %lab_id, status = %from, "lab ended before it became ready");
                    }
                    Err(e) => error!(lab_id = %lab_id, error = %e, "could not mark lab ready"),
                }
            }
            Err(err) => {
                error!(
                    lab_id = %lab_id,
                    step = %err.step,
                    kind = err.step.error_kind(),
                    error = %err.message,
                    "provisioning failed"
                );
                self.fail_and_destroy(
                    runtime.as_ref(),
                    &lab_id,
                    err.step.into(),
                    Some(err.operator_detail()),
                )
                .await;
            }
        }
        drop(guard);
    }

    async fn await_running(&self, runtime: &dyn LabRuntime, lab: &Lab) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout();
        loop {
            if runtime.status(lab).await == RuntimeStatus::Running {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    /// Record `FAILED` and release whatever the runtime left behind.
    async fn fail_and_destroy(
        &self,
        runtime: &dyn LabRuntime,
        lab_id: &Uuid,
        reason: FailureReason,
        detail: Option<String>,
    ) {
        let lab = match self.store.transition_from(
            lab_id,
            &[LabStatus::Requested, LabStatus::Provisioning],
            LabStatus::Failed,
            LabUpdate::failed(reason, detail),
        ) {
            Ok(lab) => {
                info!(lab_id = %lab_id, %reason, "lab failed");
                lab
            }
            Err(LabError::InvalidTransition {
                from: LabStatus::Ending,
                ..
            }) => {
                // The owner ended it; the teardown driver waiting on this
                // lock releases everything and finishes the lab.
                info!(lab_id = %lab_id, %reason, "provisioning failed after end was requested");
                return;
            }
            Err(e) => {
                warn!(lab_id = %lab_id, error = %e, "could not record failure");
                match self.store.get(lab_id) {
                    Ok(Some(lab)) => lab,
                    _ => return,
                }
            }
        };
        let report = runtime.destroy_lab(&lab).await;
        log_report(lab_id, &report);
    }

    /// Tear down an `ENDING` lab and mark it `FINISHED`. Caller holds the
    /// lab lock.
    async fn run_teardown(&self, lab_id: &Uuid) -> LabResult<()> {
        let Some(lab) = self.store.get(lab_id)? else {
            return Err(LabError::NotFound);
        };
        if lab.status != LabStatus::Ending {
            return Ok(());
        }

        let runtime = match self.runtimes.get(lab.runtime_kind) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.store.transition(
                    lab_id,
                    LabStatus::Failed,
                    LabUpdate::failed(FailureReason::Teardown, Some(e.to_string())),
                )?;
                return Err(e);
            }
        };

        let report = runtime.destroy_lab(&lab).await;
        log_report(lab_id, &report);
        self.store
            .transition(lab_id, LabStatus::Finished, LabUpdate::default())?;
        info!(lab_id = %lab_id, clean = report.is_clean(), "lab finished");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker and operator entry points
    // -----------------------------------------------------------------------

    /// Resume teardown of an `ENDING` lab unless a driver already owns it.
    /// Returns whether teardown ran.
    pub async fn resume_teardown(&self, lab_id: &Uuid) -> LabResult<bool> {
        let Some(guard) = self.try_claim(lab_id)? else {
            return Ok(false);
        };
        let result = self.run_teardown(lab_id).await;
        drop(guard);
        self.forget_lock(lab_id);
        result.map(|_| true)
    }

    /// Fail an unowned lab for `reason` and release its resources. Returns
    /// false when a driver owns the lab or it moved on meanwhile.
    pub async fn fail_unowned(
        &self,
        lab_id: &Uuid,
        expected: &[LabStatus],
        reason: FailureReason,
        detail: Option<String>,
    ) -> LabResult<bool> {
        let Some(guard) = self.try_claim(lab_id)? else {
            return Ok(false);
        };
        let result = self.fail_claimed(lab_id, expected, reason, detail).await;
        drop(guard);
        self.forget_lock(lab_id);
        result
    }

    async fn fail_claimed(
        &self,
        lab_id: &Uuid,
        expected: &[LabStatus],
        reason: FailureReason,
        detail: Option<String>,
    ) -> LabResult<bool> {
        let lab = self.store.get(lab_id)?.ok_or(LabError::NotFound)?;
        if !expected.contains(&lab.status) {
            return Ok(false);
        }
        let failed = match self.store.transition_from(
            lab_id,
            expected,
            LabStatus::Failed,
            LabUpdate::failed(reason, detail),
        ) {
            Ok(lab) => lab,
            // Ended by its owner since we looked.
            Err(LabError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        warn!(lab_id = %lab_id, from = %lab.status, %reason, "lab failed by reconciliation");
        if let Ok(runtime) = self.runtimes.get(failed.runtime_kind) {
            let report = runtime.destroy_lab(&failed).await;
            log_report(lab_id, &report);
        }
        Ok(true)
    }

    /// Operator action: run teardown for a lab whatever its status. Live
    /// labs end as `FAILED` with `force_stopped`.
    pub async fn force_stop(&self, lab_id: &Uuid) -> LabResult<TeardownReport> {
        let guard = self.lab_lock(lab_id)?.lock_owned().await;
        let result = self.force_stop_locked(lab_id).await;
        drop(guard);
        self.forget_lock(lab_id);
        result
    }

    async fn force_stop_locked(&self, lab_id: &Uuid) -> LabResult<TeardownReport> {
        let lab = self.store.get(lab_id)?.ok_or(LabError::NotFound)?;
        let lab = if lab.status.is_terminal() {
            lab
        } else {
            self.store.transition(
                lab_id,
                LabStatus::Failed,
                LabUpdate::failed(FailureReason::ForceStopped, None),
            )?
        };
        let runtime = self.runtimes.get(lab.runtime_kind)?;
        let report = runtime.destroy_lab(&lab).await;
        log_report(lab_id, &report);
        warn!(lab_id = %lab_id, clean = report.is_clean(), "lab force-stopped");
        Ok(report)
    }
}

fn log_report(lab_id: &Uuid, report: &TeardownReport) {
    for step in report.failures() {
        warn!(
            lab_id = %lab_id,
            step = %step.step,
            detail = step.detail.as_deref().unwrap_or(""),
            "teardown step failed"
        );
    }
}
