//! In-memory runtime for development hosts and tests.
//!
//! "Instances" are entries in a map. Failures, slow creates and lost
//! instances can be injected so the manager and the worker can be exercised
//! without a hypervisor.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    LabRuntime, LaunchedLab, ObservedInstance, ProvisionError, ProvisionStep, RuntimeKind,
    RuntimeStatus, TeardownReport,
};
use crate::error::LabResult;
use crate::lab::Lab;
use crate::recipe::Recipe;

#[derive(Default)]
struct NoopState {
    instances: BTreeMap<String, Option<Uuid>>,
    fail_at: Option<ProvisionStep>,
    create_delay: Duration,
    preflight_error: Option<String>,
}

#[derive(Default)]
pub struct NoopRuntime {
    state: Mutex<NoopState>,
}

fn locator(lab_id: &Uuid) -> String {
    format!("noop-{lab_id}")
}

impl NoopRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every subsequent create at `step`.
    pub fn set_fail_at(&self, step: Option<ProvisionStep>) {
        self.state().fail_at = step;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = delay;
    }

    pub fn set_preflight_error(&self, message: Option<&str>) {
        self.state().preflight_error = message.map(str::to_string);
    }

    /// Drop an instance without telling anyone, as a crash would.
    pub fn lose(&self, lab_id: &Uuid) {
        self.state().instances.remove(&locator(lab_id));
    }

    /// Start an instance no lab row knows about.
    pub fn spawn_stray(&self, lab_id: Option<Uuid>) -> String {
        let name = match lab_id {
            Some(id) => locator(&id),
            None => format!("noop-stray-{}", Uuid::new_v4()),
        };
        self.state().instances.insert(name.clone(), lab_id);
        name
    }

    pub fn is_running(&self, lab_id: &Uuid) -> bool {
        self.state().instances.contains_key(&locator(lab_id))
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }
}

#[async_trait]
impl LabRuntime for NoopRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Noop
    }

    async fn preflight(&self) -> LabResult<()> {
        match self.state().preflight_error.clone() {
            Some(message) => Err(crate::error::LabError::ResourceUnavailable(message)),
            None => Ok(()),
        }
    }

    async fn create_lab(&self, lab: &Lab, recipe: &Recipe) -> Result<LaunchedLab, ProvisionError> {
        let delay = self.state().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fail_at = self.state().fail_at;
        if let Some(step) = fail_at {
            // Anything from boot on leaves an instance behind for teardown.
            if matches!(
                step,
                ProvisionStep::Boot | ProvisionStep::AgentHandshake | ProvisionStep::WorkloadStart
            ) {
                self.state()
                    .instances
                    .insert(locator(&lab.lab_id), Some(lab.lab_id));
            }
            return Err(ProvisionError::new(step, "injected failure")
                .with_diagnostics(format!("noop runtime refused {}", recipe.recipe_ref)));
        }

        self.state()
            .instances
            .insert(locator(&lab.lab_id), Some(lab.lab_id));
        info!(lab_id = %lab.lab_id, recipe = %recipe.recipe_ref, "noop lab started");
        Ok(LaunchedLab {
            endpoint: format!("noop://{}:{}", lab.lab_id, recipe.endpoint.port),
            network: None,
            vm: None,
        })
    }

    async fn destroy_lab(&self, lab: &Lab) -> TeardownReport {
        let removed = self.state().instances.remove(&locator(&lab.lab_id));
        debug!(lab_id = %lab.lab_id, present = removed.is_some(), "noop lab destroyed");
        let mut report = TeardownReport::default();
        report.record::<String>("remove_instance", Ok(()));
        report
    }

    async fn status(&self, lab: &Lab) -> RuntimeStatus {
        if self.is_running(&lab.lab_id) {
            RuntimeStatus::Running
        } else {
            RuntimeStatus::Gone
        }
    }

    async fn observe(&self) -> LabResult<Vec<ObservedInstance>> {
        Ok(self
            .state()
            .instances
            .iter()
            .map(|(name, lab_id)| ObservedInstance {
                runtime_kind: RuntimeKind::Noop,
                lab_id: *lab_id,
                pid: None,
                locator: name.clone(),
            })
            .collect())
    }

    async fn terminate(&self, instance: &ObservedInstance) -> TeardownReport {
        self.state().instances.remove(&instance.locator);
        let mut report = TeardownReport::default();
        report.record::<String>("remove_instance", Ok(()));
        report
    }
}
