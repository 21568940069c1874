//! The lab runtime interface.
//!
//! One [`LabRuntime`] implementation exists per [`RuntimeKind`]; the kind is
//! fixed on the lab row at creation time and selects the implementation
//! from the [`RuntimeRegistry`] for every later call. The manager and the
//! reconciliation worker only ever talk to this trait.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{LabError, LabResult};
use crate::lab::{Lab, NetworkHandle, VmHandle};
use crate::recipe::Recipe;

pub mod compose;
pub mod noop;

pub use compose::ComposeRuntime;
pub use noop::NoopRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[serde(rename = "microvm")]
    MicroVm,
    #[serde(rename = "compose")]
    Compose,
    #[serde(rename = "orchestrated")]
    Orchestrated,
    #[serde(rename = "noop")]
    Noop,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 4] = [
        RuntimeKind::MicroVm,
        RuntimeKind::Compose,
        RuntimeKind::Orchestrated,
        RuntimeKind::Noop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::MicroVm => "microvm",
            RuntimeKind::Compose => "compose",
            RuntimeKind::Orchestrated => "orchestrated",
            RuntimeKind::Noop => "noop",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown runtime kind {s:?}"))
    }
}

// ---------------------------------------------------------------------------
// Provisioning results
// ---------------------------------------------------------------------------

/// Provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    NetworkAllocation,
    Rootfs,
    Boot,
    AgentHandshake,
    WorkloadStart,
}

impl ProvisionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionStep::NetworkAllocation => "network_allocation",
            ProvisionStep::Rootfs => "rootfs",
            ProvisionStep::Boot => "boot",
            ProvisionStep::AgentHandshake => "agent_handshake",
            ProvisionStep::WorkloadStart => "workload_start",
        }
    }

    /// Error taxonomy code for a failure at this step.
    pub fn error_kind(self) -> &'static str {
        match self {
            ProvisionStep::NetworkAllocation | ProvisionStep::Rootfs => "resource_unavailable",
            ProvisionStep::Boot => "boot_failure",
            ProvisionStep::AgentHandshake | ProvisionStep::WorkloadStart => "agent_failure",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{step} failed: {message}")]
pub struct ProvisionError {
    pub step: ProvisionStep,
    pub message: String,
    /// Captured hypervisor or agent output, kept for operators.
    pub diagnostics: Option<String>,
}

impl ProvisionError {
    pub fn new(step: ProvisionStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        let diagnostics = diagnostics.into();
        if !diagnostics.is_empty() {
            self.diagnostics = Some(diagnostics);
        }
        self
    }

    /// Message plus diagnostics, for the operator-only failure detail.
    pub fn operator_detail(&self) -> String {
        match &self.diagnostics {
            Some(diag) => format!("{}\n--- diagnostics ---\n{diag}", self.message),
            None => self.message.clone(),
        }
    }
}

impl From<ProvisionError> for LabError {
    fn from(err: ProvisionError) -> Self {
        match err.step.error_kind() {
            "boot_failure" => LabError::BootFailure(err.message),
            "agent_failure" => LabError::AgentFailure(err.message),
            _ => LabError::ResourceUnavailable(err.message),
        }
    }
}

/// What a successful `create_lab` hands back for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedLab {
    pub endpoint: String,
    pub network: Option<NetworkHandle>,
    pub vm: Option<VmHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    /// The runtime could not tell; never treated as drift.
    Unknown,
    Gone,
}

/// A host-observable instance, whether or not a lab row backs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedInstance {
    pub runtime_kind: RuntimeKind,
    /// Lab the instance belongs to, when it can be recovered.
    pub lab_id: Option<Uuid>,
    pub pid: Option<u32>,
    /// Runtime-specific locator (state dir, compose project).
    pub locator: String,
}

// ---------------------------------------------------------------------------
// Teardown results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownStep {
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of every teardown step. Teardown never stops early, so a report
/// always lists all steps attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    pub fn record<E: fmt::Display>(&mut self, step: &str, outcome: Result<(), E>) {
        let (ok, detail) = match outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.steps.push(TeardownStep {
            step: step.to_string(),
            ok,
            detail,
        });
    }

    /// A step with nothing to do.
    pub fn skipped(&mut self, step: &str, reason: &str) {
        self.steps.push(TeardownStep {
            step: step.to_string(),
            ok: true,
            detail: Some(reason.to_string()),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps.iter().filter(|s| !s.ok)
    }
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// Safe to call concurrently for distinct labs. `destroy_lab` is idempotent
/// and works from the lab id alone, so it can clean up after a create that
/// never returned.
#[async_trait]
pub trait LabRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Check collaborators before any lab row is written. Failures are
    /// `ResourceUnavailable`.
    async fn preflight(&self) -> LabResult<()> {
        Ok(())
    }

    async fn create_lab(&self, lab: &Lab, recipe: &Recipe) -> Result<LaunchedLab, ProvisionError>;

    async fn destroy_lab(&self, lab: &Lab) -> TeardownReport;

    async fn status(&self, lab: &Lab) -> RuntimeStatus;

    /// Instances currently observable on the host.
    async fn observe(&self) -> LabResult<Vec<ObservedInstance>>;

    /// Tear down an instance no lab row accounts for.
    async fn terminate(&self, instance: &ObservedInstance) -> TeardownReport;
}

#[derive(Default, Clone)]
pub struct RuntimeRegistry {
    runtimes: HashMap<RuntimeKind, Arc<dyn LabRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runtime: Arc<dyn LabRuntime>) {
        self.runtimes.insert(runtime.kind(), runtime);
    }

    pub fn with(mut self, runtime: Arc<dyn LabRuntime>) -> Self {
        self.register(runtime);
        self
    }

    pub fn get(&self, kind: RuntimeKind) -> LabResult<Arc<dyn LabRuntime>> {
        self.runtimes
            .get(&kind)
            .cloned()
            .ok_or_else(|| LabError::ResourceUnavailable(format!("no {kind} runtime registered")))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn LabRuntime>> {
        self.runtimes.values()
    }
}
