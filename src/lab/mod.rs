//! Lab records and the lifecycle state machine.
//!
//! ```text
//! REQUESTED ──► PROVISIONING ──► READY ──► ENDING ──► FINISHED
//!     │              │             │         │
//!     └──────────────┴─────────────┴─────────┴──► FAILED
//!     └──────────────┴──► ENDING   (end requested before READY)
//! ```
//!
//! The persisted row is intent. Transitions are checked against
//! [`LabStatus::can_transition_to`] inside the store, so no caller can move
//! a lab out of a terminal state.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::netd::NetAllocation;
use crate::runtime::{ProvisionStep, RuntimeKind};

pub mod manager;
pub mod store;

pub use manager::LabManager;
pub use store::{LabStore, LabUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabStatus {
    Requested,
    Provisioning,
    Ready,
    Ending,
    Finished,
    Failed,
}

impl LabStatus {
    pub const ALL: [LabStatus; 6] = [
        LabStatus::Requested,
        LabStatus::Provisioning,
        LabStatus::Ready,
        LabStatus::Ending,
        LabStatus::Finished,
        LabStatus::Failed,
    ];

    /// Statuses that count against tenancy and quota.
    pub const ACTIVE: [LabStatus; 4] = [
        LabStatus::Requested,
        LabStatus::Provisioning,
        LabStatus::Ready,
        LabStatus::Ending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LabStatus::Requested => "REQUESTED",
            LabStatus::Provisioning => "PROVISIONING",
            LabStatus::Ready => "READY",
            LabStatus::Ending => "ENDING",
            LabStatus::Finished => "FINISHED",
            LabStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LabStatus::Finished | LabStatus::Failed)
    }

    /// Labs the host is expected to be running something for.
    pub fn expects_instance(self) -> bool {
        matches!(self, LabStatus::Provisioning | LabStatus::Ready)
    }

    pub fn can_transition_to(self, to: LabStatus) -> bool {
        use LabStatus::*;
        matches!(
            (self, to),
            (Requested, Provisioning | Ending | Failed)
                | (Provisioning, Ready | Ending | Failed)
                | (Ready, Ending | Failed)
                | (Ending, Finished | Failed)
        )
    }
}

impl fmt::Display for LabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LabStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown lab status {s:?}"))
    }
}

/// Short reason code recorded on `FAILED` labs. This is all a tenant sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NetworkAllocation,
    Rootfs,
    Boot,
    AgentHandshake,
    WorkloadStart,
    ReadinessTimeout,
    LostProcess,
    Interrupted,
    ForceStopped,
    Teardown,
}

impl FailureReason {
    pub const ALL: [FailureReason; 10] = [
        FailureReason::NetworkAllocation,
        FailureReason::Rootfs,
        FailureReason::Boot,
        FailureReason::AgentHandshake,
        FailureReason::WorkloadStart,
        FailureReason::ReadinessTimeout,
        FailureReason::LostProcess,
        FailureReason::Interrupted,
        FailureReason::ForceStopped,
        FailureReason::Teardown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NetworkAllocation => "network_allocation",
            FailureReason::Rootfs => "rootfs",
            FailureReason::Boot => "boot",
            FailureReason::AgentHandshake => "agent_handshake",
            FailureReason::WorkloadStart => "workload_start",
            FailureReason::ReadinessTimeout => "readiness_timeout",
            FailureReason::LostProcess => "lost_process",
            FailureReason::Interrupted => "interrupted",
            FailureReason::ForceStopped => "force_stopped",
            FailureReason::Teardown => "teardown",
        }
    }
}

impl From<ProvisionStep> for FailureReason {
    fn from(step: ProvisionStep) -> Self {
        match step {
            ProvisionStep::NetworkAllocation => FailureReason::NetworkAllocation,
            ProvisionStep::Rootfs => FailureReason::Rootfs,
            ProvisionStep::Boot => FailureReason::Boot,
            ProvisionStep::AgentHandshake => FailureReason::AgentHandshake,
            ProvisionStep::WorkloadStart => FailureReason::WorkloadStart,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown failure reason {s:?}"))
    }
}

/// Reference to the netd allocation backing a lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub bridge_name: String,
    pub tap_name: String,
    pub subnet: String,
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: String,
}

impl From<&NetAllocation> for NetworkHandle {
    fn from(a: &NetAllocation) -> Self {
        Self {
            bridge_name: a.bridge_name.clone(),
            tap_name: a.tap_name.clone(),
            subnet: a.subnet.clone(),
            gateway_ip: a.gateway_ip,
            guest_ip: a.guest_ip,
            guest_mac: a.guest_mac.clone(),
        }
    }
}

/// Host-side handle of a microVM lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub pid: u32,
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lab {
    pub lab_id: Uuid,
    pub owner_id: String,
    pub recipe_ref: String,
    pub status: LabStatus,
    pub runtime_kind: RuntimeKind,
    pub connection_endpoint: Option<String>,
    pub network_handle: Option<NetworkHandle>,
    pub vm_handle: Option<VmHandle>,
    pub failure_reason: Option<FailureReason>,
    /// Captured hypervisor/agent output. Operators only.
    pub failure_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lab {
    pub fn new(owner_id: &str, recipe_ref: &str, runtime_kind: RuntimeKind) -> Self {
        let now = Utc::now();
        Self {
            lab_id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            recipe_ref: recipe_ref.to_string(),
            status: LabStatus::Requested,
            runtime_kind,
            connection_endpoint: None,
            network_handle: None,
            vm_handle: None,
            failure_reason: None,
            failure_detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a tenant is allowed to see about their lab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabView {
    pub lab_id: Uuid,
    pub recipe_ref: String,
    pub status: LabStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Lab> for LabView {
    fn from(lab: &Lab) -> Self {
        Self {
            lab_id: lab.lab_id,
            recipe_ref: lab.recipe_ref.clone(),
            status: lab.status,
            connection_endpoint: lab.connection_endpoint.clone(),
            failure_reason: lab.failure_reason,
            created_at: lab.created_at,
            updated_at: lab.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [LabStatus::Finished, LabStatus::Failed] {
            for to in LabStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        use LabStatus::*;
        let path = [Requested, Provisioning, Ready, Ending, Finished];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(!Requested.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Ending.can_transition_to(Ready));
    }

    #[test]
    fn every_active_state_can_fail() {
        for status in LabStatus::ACTIVE {
            assert!(status.can_transition_to(LabStatus::Failed));
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in LabStatus::ALL {
            assert_eq!(status.as_str().parse::<LabStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&LabStatus::Provisioning).unwrap(),
            "\"PROVISIONING\""
        );
        assert!("ready".parse::<LabStatus>().is_err());
    }

    #[test]
    fn reasons_follow_provision_steps() {
        assert_eq!(
            FailureReason::from(ProvisionStep::AgentHandshake).as_str(),
            "agent_handshake"
        );
        for reason in FailureReason::ALL {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
    }

    #[test]
    fn tenant_view_hides_operator_detail() {
        let mut lab = Lab::new("u1", "web-basic", RuntimeKind::Noop);
        lab.failure_detail = Some("/var/lib/labwarden/vms/... panic".into());
        let json = serde_json::to_value(LabView::from(&lab)).unwrap();
        assert!(json.get("failure_detail").is_none());
        assert!(json.get("owner_id").is_none());
        assert_eq!(json["status"], "REQUESTED");
    }
}
