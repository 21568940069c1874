//! Error taxonomy shared by the lifecycle manager, runtimes and worker.
//!
//! Each variant maps to a stable snake_case code via [`LabError::kind`];
//! the code is what tenants see; the message stays server-side.

use thiserror::Error;
use uuid::Uuid;

use crate::lab::LabStatus;

/// Result alias used throughout the library.
pub type LabResult<T> = Result<T, LabError>;

#[derive(Debug, Error)]
pub enum LabError {
    /// Malformed identifier or recipe reference; rejected before any
    /// privileged resource is touched.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// netd unreachable or incompatible, runtime not registered, pool empty.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// System-wide concurrent lab limit reached.
    #[error("quota exceeded: {active} of {limit} labs active")]
    QuotaExceeded { active: usize, limit: usize },

    /// The owner already has a non-terminal lab.
    #[error("owner already has an active lab ({0})")]
    ActiveLabExists(Uuid),

    #[error("hypervisor did not become ready: {0}")]
    BootFailure(String),

    #[error("in-VM agent failure: {0}")]
    AgentFailure(String),

    #[error("expected process for lab {0} not found")]
    LostProcess(Uuid),

    #[error("unexpected process found: {0}")]
    Leak(String),

    /// Unknown lab, or a lab owned by someone else. Both look identical.
    #[error("lab not found")]
    NotFound,

    #[error("lab {lab_id} cannot move from {from} to {to}")]
    InvalidTransition {
        lab_id: Uuid,
        from: LabStatus,
        to: LabStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl LabError {
    /// Stable code used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LabError::InvalidInput(_) => "invalid_input",
            LabError::ResourceUnavailable(_) | LabError::QuotaExceeded { .. } => {
                "resource_unavailable"
            }
            LabError::ActiveLabExists(_) => "active_lab_exists",
            LabError::BootFailure(_) => "boot_failure",
            LabError::AgentFailure(_) => "agent_failure",
            LabError::LostProcess(_) => "lost_process",
            LabError::Leak(_) => "leak",
            LabError::NotFound => "not_found",
            LabError::InvalidTransition { .. } => "invalid_transition",
            LabError::Store(_) | LabError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_reported_as_resource_unavailable() {
        let err = LabError::QuotaExceeded { active: 4, limit: 4 };
        assert_eq!(err.kind(), "resource_unavailable");
        assert!(err.to_string().contains("4 of 4"));
    }

    #[test]
    fn not_found_message_carries_no_identifiers() {
        assert_eq!(LabError::NotFound.to_string(), "lab not found");
    }
}
