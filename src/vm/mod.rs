//! microVM lab runtime.
//!
//! Every lab gets its own Firecracker process, root filesystem copy, TAP
//! device and vsock control channel, all rooted in one per-lab state
//! directory:
//!
//! ```text
//! <state_root>/<lab_id>/
//!   rootfs.ext4        copy of the golden image
//!   vm-config.json     machine configuration (--config-file)
//!   api.sock           hypervisor API socket, polled during boot
//!   vsock.sock         host side of the guest vsock device
//!   hypervisor.pid
//!   hypervisor.log     hypervisor stdout/stderr, kept for operators
//! ```
//!
//! Everything here is derived from the lab id, so teardown and drift
//! detection work even when no handle was ever persisted.

use std::path::{Path, PathBuf};

use uuid::Uuid;

pub mod agent;
pub mod filesystem;
pub mod inspect;
pub mod lifecycle;
pub mod provisioning;

pub use agent::AgentClient;
pub use lifecycle::{FirecrackerHypervisor, Hypervisor};
pub use provisioning::MicroVmRuntime;

/// Per-lab host paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabPaths {
    pub state_dir: PathBuf,
    pub rootfs: PathBuf,
    pub config_file: PathBuf,
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl LabPaths {
    pub const API_SOCKET: &'static str = "api.sock";

    pub fn new(state_root: &Path, lab_id: &Uuid) -> Self {
        let state_dir = state_root.join(lab_id.to_string());
        Self {
            rootfs: state_dir.join("rootfs.ext4"),
            config_file: state_dir.join("vm-config.json"),
            api_socket: state_dir.join(Self::API_SOCKET),
            vsock_socket: state_dir.join("vsock.sock"),
            pid_file: state_dir.join("hypervisor.pid"),
            log_file: state_dir.join("hypervisor.log"),
            state_dir,
        }
    }
}
