//! Service configuration.
//!
//! Every setting lives in a single `Config` struct that is deserialized from
//! TOML. Each section carries `#[serde(default)]`, so a partial file (or no
//! file at all) falls back to the built-in defaults below.
//!
//! ```toml
//! [netd]
//! socket_path = "/run/labwarden/netd.sock"
//! socket_group = "labwarden"
//!
//! [microvm]
//! vcpus = 2
//! memory_mib = 2048
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeKind;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/labwarden/labwarden.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub netd: NetdConfig,
    pub store: StoreConfig,
    pub manager: ManagerConfig,
    pub worker: WorkerConfig,
    pub microvm: MicroVmConfig,
    pub compose: ComposeConfig,
    pub recipes: RecipeConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Which device backend netd drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetBackendKind {
    /// `ip` + `iptables` on the host.
    Ip,
    /// In-process bookkeeping only; for development hosts without privileges.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetdConfig {
    pub socket_path: PathBuf,
    /// Group that may connect to the socket (mode 0660).
    pub socket_group: String,
    pub state_dir: PathBuf,
    /// First address of the lab subnet pool.
    pub pool_base: Ipv4Addr,
    /// Prefix length of the whole pool; each lab receives a /30 from it.
    pub pool_prefix: u8,
    pub backend: NetBackendKind,
    pub ip_bin: PathBuf,
    pub iptables_bin: PathBuf,
    /// Owner of created TAP devices, so an unprivileged hypervisor can open them.
    pub tap_user: Option<String>,
    /// Upper bound for one client request/response exchange.
    pub request_timeout_ms: u64,
    /// netd closes a connection that sends nothing for this long.
    pub idle_timeout_secs: u64,
}

impl Default for NetdConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/labwarden/netd.sock"),
            socket_group: "labwarden".to_string(),
            state_dir: PathBuf::from("/var/lib/labwarden/netd"),
            pool_base: Ipv4Addr::new(10, 213, 0, 0),
            pool_prefix: 16,
            backend: NetBackendKind::Ip,
            ip_bin: PathBuf::from("ip"),
            iptables_bin: PathBuf::from("iptables"),
            tap_user: None,
            request_timeout_ms: 10_000,
            idle_timeout_secs: 60,
        }
    }
}

impl NetdConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/var/lib/labwarden/labs.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// System-wide cap on non-terminal labs.
    pub max_concurrent_labs: usize,
    pub default_runtime: RuntimeKind,
    /// Bound on the PROVISIONING -> READY status poll.
    pub readiness_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_labs: 16,
            default_runtime: RuntimeKind::MicroVm,
            readiness_timeout_secs: 30,
        }
    }
}

impl ManagerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_secs: u64,
    /// REQUESTED labs older than this with no live driver are failed.
    pub stale_request_secs: u64,
    /// Terminate orphaned instances instead of only reporting them.
    pub kill_orphans: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stale_request_secs: 600,
            kill_orphans: false,
        }
    }
}

impl WorkerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MicroVmConfig {
    pub hypervisor_bin: PathBuf,
    pub kernel_path: PathBuf,
    /// Read-only golden root filesystem copied per lab.
    pub golden_rootfs: PathBuf,
    /// Parent of every per-lab state directory.
    pub state_root: PathBuf,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub boot_args: String,
    pub socket_poll_attempts: u32,
    pub socket_poll_interval_ms: u64,
    pub guest_cid: u32,
    pub agent_port: u32,
    pub agent_connect_timeout_ms: u64,
    /// Bound on handshake and bundle upload.
    pub agent_request_timeout_secs: u64,
    /// Bound on `start_workload`, which includes the in-VM engine bring-up.
    pub workload_start_timeout_secs: u64,
    pub stop_workload_timeout_secs: u64,
    /// Wait after SIGTERM before SIGKILL.
    pub term_grace_secs: u64,
}

impl Default for MicroVmConfig {
    fn default() -> Self {
        Self {
            hypervisor_bin: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/labwarden/images/vmlinux"),
            golden_rootfs: PathBuf::from("/var/lib/labwarden/images/rootfs.ext4"),
            state_root: PathBuf::from("/var/lib/labwarden/vms"),
            vcpus: 2,
            memory_mib: 2048,
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".to_string(),
            socket_poll_attempts: 50,
            socket_poll_interval_ms: 100,
            guest_cid: 3,
            agent_port: 10789,
            agent_connect_timeout_ms: 30_000,
            agent_request_timeout_secs: 60,
            workload_start_timeout_secs: 300,
            stop_workload_timeout_secs: 20,
            term_grace_secs: 10,
        }
    }
}

impl MicroVmConfig {
    pub fn socket_poll_interval(&self) -> Duration {
        Duration::from_millis(self.socket_poll_interval_ms)
    }

    pub fn agent_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_connect_timeout_ms)
    }

    pub fn agent_request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_request_timeout_secs)
    }

    pub fn workload_start_timeout(&self) -> Duration {
        Duration::from_secs(self.workload_start_timeout_secs)
    }

    pub fn stop_workload_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_workload_timeout_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComposeConfig {
    pub docker_bin: PathBuf,
    /// Parent of every per-lab compose project directory.
    pub work_root: PathBuf,
    /// Host address gateways use to reach published lab ports.
    pub endpoint_host: String,
    pub command_timeout_secs: u64,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from("docker"),
            work_root: PathBuf::from("/var/lib/labwarden/compose"),
            endpoint_host: "127.0.0.1".to_string(),
            command_timeout_secs: 300,
        }
    }
}

impl ComposeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub catalog_dir: PathBuf,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from("/etc/labwarden/recipes"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8740)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for `labwarden.log` when `LABWARDEN_LOG=1`.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/labwarden"),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Load `path`, or the defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }
}
