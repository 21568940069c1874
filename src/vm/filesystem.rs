//! Per-lab state directory, root filesystem copy and machine configuration.
//!
//! The golden image is never written to: each lab boots from its own copy,
//! which disappears with the state directory at teardown.

use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::LabPaths;
use crate::config::MicroVmConfig;
use crate::lab::NetworkHandle;

// ---------------------------------------------------------------------------
// Firecracker --config-file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine: MachineSpec,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub vsock: VsockDevice,
}

impl MachineConfig {
    /// Build the configuration for one lab. The guest learns its address
    /// from the kernel `ip=` argument, so no DHCP runs on the lab bridge.
    pub fn for_lab(config: &MicroVmConfig, paths: &LabPaths, net: &NetworkHandle) -> Self {
        let prefix = net
            .subnet
            .rsplit_once('/')
            .and_then(|(_, p)| p.parse::<u8>().ok())
            .filter(|p| (1..=32).contains(p))
            .unwrap_or(30);
        let netmask = std::net::Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix)));
        let boot_args = format!(
            "{} ip={}::{}:{}::eth0:off",
            config.boot_args, net.guest_ip, net.gateway_ip, netmask
        );

        Self {
            boot_source: BootSource {
                kernel_image_path: config.kernel_path.clone(),
                boot_args,
            },
            drives: vec![Drive {
                drive_id: "rootfs".into(),
                path_on_host: paths.rootfs.clone(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine: MachineSpec {
                vcpu_count: config.vcpus,
                mem_size_mib: config.memory_mib,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".into(),
                host_dev_name: net.tap_name.clone(),
                guest_mac: net.guest_mac.clone(),
            }],
            vsock: VsockDevice {
                guest_cid: config.guest_cid,
                uds_path: paths.vsock_socket.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// State directory
// ---------------------------------------------------------------------------

/// Create the lab's state directory (mode 0750). Leftover sockets from an
/// earlier attempt are removed so boot polling cannot see a stale one.
pub fn prepare_state_dir(paths: &LabPaths) -> io::Result<()> {
    if let Some(root) = paths.state_dir.parent() {
        std::fs::create_dir_all(root)?;
    }
    match std::fs::DirBuilder::new().mode(0o750).create(&paths.state_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    for stale in [&paths.api_socket, &paths.vsock_socket] {
        remove_if_present(stale)?;
    }
    Ok(())
}

/// Copy the golden image into the lab's state directory.
pub async fn copy_rootfs(golden: &Path, paths: &LabPaths) -> io::Result<u64> {
    if !golden.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("golden rootfs {} does not exist", golden.display()),
        ));
    }
    let bytes = tokio::fs::copy(golden, &paths.rootfs).await?;
    tokio::fs::set_permissions(&paths.rootfs, std::fs::Permissions::from_mode(0o600)).await?;
    info!(
        rootfs = %paths.rootfs.display(),
        bytes,
        "rootfs copied"
    );
    Ok(bytes)
}

pub fn write_machine_config(paths: &LabPaths, machine: &MachineConfig) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(machine)?;
    std::fs::write(&paths.config_file, json)?;
    debug!(config = %paths.config_file.display(), "machine config written");
    Ok(())
}

/// Remove the state directory and everything in it. Succeeds when it is
/// already gone.
pub fn remove_state_dir(paths: &LabPaths) -> io::Result<()> {
    match std::fs::remove_dir_all(&paths.state_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Last `max` bytes of the hypervisor log, for failure diagnostics.
pub fn log_tail(paths: &LabPaths, max: usize) -> String {
    let Ok(bytes) = std::fs::read(&paths.log_file) else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn net() -> NetworkHandle {
        NetworkHandle {
            bridge_name: "lwbr0011223344".into(),
            tap_name: "lwtap0011223344".into(),
            subnet: "10.213.0.4/30".into(),
            gateway_ip: Ipv4Addr::new(10, 213, 0, 5),
            guest_ip: Ipv4Addr::new(10, 213, 0, 6),
            guest_mac: "06:00:aa:bb:cc:dd".into(),
        }
    }

    #[test]
    fn machine_config_uses_firecracker_keys() {
        let paths = LabPaths::new(Path::new("/srv/vms"), &Uuid::new_v4());
        let machine = MachineConfig::for_lab(&MicroVmConfig::default(), &paths, &net());
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["machine-config"]["vcpu_count"], 2);
        assert_eq!(json["network-interfaces"][0]["host_dev_name"], "lwtap0011223344");
        assert_eq!(json["drives"][0]["is_root_device"], true);
        let args = json["boot-source"]["boot_args"].as_str().unwrap();
        assert!(args.ends_with("ip=10.213.0.6::10.213.0.5:255.255.255.252::eth0:off"));
        assert_eq!(json["vsock"]["guest_cid"], 3);
    }

    #[tokio::test]
    async fn rootfs_copy_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let golden = dir.path().join("golden.ext4");
        std::fs::write(&golden, vec![7u8; 4096]).unwrap();

        let paths = LabPaths::new(&dir.path().join("vms"), &Uuid::new_v4());
        prepare_state_dir(&paths).unwrap();
        assert_eq!(copy_rootfs(&golden, &paths).await.unwrap(), 4096);
        assert!(paths.rootfs.is_file());

        remove_state_dir(&paths).unwrap();
        assert!(!paths.state_dir.exists());
        remove_state_dir(&paths).unwrap();
    }

    #[tokio::test]
    async fn missing_golden_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LabPaths::new(dir.path(), &Uuid::new_v4());
        prepare_state_dir(&paths).unwrap();
        let err = copy_rootfs(&dir.path().join("nope"), &paths).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
