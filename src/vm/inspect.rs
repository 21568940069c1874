//! Host introspection for drift detection.
//!
//! Hypervisors are recognized by their `--api-sock` argument: any process
//! whose API socket lives under the configured state root is one of ours,
//! whether or not a lab row still accounts for it.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::LabPaths;
use super::lifecycle::{cmdline, pid_alive};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorProcess {
    pub pid: u32,
    pub api_socket: PathBuf,
    /// Parsed from the state directory name.
    pub lab_id: Option<Uuid>,
}

/// Every live process with an API socket below `state_root`.
pub fn scan_hypervisors(state_root: &Path) -> std::io::Result<Vec<HypervisorProcess>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // Processes can vanish between readdir and the reads below.
        let Some(args) = cmdline(pid) else { continue };
        if let Some(process) = match_hypervisor(pid, &args, state_root) {
            if pid_alive(pid) {
                found.push(process);
            }
        }
    }
    found.sort_by_key(|p| p.pid);
    Ok(found)
}

fn match_hypervisor(pid: u32, args: &[String], state_root: &Path) -> Option<HypervisorProcess> {
    let api_socket = args
        .windows(2)
        .find(|w| w[0] == "--api-sock")
        .map(|w| PathBuf::from(&w[1]))?;
    let state_dir = api_socket.parent()?;
    if state_dir.parent()? != state_root
        || api_socket.file_name()? != std::ffi::OsStr::new(LabPaths::API_SOCKET)
    {
        return None;
    }
    let lab_id = state_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| Uuid::parse_str(n).ok());
    Some(HypervisorProcess {
        pid,
        api_socket,
        lab_id,
    })
}

/// The live hypervisor for one lab, if any.
pub fn find_lab_hypervisor(
    state_root: &Path,
    lab_id: &Uuid,
) -> std::io::Result<Option<HypervisorProcess>> {
    Ok(scan_hypervisors(state_root)?
        .into_iter()
        .find(|p| p.lab_id.as_ref() == Some(lab_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_only_sockets_under_the_root() {
        let root = Path::new("/var/lib/labwarden/vms");
        let id = Uuid::new_v4();
        let sock = format!("/var/lib/labwarden/vms/{id}/api.sock");

        let hit = match_hypervisor(7, &args(&["firecracker", "--api-sock", &sock]), root).unwrap();
        assert_eq!(hit.lab_id, Some(id));

        assert!(match_hypervisor(7, &args(&["firecracker", "--api-sock", "/tmp/x/api.sock"]), root).is_none());
        assert!(match_hypervisor(7, &args(&["firecracker", "--config-file", &sock]), root).is_none());
        let other = format!("/var/lib/labwarden/vms/{id}/other.sock");
        assert!(match_hypervisor(7, &args(&["firecracker", "--api-sock", &other]), root).is_none());
    }

    #[test]
    fn stray_directory_names_have_no_lab() {
        let root = Path::new("/srv/vms");
        let hit = match_hypervisor(
            9,
            &args(&["firecracker", "--api-sock", "/srv/vms/scratch/api.sock"]),
            root,
        )
        .unwrap();
        assert_eq!(hit.lab_id, None);
    }

    #[test]
    fn scanning_an_empty_root_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_hypervisors(dir.path()).unwrap().is_empty());
    }
}
