//! Hypervisor process lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! Hypervisor::launch(LabPaths)  →  firecracker --api-sock … --config-file …
//!     └─► pid (also written to hypervisor.pid)
//!             ├─► wait_for_api_socket()  bounded attempts, fixed interval
//!             └─► terminate()            SIGTERM → grace → SIGKILL (group)
//! ```
//!
//! The hypervisor is detached from this process: it is not killed when the
//! manager exits, and it is found again after a restart through the pid
//! file or a /proc scan. Before any signal is sent, the pid's command line
//! must still reference the lab's API socket, so a recycled pid is never hit.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::LabPaths;

/// Launches one hypervisor process per lab.
pub trait Hypervisor: Send + Sync {
    /// Start the hypervisor for `paths` and return its pid. Must not block
    /// on boot; readiness is observed through the API socket.
    fn launch(&self, paths: &LabPaths) -> io::Result<u32>;
}

pub struct FirecrackerHypervisor {
    bin: PathBuf,
}

impl FirecrackerHypervisor {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Hypervisor for FirecrackerHypervisor {
    fn launch(&self, paths: &LabPaths) -> io::Result<u32> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.bin);
        cmd.arg("--api-sock")
            .arg(&paths.api_socket)
            .arg("--config-file")
            .arg(&paths.config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // Own process group, so terminal signals to us never reach it
            // and SIGKILL can take the whole group.
            .process_group(0);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("hypervisor exited before reporting a pid"))?;
        // Dropping the handle detaches the process; tokio reaps it on exit.
        drop(child);

        info!(pid, bin = %self.bin.display(), state_dir = %paths.state_dir.display(), "hypervisor spawned");
        Ok(pid)
    }
}

pub fn write_pid_file(paths: &LabPaths, pid: u32) -> io::Result<()> {
    std::fs::write(&paths.pid_file, pid.to_string())
}

pub fn read_pid_file(paths: &LabPaths) -> Option<u32> {
    std::fs::read_to_string(&paths.pid_file)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// Boot polling
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootError {
    #[error("API socket {path} did not appear after {attempts} attempts")]
    SocketTimeout { path: PathBuf, attempts: u32 },
    #[error("hypervisor (pid {0}) exited during boot")]
    Exited(u32),
}

/// Poll for the API socket. Fails early if the process dies.
pub async fn wait_for_api_socket(
    path: &Path,
    pid: u32,
    attempts: u32,
    interval: Duration,
) -> Result<(), BootError> {
    for attempt in 1..=attempts.max(1) {
        if is_socket(path) {
            debug!(pid, attempt, "API socket is up");
            return Ok(());
        }
        if !pid_alive(pid) {
            return Err(BootError::Exited(pid));
        }
        tokio::time::sleep(interval).await;
    }
    if is_socket(path) {
        return Ok(());
    }
    Err(BootError::SocketTimeout {
        path: path.to_path_buf(),
        attempts,
    })
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Process checks
// ---------------------------------------------------------------------------

/// True when `pid` exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // State is the first field after the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => true,
    }
}

/// Arguments of `pid`, split on NUL.
pub fn cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect(),
    )
}

/// True when `pid` is alive and was started with `--api-sock <api_socket>`.
pub fn is_lab_hypervisor(pid: u32, api_socket: &Path) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    let Some(args) = cmdline(pid) else {
        return false;
    };
    let want = api_socket.to_string_lossy();
    args.windows(2)
        .any(|w| w[0] == "--api-sock" && w[1] == want.as_ref())
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyGone,
    Exited,
    Killed,
}

fn signal(pid: u32, sig: libc::c_int, group: bool) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    let target = if group { -raw } else { raw };
    // SAFETY: plain kill(2); the target was checked by the caller.
    if unsafe { libc::kill(target, sig) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

async fn wait_exit(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL the process group.
pub async fn terminate(pid: u32, grace: Duration) -> io::Result<Termination> {
    if !pid_alive(pid) {
        return Ok(Termination::AlreadyGone);
    }
    signal(pid, libc::SIGTERM, false)?;
    if wait_exit(pid, grace).await {
        info!(pid, "hypervisor exited after SIGTERM");
        return Ok(Termination::Exited);
    }

    warn!(pid, grace_secs = grace.as_secs_f64(), "hypervisor ignored SIGTERM, killing");
    // The group may already be gone while the leader lingers.
    let _ = signal(pid, libc::SIGKILL, true);
    signal(pid, libc::SIGKILL, false)?;
    if wait_exit(pid, Duration::from_secs(5)).await {
        Ok(Termination::Killed)
    } else {
        Err(io::Error::other(format!("pid {pid} survived SIGKILL")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
    }

    #[tokio::test]
    async fn missing_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_api_socket(
            &dir.path().join("api.sock"),
            std::process::id(),
            3,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BootError::SocketTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn regular_file_is_not_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(
            wait_for_api_socket(&path, std::process::id(), 2, Duration::from_millis(5))
                .await
                .is_err()
        );
        std::fs::remove_file(&path).unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        wait_for_api_socket(&path, std::process::id(), 2, Duration::from_millis(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_stops_a_child() {
        let child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        drop(child);
        assert!(pid_alive(pid));
        let outcome = terminate(pid, Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, Termination::Exited);
        assert_eq!(
            terminate(pid, Duration::from_secs(1)).await.unwrap(),
            Termination::AlreadyGone
        );
    }

    #[test]
    fn foreign_pid_is_not_a_lab_hypervisor() {
        assert!(!is_lab_hypervisor(
            std::process::id(),
            Path::new("/var/lib/labwarden/vms/x/api.sock")
        ));
    }
}
