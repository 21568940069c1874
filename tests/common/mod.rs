//! Shared harness for the integration tests.
//!
//! `TestHost` stands up everything a microVM lab needs on a development
//! machine without privileges:
//! - a real netd server on a temp socket, backed by `MemoryNetBackend`
//! - a `FakeHypervisor` that starts a long-lived `sh` process whose command
//!   line carries `--api-sock <path>` (so pid checks and /proc scans find
//!   it), binds the API socket, and serves a scripted guest agent on the
//!   vsock socket
//! - a state root and golden rootfs under one temp directory
//!
//! `Drop` kills every fake hypervisor so a failing test leaves nothing
//! running.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use uuid::Uuid;

use labwarden::config::{ManagerConfig, MicroVmConfig, WorkerConfig};
use labwarden::lab::{Lab, LabManager, LabStatus, LabStore};
use labwarden::netd::server::bind_socket;
use labwarden::netd::{AllocationTable, MemoryNetBackend, NetdClient, NetdServer, SubnetPool};
use labwarden::recipe::{BundleFile, EndpointSpec, Recipe, StaticCatalog};
use labwarden::reconcile::Reconciler;
use labwarden::runtime::{RuntimeKind, RuntimeRegistry};
use labwarden::vm::{Hypervisor, LabPaths, MicroVmRuntime};
use labwarden::wire;

// ---------------------------------------------------------------------------
// Fake hypervisor and guest agent
// ---------------------------------------------------------------------------

/// Where the fake guest should break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFault {
    /// The hypervisor exits before its API socket appears.
    Boot,
    /// The agent refuses the handshake.
    Handshake,
    /// `start_workload` fails with captured engine output.
    Workload,
}

#[derive(Default)]
struct FakeState {
    fault: Option<GuestFault>,
    /// pid -> lab id
    pids: HashMap<u32, Uuid>,
    /// Keeps API sockets bound while the "hypervisor" runs.
    api_listeners: Vec<std::os::unix::net::UnixListener>,
    /// Agent requests seen, by lab, in order.
    requests: HashMap<Uuid, Vec<String>>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    pub fn set_fault(&self, fault: Option<GuestFault>) {
        self.state.lock().unwrap().fault = fault;
    }

    pub fn pid_of(&self, lab_id: &Uuid) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .pids
            .iter()
            .find(|(_, id)| *id == lab_id)
            .map(|(pid, _)| *pid)
    }

    pub fn agent_requests(&self, lab_id: &Uuid) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(lab_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn kill_all(&self) {
        for pid in self.state.lock().unwrap().pids.keys() {
            kill_group(*pid);
        }
    }
}

pub fn kill_group(pid: u32) {
    // SAFETY: test-only kill of a process group this harness started.
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

/// Start a process that looks like a hypervisor for `api_socket`.
pub fn spawn_fake_process(api_socket: &Path, script: &str) -> io::Result<u32> {
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .arg("labwarden-fake-hypervisor")
        .arg("--api-sock")
        .arg(api_socket)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()?;
    let pid = child.id();
    // Reap on exit so a killed fake does not linger as a zombie.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(pid)
}

impl Hypervisor for FakeHypervisor {
    fn launch(&self, paths: &LabPaths) -> io::Result<u32> {
        let lab_id = paths
            .state_dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Uuid::parse_str(n).ok())
            .ok_or_else(|| io::Error::other("state dir is not a lab id"))?;
        let fault = self.state.lock().unwrap().fault;

        if fault == Some(GuestFault::Boot) {
            std::fs::write(&paths.log_file, "fake: kernel panic - not syncing\n")?;
            let pid = spawn_fake_process(&paths.api_socket, "exit 1")?;
            self.state.lock().unwrap().pids.insert(pid, lab_id);
            return Ok(pid);
        }

        let pid = spawn_fake_process(&paths.api_socket, "while :; do sleep 1; done")?;
        let api = std::os::unix::net::UnixListener::bind(&paths.api_socket)?;
        let vsock = UnixListener::bind(&paths.vsock_socket)?;
        {
            let mut state = self.state.lock().unwrap();
            state.pids.insert(pid, lab_id);
            state.api_listeners.push(api);
        }
        tokio::spawn(serve_agent(vsock, lab_id, fault, Arc::clone(&self.state)));
        Ok(pid)
    }
}

async fn serve_agent(
    listener: UnixListener,
    lab_id: Uuid,
    fault: Option<GuestFault>,
    state: Arc<Mutex<FakeState>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = agent_session(stream, lab_id, fault, state).await;
        });
    }
}

async fn agent_session(
    stream: UnixStream,
    lab_id: Uuid,
    fault: Option<GuestFault>,
    state: Arc<Mutex<FakeState>>,
) -> io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(connect) = wire::read_line(&mut reader, 256).await.map_err(io::Error::other)? else {
        return Ok(());
    };
    if !connect.starts_with(b"CONNECT ") {
        return Ok(());
    }
    writer.write_all(b"OK 1073741824\n").await?;

    while let Some(request) = wire::read_frame::<_, serde_json::Value>(&mut reader, 1 << 20)
        .await
        .map_err(io::Error::other)?
    {
        let kind = request["type"].as_str().unwrap_or("").to_string();
        state
            .lock()
            .unwrap()
            .requests
            .entry(lab_id)
            .or_default()
            .push(kind.clone());

        let reply = match (kind.as_str(), fault) {
            ("handshake", Some(GuestFault::Handshake)) => serde_json::json!({
                "status": "error",
                "message": "agent refused handshake",
            }),
            ("handshake", _) => serde_json::json!({
                "status": "ok",
                "result": { "protocol_version": 1 },
            }),
            ("start_workload", Some(GuestFault::Workload)) => serde_json::json!({
                "status": "error",
                "message": "compose up exited 1",
                "output": "pull access denied for internal/workstation",
            }),
            _ => serde_json::json!({ "status": "ok" }),
        };
        wire::write_frame(&mut writer, &reply)
            .await
            .map_err(io::Error::other)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Test host
// ---------------------------------------------------------------------------

pub struct TestHost {
    pub dir: TempDir,
    pub net: Arc<MemoryNetBackend>,
    pub netd: NetdClient,
    pub netd_socket: PathBuf,
    pub hypervisor: Arc<FakeHypervisor>,
    pub microvm: MicroVmConfig,
    netd_shutdown: watch::Sender<bool>,
}

/// Idle connections are closed after this; tests keep exchanges quicker.
pub const NETD_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

impl TestHost {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let netd_socket = dir.path().join("run/netd.sock");
        let net = Arc::new(MemoryNetBackend::new());
        let server = Arc::new(NetdServer::new(
            net.clone(),
            SubnetPool::new(Ipv4Addr::new(10, 213, 0, 0), 24).unwrap(),
            AllocationTable::in_memory(),
        )
        .with_idle_timeout(NETD_IDLE_TIMEOUT));
        let listener = bind_socket(&netd_socket, None).unwrap();
        let (netd_shutdown, rx) = watch::channel(false);
        tokio::spawn(server.serve(listener, rx));

        let golden = dir.path().join("images/rootfs.ext4");
        std::fs::create_dir_all(golden.parent().unwrap()).unwrap();
        std::fs::write(&golden, vec![0u8; 4096]).unwrap();

        let microvm = MicroVmConfig {
            golden_rootfs: golden,
            state_root: dir.path().join("vms"),
            socket_poll_attempts: 100,
            socket_poll_interval_ms: 20,
            agent_connect_timeout_ms: 2_000,
            agent_request_timeout_secs: 5,
            workload_start_timeout_secs: 5,
            stop_workload_timeout_secs: 2,
            term_grace_secs: 1,
            ..MicroVmConfig::default()
        };

        Self {
            netd: NetdClient::new(netd_socket.clone(), Duration::from_secs(2)),
            netd_socket,
            net,
            hypervisor: Arc::new(FakeHypervisor::default()),
            microvm,
            dir,
            netd_shutdown,
        }
    }

    pub fn runtime(&self) -> Arc<MicroVmRuntime> {
        self.runtime_with(self.microvm.clone())
    }

    pub fn runtime_with(&self, config: MicroVmConfig) -> Arc<MicroVmRuntime> {
        Arc::new(MicroVmRuntime::new(
            config,
            self.netd.clone(),
            self.hypervisor.clone(),
        ))
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("labs.db")
    }

    /// A manager over the on-disk database with a fresh runtime instance,
    /// as a restarted process would have.
    pub fn manager(&self) -> Arc<LabManager> {
        self.manager_with(self.runtime())
    }

    pub fn manager_with(&self, runtime: Arc<MicroVmRuntime>) -> Arc<LabManager> {
        LabManager::new(
            Arc::new(LabStore::open(&self.db_path()).unwrap()),
            RuntimeRegistry::new().with(runtime),
            Arc::new(StaticCatalog::new().with(recipe())),
            ManagerConfig {
                max_concurrent_labs: 8,
                default_runtime: RuntimeKind::MicroVm,
                readiness_timeout_secs: 5,
            },
        )
    }

    pub fn reconciler(&self, manager: Arc<LabManager>, kill_orphans: bool) -> Reconciler {
        Reconciler::new(
            manager,
            WorkerConfig {
                interval_secs: 1,
                stale_request_secs: 0,
                kill_orphans,
            },
        )
    }

    pub fn paths(&self, lab_id: &Uuid) -> LabPaths {
        LabPaths::new(&self.microvm.state_root, lab_id)
    }

    /// True when netd holds nothing for the lab and its state dir is gone.
    pub async fn is_clean(&self, lab_id: &Uuid) -> bool {
        let diag = self.netd.diag_vm_net(lab_id).await.unwrap();
        diag.is_clear() && !self.paths(lab_id).state_dir.exists()
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.hypervisor.kill_all();
        let _ = self.netd_shutdown.send(true);
    }
}

pub fn recipe() -> Recipe {
    Recipe {
        recipe_ref: "web-basic".into(),
        runtime: None,
        compose_file: "compose.yaml".into(),
        endpoint: EndpointSpec {
            service: "workstation".into(),
            port: 3389,
        },
        files: vec![BundleFile {
            path: "compose.yaml".into(),
            contents: b"services:\n  workstation:\n    image: lab/workstation\n".to_vec(),
        }],
    }
}

/// Poll until the lab reaches `status` and no driver holds it.
pub async fn wait_for_status(manager: &LabManager, lab_id: &Uuid, status: LabStatus) -> Lab {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let lab = manager.store().get(lab_id).unwrap().unwrap();
        if lab.status == status && !manager.is_busy(lab_id) {
            return lab;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "lab {lab_id} stuck in {} waiting for {status}",
            lab.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
