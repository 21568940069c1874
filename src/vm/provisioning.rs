//! The microVM [`LabRuntime`].
//!
//! Provisioning runs strictly in order and stops at the first failing step:
//!
//! 1. `alloc_vm_net` through netd
//! 2. state dir, rootfs copy, machine config
//! 3. hypervisor launch, bounded API socket polling
//! 4. vsock connect and agent handshake
//! 5. bundle upload and `start_workload`
//!
//! A failed create is not rolled back here beyond killing a hypervisor
//! that never booted; the lifecycle manager records the failure and then
//! runs [`LabRuntime::destroy_lab`], which works from the lab id alone.
//!
//! Teardown attempts every step, in order, whatever the earlier ones did:
//! stop workload, stop hypervisor, release network, remove state dir.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::agent::{AgentClient, AgentError};
use super::filesystem::{self, MachineConfig};
use super::inspect;
use super::lifecycle::{self, Hypervisor};
use super::LabPaths;
use crate::config::MicroVmConfig;
use crate::error::{LabError, LabResult};
use crate::lab::{Lab, NetworkHandle, VmHandle};
use crate::netd::{NetdClient, Op};
use crate::recipe::Recipe;
use crate::runtime::{
    LabRuntime, LaunchedLab, ObservedInstance, ProvisionError, ProvisionStep, RuntimeKind,
    RuntimeStatus, TeardownReport,
};

/// Compose project name used inside every VM.
const GUEST_PROJECT: &str = "lab";

/// Bytes of hypervisor log attached to boot failures.
const LOG_TAIL_BYTES: usize = 8 * 1024;

/// Ops the runtime relies on; `hello` must advertise all of them.
pub const REQUIRED_NETD_OPS: [Op; 4] = [Op::Ping, Op::AllocVmNet, Op::ReleaseVmNet, Op::DiagVmNet];

pub struct MicroVmRuntime {
    config: MicroVmConfig,
    netd: NetdClient,
    hypervisor: Arc<dyn Hypervisor>,
}

impl MicroVmRuntime {
    pub fn new(config: MicroVmConfig, netd: NetdClient, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            config,
            netd,
            hypervisor,
        }
    }

    fn paths(&self, lab_id: &Uuid) -> LabPaths {
        LabPaths::new(&self.config.state_root, lab_id)
    }

    async fn allocate_network(&self, lab_id: &Uuid) -> Result<NetworkHandle, ProvisionError> {
        let allocation = self.netd.alloc_vm_net(lab_id).await.map_err(|e| {
            ProvisionError::new(ProvisionStep::NetworkAllocation, format!("alloc_vm_net: {e}"))
        })?;
        Ok(NetworkHandle::from(&allocation))
    }

    async fn materialize(&self, paths: &LabPaths, net: &NetworkHandle) -> Result<(), ProvisionError> {
        let rootfs_err = |what: &str, e: std::io::Error| {
            ProvisionError::new(ProvisionStep::Rootfs, format!("{what}: {e}"))
        };
        filesystem::prepare_state_dir(paths).map_err(|e| rootfs_err("create state dir", e))?;
        filesystem::copy_rootfs(&self.config.golden_rootfs, paths)
            .await
            .map_err(|e| rootfs_err("copy rootfs", e))?;
        let machine = MachineConfig::for_lab(&self.config, paths, net);
        filesystem::write_machine_config(paths, &machine)
            .map_err(|e| rootfs_err("write machine config", e))
    }

    async fn boot(&self, paths: &LabPaths) -> Result<u32, ProvisionError> {
        let pid = self.hypervisor.launch(paths).map_err(|e| {
            ProvisionError::new(ProvisionStep::Boot, format!("launch hypervisor: {e}"))
        })?;
        if let Err(e) = lifecycle::write_pid_file(paths, pid) {
            warn!(pid, error = %e, "could not write pid file");
        }

        let polled = lifecycle::wait_for_api_socket(
            &paths.api_socket,
            pid,
            self.config.socket_poll_attempts,
            self.config.socket_poll_interval(),
        )
        .await;

        if let Err(e) = polled {
            if let Err(kill_err) = lifecycle::terminate(pid, self.config.term_grace()).await {
                warn!(pid, error = %kill_err, "could not stop hypervisor after failed boot");
            }
            return Err(ProvisionError::new(ProvisionStep::Boot, e.to_string())
                .with_diagnostics(filesystem::log_tail(paths, LOG_TAIL_BYTES)));
        }
        Ok(pid)
    }

    async fn open_agent(&self, paths: &LabPaths, lab_id: Uuid) -> Result<AgentClient, ProvisionError> {
        let handshake_err =
            |e: AgentError| ProvisionError::new(ProvisionStep::AgentHandshake, e.to_string());

        let mut agent = AgentClient::connect(
            &paths.vsock_socket,
            self.config.agent_port,
            self.config.agent_connect_timeout(),
        )
        .await
        .map_err(|e| handshake_err(e).with_diagnostics(filesystem::log_tail(paths, LOG_TAIL_BYTES)))?;
        agent
            .handshake(lab_id, self.config.agent_request_timeout())
            .await
            .map_err(handshake_err)?;
        Ok(agent)
    }

    async fn start_workload(&self, agent: &mut AgentClient, recipe: &Recipe) -> Result<(), ProvisionError> {
        let workload_err = |e: AgentError| {
            let output = e.output().unwrap_or_default().to_string();
            ProvisionError::new(ProvisionStep::WorkloadStart, e.to_string()).with_diagnostics(output)
        };
        agent
            .upload_bundle(&recipe.files, self.config.agent_request_timeout())
            .await
            .map_err(workload_err)?;
        agent
            .start_workload(
                &recipe.compose_file,
                GUEST_PROJECT,
                self.config.workload_start_timeout(),
            )
            .await
            .map_err(workload_err)
    }

    /// The hypervisor pid for a lab: persisted handle, pid file, then a scan.
    fn locate_hypervisor(&self, lab_id: &Uuid, handle: Option<&VmHandle>) -> Option<u32> {
        let paths = self.paths(lab_id);
        let candidates = handle
            .map(|h| h.pid)
            .into_iter()
            .chain(lifecycle::read_pid_file(&paths));
        for pid in candidates {
            if lifecycle::is_lab_hypervisor(pid, &paths.api_socket) {
                return Some(pid);
            }
        }
        match inspect::find_lab_hypervisor(&self.config.state_root, lab_id) {
            Ok(found) => found.map(|p| p.pid),
            Err(e) => {
                warn!(lab_id = %lab_id, error = %e, "process scan failed");
                None
            }
        }
    }

    async fn stop_workload(&self, paths: &LabPaths) -> Result<(), String> {
        let budget = self.config.stop_workload_timeout();
        let attempt = async {
            let mut agent = AgentClient::connect(&paths.vsock_socket, self.config.agent_port, budget)
                .await
                .map_err(|e| e.to_string())?;
            agent
                .stop_workload(GUEST_PROJECT, budget)
                .await
                .map_err(|e| e.to_string())
        };
        tokio::time::timeout(budget, attempt)
            .await
            .map_err(|_| format!("stop_workload exceeded {budget:?}"))?
    }

    /// Every teardown step for one lab id. Orphans skip the graceful
    /// workload stop; nothing inside them is worth waiting for.
    async fn teardown(
        &self,
        lab_id: &Uuid,
        handle: Option<&VmHandle>,
        graceful: bool,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        let paths = self.paths(lab_id);
        let pid = self.locate_hypervisor(lab_id, handle);

        // 1. stop workload
        match pid {
            Some(_) if !graceful => report.skipped("stop_workload", "orphaned instance"),
            Some(_) => {
                let stopped = self.stop_workload(&paths).await;
                if let Err(e) = &stopped {
                    warn!(lab_id = %lab_id, error = %e, "stop_workload failed, continuing");
                }
                report.record("stop_workload", stopped);
            }
            None => report.skipped("stop_workload", "no hypervisor running"),
        }

        // 2. stop hypervisor
        match pid {
            Some(pid) => {
                let stopped = lifecycle::terminate(pid, self.config.term_grace())
                    .await
                    .map(|outcome| info!(lab_id = %lab_id, pid, ?outcome, "hypervisor stopped"));
                if let Err(e) = &stopped {
                    warn!(lab_id = %lab_id, pid, error = %e, "hypervisor stop failed, continuing");
                }
                report.record("stop_hypervisor", stopped);
            }
            None => report.skipped("stop_hypervisor", "no hypervisor running"),
        }

        // 3. release network
        let released = self.netd.release_vm_net(lab_id).await.map(|_| ());
        if let Err(e) = &released {
            warn!(lab_id = %lab_id, error = %e, "release_vm_net failed, continuing");
        }
        report.record("release_network", released);

        // 4. remove state dir
        let removed = filesystem::remove_state_dir(&paths);
        if let Err(e) = &removed {
            warn!(lab_id = %lab_id, error = %e, "state dir removal failed");
        }
        report.record("remove_state_dir", removed);

        report
    }
}

#[async_trait]
impl LabRuntime for MicroVmRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::MicroVm
    }

    /// Fail closed unless netd answers and advertises every op we use.
    async fn preflight(&self) -> LabResult<()> {
        self.netd
            .ensure_compatible(&REQUIRED_NETD_OPS)
            .await
            .map_err(|e| LabError::ResourceUnavailable(format!("netd: {e}")))?;
        self.netd
            .ping()
            .await
            .map_err(|e| LabError::ResourceUnavailable(format!("netd ping: {e}")))
    }

    async fn create_lab(&self, lab: &Lab, recipe: &Recipe) -> Result<LaunchedLab, ProvisionError> {
        let lab_id = lab.lab_id;
        let paths = self.paths(&lab_id);

        let net = self.allocate_network(&lab_id).await?;
        info!(lab_id = %lab_id, tap = %net.tap_name, guest_ip = %net.guest_ip, "network allocated");

        self.materialize(&paths, &net).await?;
        let pid = self.boot(&paths).await?;
        info!(lab_id = %lab_id, pid, "hypervisor booted");

        let mut agent = self.open_agent(&paths, lab_id).await?;
        self.start_workload(&mut agent, recipe).await?;
        info!(lab_id = %lab_id, recipe = %recipe.recipe_ref, "workload started");

        Ok(LaunchedLab {
            endpoint: format!("{}:{}", net.guest_ip, recipe.endpoint.port),
            network: Some(net),
            vm: Some(VmHandle {
                pid,
                api_socket: paths.api_socket.clone(),
                vsock_socket: paths.vsock_socket.clone(),
                state_dir: paths.state_dir.clone(),
            }),
        })
    }

    async fn destroy_lab(&self, lab: &Lab) -> TeardownReport {
        let report = self.teardown(&lab.lab_id, lab.vm_handle.as_ref(), true).await;
        if !report.is_clean() {
            error!(lab_id = %lab.lab_id, failures = report.failures().count(), "teardown incomplete");
        }
        report
    }

    async fn status(&self, lab: &Lab) -> RuntimeStatus {
        let paths = self.paths(&lab.lab_id);
        if let Some(handle) = &lab.vm_handle {
            if lifecycle::is_lab_hypervisor(handle.pid, &paths.api_socket) {
                return RuntimeStatus::Running;
            }
        }
        match inspect::find_lab_hypervisor(&self.config.state_root, &lab.lab_id) {
            Ok(Some(_)) => RuntimeStatus::Running,
            Ok(None) => RuntimeStatus::Gone,
            Err(e) => {
                warn!(lab_id = %lab.lab_id, error = %e, "process scan failed");
                RuntimeStatus::Unknown
            }
        }
    }

    async fn observe(&self) -> LabResult<Vec<ObservedInstance>> {
        let processes = inspect::scan_hypervisors(&self.config.state_root)
            .map_err(|e| LabError::Internal(format!("scan /proc: {e}")))?;
        Ok(processes
            .into_iter()
            .map(|p| ObservedInstance {
                runtime_kind: RuntimeKind::MicroVm,
                lab_id: p.lab_id,
                pid: Some(p.pid),
                locator: p
                    .api_socket
                    .parent()
                    .map(|d| d.display().to_string())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn terminate(&self, instance: &ObservedInstance) -> TeardownReport {
        if let Some(lab_id) = instance.lab_id {
            return self.teardown(&lab_id, None, false).await;
        }

        let mut report = TeardownReport::default();
        match instance.pid {
            Some(pid) => {
                let stopped = lifecycle::terminate(pid, self.config.term_grace())
                    .await
                    .map(|_| ());
                report.record("stop_hypervisor", stopped);
            }
            None => report.skipped("stop_hypervisor", "no pid"),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn required_ops_cover_the_lifecycle() {
        assert!(REQUIRED_NETD_OPS.contains(&Op::AllocVmNet));
        assert!(REQUIRED_NETD_OPS.contains(&Op::ReleaseVmNet));
        assert!(!REQUIRED_NETD_OPS.contains(&Op::Hello));
    }

    #[tokio::test]
    async fn preflight_fails_closed_without_netd() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MicroVmRuntime::new(
            MicroVmConfig {
                state_root: dir.path().join("vms"),
                ..MicroVmConfig::default()
            },
            NetdClient::new(dir.path().join("netd.sock"), Duration::from_millis(200)),
            Arc::new(lifecycle::FirecrackerHypervisor::new("/nonexistent/firecracker")),
        );
        let err = runtime.preflight().await.unwrap_err();
        assert_eq!(err.kind(), "resource_unavailable");
    }
}
