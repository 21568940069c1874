//! Host-side `docker compose` runtime.
//!
//! Each lab is the compose project `lab-<lab_id>`, materialized under
//! `<work_root>/<lab_id>/`. This runtime offers container isolation only and
//! is meant for trusted recipes and development hosts.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    LabRuntime, LaunchedLab, ObservedInstance, ProvisionError, ProvisionStep, RuntimeKind,
    RuntimeStatus, TeardownReport,
};
use crate::config::ComposeConfig;
use crate::error::{LabError, LabResult};
use crate::lab::Lab;
use crate::recipe::{BundleFile, Recipe};

const PROJECT_PREFIX: &str = "lab-";
const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Output of one docker invocation.
struct DockerOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct ComposeRuntime {
    config: ComposeConfig,
}

pub fn project_name(lab_id: &Uuid) -> String {
    format!("{PROJECT_PREFIX}{lab_id}")
}

fn lab_from_project(project: &str) -> Option<Uuid> {
    let raw = project.strip_prefix(PROJECT_PREFIX)?;
    Uuid::parse_str(raw).ok()
}

impl ComposeRuntime {
    pub fn new(config: ComposeConfig) -> Self {
        Self { config }
    }

    fn work_dir(&self, lab_id: &Uuid) -> PathBuf {
        self.config.work_root.join(lab_id.to_string())
    }

    async fn docker(&self, args: &[&str], cwd: Option<&Path>) -> Result<DockerOutput, String> {
        debug!(?args, "running docker");
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let output = tokio::time::timeout(self.config.command_timeout(), cmd.output())
            .await
            .map_err(|_| format!("docker {} timed out", args.join(" ")))?
            .map_err(|e| format!("spawn {}: {e}", self.config.docker_bin.display()))?;

        Ok(DockerOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn compose_down(&self, project: &str) -> Result<(), String> {
        let out = self
            .docker(
                &["compose", "-p", project, "down", "--volumes", "--remove-orphans"],
                None,
            )
            .await?;
        if out.success {
            Ok(())
        } else {
            Err(format!("compose down {project}: {}", out.stderr))
        }
    }
}

/// Write bundle files below `dir`, refusing paths that escape it.
pub fn write_bundle(dir: &Path, files: &[BundleFile]) -> std::io::Result<()> {
    for file in files {
        let rel = Path::new(&file.path);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bundle path {:?} escapes the bundle root", file.path),
            ));
        }
        let target = dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &file.contents)?;
    }
    Ok(())
}

#[async_trait]
impl LabRuntime for ComposeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Compose
    }

    async fn preflight(&self) -> LabResult<()> {
        match self.docker(&["compose", "version"], None).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(LabError::ResourceUnavailable(format!(
                "docker compose unavailable: {}",
                out.stderr
            ))),
            Err(e) => Err(LabError::ResourceUnavailable(e)),
        }
    }

    async fn create_lab(&self, lab: &Lab, recipe: &Recipe) -> Result<LaunchedLab, ProvisionError> {
        let dir = self.work_dir(&lab.lab_id);
        std::fs::create_dir_all(&dir)
            .and_then(|_| write_bundle(&dir, &recipe.files))
            .map_err(|e| ProvisionError::new(ProvisionStep::Rootfs, format!("write bundle: {e}")))?;

        let project = project_name(&lab.lab_id);
        let up = self
            .docker(
                &[
                    "compose",
                    "-p",
                    &project,
                    "-f",
                    &recipe.compose_file,
                    "up",
                    "--detach",
                    "--wait",
                ],
                Some(&dir),
            )
            .await
            .map_err(|e| ProvisionError::new(ProvisionStep::WorkloadStart, e))?;
        if !up.success {
            return Err(
                ProvisionError::new(ProvisionStep::WorkloadStart, "compose up failed")
                    .with_diagnostics(up.stderr),
            );
        }

        let port = recipe.endpoint.port.to_string();
        let published = self
            .docker(
                &[
                    "compose",
                    "-p",
                    &project,
                    "-f",
                    &recipe.compose_file,
                    "port",
                    &recipe.endpoint.service,
                    &port,
                ],
                Some(&dir),
            )
            .await
            .map_err(|e| ProvisionError::new(ProvisionStep::WorkloadStart, e))?;
        // Output looks like `0.0.0.0:49153`.
        let host_port = published
            .stdout
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|_| published.success)
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionStep::WorkloadStart,
                    format!("service {} publishes no port {port}", recipe.endpoint.service),
                )
                .with_diagnostics(published.stderr.clone())
            })?;

        info!(lab_id = %lab.lab_id, project = %project, host_port, "compose lab started");
        Ok(LaunchedLab {
            endpoint: format!("{}:{host_port}", self.config.endpoint_host),
            network: None,
            vm: None,
        })
    }

    async fn destroy_lab(&self, lab: &Lab) -> TeardownReport {
        let mut report = TeardownReport::default();
        let project = project_name(&lab.lab_id);

        let down = self.compose_down(&project).await;
        if let Err(e) = &down {
            warn!(lab_id = %lab.lab_id, error = %e, "compose down failed");
        }
        report.record("stop_workload", down);

        let dir = self.work_dir(&lab.lab_id);
        let removed = match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
        if let Err(e) = &removed {
            warn!(lab_id = %lab.lab_id, error = %e, "work dir cleanup failed");
        }
        report.record("remove_state_dir", removed);
        report
    }

    async fn status(&self, lab: &Lab) -> RuntimeStatus {
        let project = project_name(&lab.lab_id);
        match self
            .docker(&["compose", "-p", &project, "ps", "--quiet", "--status", "running"], None)
            .await
        {
            Ok(out) if out.success && !out.stdout.is_empty() => RuntimeStatus::Running,
            Ok(out) if out.success => RuntimeStatus::Gone,
            _ => RuntimeStatus::Unknown,
        }
    }

    async fn observe(&self) -> LabResult<Vec<ObservedInstance>> {
        let format = format!("{{{{.Label \"{PROJECT_LABEL}\"}}}}");
        let out = self
            .docker(
                &["ps", "--filter", &format!("label={PROJECT_LABEL}"), "--format", &format],
                None,
            )
            .await
            .map_err(LabError::Internal)?;
        if !out.success {
            return Err(LabError::Internal(format!("docker ps: {}", out.stderr)));
        }

        let mut projects: Vec<&str> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|p| p.starts_with(PROJECT_PREFIX))
            .collect();
        projects.sort_unstable();
        projects.dedup();

        Ok(projects
            .into_iter()
            .map(|project| ObservedInstance {
                runtime_kind: RuntimeKind::Compose,
                lab_id: lab_from_project(project),
                pid: None,
                locator: project.to_string(),
            })
            .collect())
    }

    async fn terminate(&self, instance: &ObservedInstance) -> TeardownReport {
        let mut report = TeardownReport::default();
        report.record("stop_workload", self.compose_down(&instance.locator).await);
        report
    }
}
