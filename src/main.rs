//! labwarden: lab provisioner and privileged network daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use labwarden::api::{self, AppState};
use labwarden::config::{Config, DEFAULT_CONFIG_PATH, NetBackendKind};
use labwarden::lab::{LabManager, LabStore};
use labwarden::logging;
use labwarden::netd::{self, AllocationTable, IpBackend, MemoryNetBackend, NetBackend, NetdClient, NetdServer};
use labwarden::recipe::DirCatalog;
use labwarden::reconcile::Reconciler;
use labwarden::runtime::{ComposeRuntime, NoopRuntime, RuntimeKind, RuntimeRegistry};
use labwarden::vm::{FirecrackerHypervisor, MicroVmRuntime};

#[derive(Parser, Debug)]
#[command(name = "labwarden", version, about = "Isolated lab provisioner")]
struct Args {
    /// Configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the privileged network daemon
    Netd,
    /// Run the lifecycle manager, reconciliation worker and HTTP API
    Serve,
    /// Check that netd is reachable and compatible
    NetdPing,
    /// Report drift between lab rows and host instances
    Drift,
    /// Run one reconciliation pass and print what it did. Only while no
    /// `serve` process is running against the same database
    Reconcile,
    /// Tear down a lab regardless of its status. Per-lab locks live inside
    /// `serve`, so prefer `POST /operator/labs/{id}/force-stop` while it runs
    ForceStop { lab_id: Uuid },
    /// Print the effective configuration
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let _log_guard = logging::init(&config.logging.dir);

    match args.command {
        Command::Netd => run_netd(&config).await,
        Command::Serve => run_serve(&config).await,
        Command::NetdPing => {
            let client = netd_client(&config);
            let hello = client
                .ensure_compatible(&labwarden::vm::provisioning::REQUIRED_NETD_OPS)
                .await
                .with_context(|| format!("netd at {}", client.socket_path().display()))?;
            client.ping().await.context("netd ping")?;
            println!("{}", serde_json::to_string_pretty(&hello)?);
            Ok(())
        }
        Command::Drift => {
            let report = reconciler(&config)?.detect_drift().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Reconcile => {
            let report = reconciler(&config)?.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::ForceStop { lab_id } => {
            let report = manager(&config)?.force_stop(&lab_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::PrintConfig => {
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

/// Flip the returned channel on SIGINT or SIGTERM.
fn shutdown_channel() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    Ok(rx)
}

async fn run_netd(config: &Config) -> Result<()> {
    let cfg = &config.netd;
    let backend: Arc<dyn NetBackend> = match cfg.backend {
        NetBackendKind::Ip => Arc::new(IpBackend::new(
            cfg.ip_bin.clone(),
            cfg.iptables_bin.clone(),
            cfg.tap_user.clone(),
        )),
        NetBackendKind::Memory => {
            warn!("netd using in-memory backend; no host devices will be created");
            Arc::new(MemoryNetBackend::new())
        }
    };
    let pool = netd::SubnetPool::new(cfg.pool_base, cfg.pool_prefix)?;
    let table = AllocationTable::load(&cfg.state_dir)?;
    info!(pool = %pool.cidr(), allocations = table.len(), "netd state loaded");

    let group = Some(cfg.socket_group.as_str()).filter(|g| !g.is_empty());
    let listener = netd::server::bind_socket(&cfg.socket_path, group)
        .with_context(|| format!("bind {}", cfg.socket_path.display()))?;
    info!(socket = %cfg.socket_path.display(), "netd listening");

    let server = Arc::new(NetdServer::new(backend, pool, table).with_idle_timeout(cfg.idle_timeout()));
    server.serve(listener, shutdown_channel()?).await?;
    let _ = std::fs::remove_file(&cfg.socket_path);
    Ok(())
}

fn netd_client(config: &Config) -> NetdClient {
    NetdClient::new(config.netd.socket_path.clone(), config.netd.request_timeout())
}

fn registry(config: &Config) -> RuntimeRegistry {
    let mut registry = RuntimeRegistry::new()
        .with(Arc::new(MicroVmRuntime::new(
            config.microvm.clone(),
            netd_client(config),
            Arc::new(FirecrackerHypervisor::new(config.microvm.hypervisor_bin.clone())),
        )))
        .with(Arc::new(ComposeRuntime::new(config.compose.clone())));
    // Fake labs are only offered when a host opts in explicitly.
    if config.manager.default_runtime == RuntimeKind::Noop {
        warn!("noop runtime enabled; labs will not run anything");
        registry.register(Arc::new(NoopRuntime::new()));
    }
    registry
}

fn manager(config: &Config) -> Result<Arc<LabManager>> {
    let store = LabStore::open(&config.store.database)
        .with_context(|| format!("open {}", config.store.database.display()))?;
    Ok(LabManager::new(
        Arc::new(store),
        registry(config),
        Arc::new(DirCatalog::new(config.recipes.catalog_dir.clone())),
        config.manager.clone(),
    ))
}

fn reconciler(config: &Config) -> Result<Reconciler> {
    Ok(Reconciler::new(manager(config)?, config.worker.clone()))
}

async fn run_serve(config: &Config) -> Result<()> {
    let manager = manager(config)?;
    let reconciler = Arc::new(Reconciler::new(manager.clone(), config.worker.clone()));
    let shutdown = shutdown_channel()?;

    let worker = tokio::spawn(reconciler.clone().run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.api.bind)
        .await
        .with_context(|| format!("bind {}", config.api.bind))?;
    api::serve(listener, AppState { manager, reconciler }, shutdown).await?;

    worker.await.context("reconciler task")?;
    Ok(())
}
