//! The netd daemon: socket setup, request dispatch and the allocation table.
//!
//! ## Concurrency
//!
//! Connections are served concurrently. Mutating operations take a per-lab
//! async lock, so device creation and removal for one lab never race, while
//! different labs proceed in parallel. The allocation table itself sits
//! behind a short-lived std mutex that is never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::{LabRules, NetBackend};
use super::{
    DeviceNames, DiagResult, HelloResult, MAX_REQUEST_BYTES, NetAllocation, NetdError,
    NetdErrorKind, Op, PROTOCOL_VERSION, Request, Response, SubnetPool, SubnetSlot,
    validate_lab_id,
};
use crate::wire::{self, FrameError};

const TABLE_FILE: &str = "allocations.json";

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Allocation table
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableFile {
    allocations: Vec<NetAllocation>,
}

/// Every lab's network allocation, persisted as JSON under netd's state dir.
#[derive(Debug, Default)]
pub struct AllocationTable {
    path: Option<PathBuf>,
    entries: BTreeMap<Uuid, NetAllocation>,
}

impl AllocationTable {
    /// Table without persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `<state_dir>/allocations.json`, or start empty.
    pub fn load(state_dir: &Path) -> Result<Self, NetdError> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| NetdError::os(format!("create {}: {e}", state_dir.display())))?;
        let path = state_dir.join(TABLE_FILE);

        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: TableFile = serde_json::from_slice(&bytes)
                    .map_err(|e| NetdError::os(format!("parse {}: {e}", path.display())))?;
                file.allocations.into_iter().map(|a| (a.lab_id, a)).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(NetdError::os(format!("read {}: {e}", path.display()))),
        };

        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn get(&self, lab_id: &Uuid) -> Option<&NetAllocation> {
        self.entries.get(lab_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn used_slots(&self) -> Vec<u32> {
        self.entries.values().map(|a| a.slot).collect()
    }

    fn bridge_owner(&self, bridge: &str) -> Option<Uuid> {
        self.entries
            .values()
            .find(|a| a.bridge_name == bridge)
            .map(|a| a.lab_id)
    }

    /// Memory and disk agree afterwards, whether or not the write worked.
    fn insert(&mut self, allocation: NetAllocation) -> Result<(), NetdError> {
        let lab_id = allocation.lab_id;
        let previous = self.entries.insert(lab_id, allocation);
        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => self.entries.insert(lab_id, previous),
                None => self.entries.remove(&lab_id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, lab_id: &Uuid) -> Result<(), NetdError> {
        let Some(removed) = self.entries.remove(lab_id) else {
            return Ok(());
        };
        if let Err(e) = self.persist() {
            self.entries.insert(*lab_id, removed);
            return Err(e);
        }
        Ok(())
    }

    /// Write to a temp file and rename over the table.
    fn persist(&self) -> Result<(), NetdError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = TableFile {
            allocations: self.entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| NetdError::os(format!("encode allocation table: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| NetdError::os(format!("write {}: {e}", path.display())))
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct NetdServer {
    backend: Arc<dyn NetBackend>,
    pool: SubnetPool,
    table: Mutex<AllocationTable>,
    lab_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    idle_timeout: Duration,
}

impl NetdServer {
    pub fn new(backend: Arc<dyn NetBackend>, pool: SubnetPool, table: AllocationTable) -> Self {
        Self {
            backend,
            pool,
            table: Mutex::new(table),
            lab_locks: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Close connections that send nothing for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Dispatch one request. Never panics on bad input; every failure is an
    /// explicit error response and nothing is retried here.
    pub async fn handle(&self, req: Request) -> Response {
        let Some(op) = Op::from_wire(&req.op) else {
            return NetdError::new(
                NetdErrorKind::UnsupportedOp,
                format!("unsupported op {:?}", req.op),
            )
            .into();
        };

        let outcome = match op {
            Op::Hello => Ok(Response::ok(&HelloResult {
                protocol_version: PROTOCOL_VERSION,
                ops: Op::ALL.iter().map(|op| op.as_str().to_string()).collect(),
            })),
            Op::Ping => Ok(Response::ok(&serde_json::json!({ "pong": true }))),
            Op::AllocVmNet => match validate_lab_id(req.lab_id.as_deref()) {
                Ok(id) => self.alloc(id).await.map(|a| Response::ok(&a)),
                Err(e) => Err(e),
            },
            Op::ReleaseVmNet => match validate_lab_id(req.lab_id.as_deref()) {
                Ok(id) => self
                    .release(id)
                    .await
                    .map(|released| Response::ok(&serde_json::json!({ "released": released }))),
                Err(e) => Err(e),
            },
            Op::DiagVmNet => match validate_lab_id(req.lab_id.as_deref()) {
                Ok(id) => self.diag(id).await.map(|d| Response::ok(&d)),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(resp) => resp,
            Err(err) => {
                warn!(op = %op, kind = %err.kind, error = %err.message, "netd request failed");
                err.into()
            }
        }
    }

    fn lab_lock(&self, lab_id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>, NetdError> {
        let mut locks = self
            .lab_locks
            .lock()
            .map_err(|_| NetdError::os("lock map poisoned"))?;
        Ok(Arc::clone(locks.entry(lab_id).or_default()))
    }

    /// Drop the lab's lock once nobody holds or waits on it.
    fn forget_lock(&self, lab_id: &Uuid) {
        if let Ok(mut locks) = self.lab_locks.lock() {
            if locks.get(lab_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(lab_id);
            }
        }
    }

    /// Run `op` under the lab's lock, then forget the lock if idle.
    async fn with_lab_lock<T, F>(&self, lab_id: Uuid, op: F) -> Result<T, NetdError>
    where
        F: Future<Output = Result<T, NetdError>>,
    {
        let lock = self.lab_lock(lab_id)?;
        let result = {
            let _guard = lock.lock().await;
            op.await
        };
        drop(lock);
        self.forget_lock(&lab_id);
        result
    }

    fn with_table<T>(
        &self,
        f: impl FnOnce(&mut AllocationTable) -> Result<T, NetdError>,
    ) -> Result<T, NetdError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| NetdError::os("allocation table poisoned"))?;
        f(&mut table)
    }

    fn rules_for(&self, allocation: &NetAllocation) -> LabRules {
        LabRules {
            bridge: allocation.bridge_name.clone(),
            subnet: allocation.subnet.clone(),
            pool_cidr: self.pool.cidr(),
            comment: format!("labwarden:{}", allocation.lab_id),
        }
    }

    /// Create (or repair) the lab's bridge, TAP and rules. A repeat call
    /// returns the same allocation.
    pub async fn alloc(&self, lab_id: Uuid) -> Result<NetAllocation, NetdError> {
        self.with_lab_lock(lab_id, self.alloc_locked(lab_id)).await
    }

    async fn alloc_locked(&self, lab_id: Uuid) -> Result<NetAllocation, NetdError> {
        let names = DeviceNames::derive(&lab_id);
        let (allocation, fresh) = self.with_table(|table| {
            if let Some(existing) = table.get(&lab_id) {
                return Ok((existing.clone(), false));
            }
            if let Some(owner) = table.bridge_owner(&names.bridge) {
                return Err(NetdError::os(format!(
                    "derived device name {} already held by {owner}",
                    names.bridge
                )));
            }
            let slot = self
                .pool
                .first_free(table.used_slots())
                .ok_or_else(|| NetdError::new(NetdErrorKind::Exhausted, "subnet pool exhausted"))?;
            let allocation = build_allocation(lab_id, &names, slot);
            table.insert(allocation.clone())?;
            Ok((allocation, true))
        })?;

        if let Err(err) = self.ensure_devices(&allocation).await {
            error!(lab_id = %lab_id, error = %err, "network allocation failed");
            if fresh {
                // Leave nothing behind for an allocation that never completed.
                if let Err(cleanup) = self.teardown_devices(&lab_id, Some(&allocation)).await {
                    warn!(lab_id = %lab_id, error = %cleanup, "rollback incomplete");
                } else {
                    self.with_table(|table| table.remove(&lab_id))?;
                }
            }
            return Err(err);
        }

        info!(
            lab_id = %lab_id,
            bridge = %allocation.bridge_name,
            tap = %allocation.tap_name,
            subnet = %allocation.subnet,
            fresh,
            "network allocated"
        );
        Ok(allocation)
    }

    async fn ensure_devices(&self, allocation: &NetAllocation) -> Result<(), NetdError> {
        let backend = &self.backend;
        if !backend.link_exists(&allocation.bridge_name).await? {
            let gateway_cidr = format!("{}/{}", allocation.gateway_ip, allocation.prefix_len);
            backend
                .add_bridge(&allocation.bridge_name, &gateway_cidr)
                .await?;
        }
        if !backend.link_exists(&allocation.tap_name).await? {
            backend
                .add_tap(&allocation.tap_name, &allocation.bridge_name)
                .await?;
        }
        let rules = self.rules_for(allocation);
        if !backend.rules_present(&rules).await? {
            backend.add_rules(&rules).await?;
        }
        Ok(())
    }

    /// Remove rules and links. Every step runs; the first error is returned.
    async fn teardown_devices(
        &self,
        lab_id: &Uuid,
        allocation: Option<&NetAllocation>,
    ) -> Result<(), NetdError> {
        let names = DeviceNames::derive(lab_id);
        let mut first_err = None;

        if let Some(allocation) = allocation {
            if let Err(e) = self.backend.remove_rules(&self.rules_for(allocation)).await {
                first_err.get_or_insert(e);
            }
        }
        for link in [&names.tap, &names.bridge] {
            if let Err(e) = self.backend.delete_link(link).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down everything for `lab_id`. Succeeds when nothing is allocated.
    /// Returns whether an allocation existed.
    pub async fn release(&self, lab_id: Uuid) -> Result<bool, NetdError> {
        self.with_lab_lock(lab_id, self.release_locked(lab_id)).await
    }

    async fn release_locked(&self, lab_id: Uuid) -> Result<bool, NetdError> {
        let allocation = self.with_table(|table| Ok(table.get(&lab_id).cloned()))?;
        // Devices are derived from the id, so stray links are removed even
        // when the table has no entry.
        self.teardown_devices(&lab_id, allocation.as_ref()).await?;
        self.with_table(|table| table.remove(&lab_id))?;

        if allocation.is_some() {
            info!(lab_id = %lab_id, "network released");
        } else {
            debug!(lab_id = %lab_id, "release for unallocated lab");
        }
        Ok(allocation.is_some())
    }

    pub async fn diag(&self, lab_id: Uuid) -> Result<DiagResult, NetdError> {
        let names = DeviceNames::derive(&lab_id);
        let allocation = self.with_table(|table| Ok(table.get(&lab_id).cloned()))?;

        let bridge_present = self.backend.link_exists(&names.bridge).await?;
        let tap_present = self.backend.link_exists(&names.tap).await?;
        let nat_present = match &allocation {
            Some(a) => self.backend.rules_present(&self.rules_for(a)).await?,
            None => false,
        };

        Ok(DiagResult {
            lab_id,
            allocation,
            bridge_present,
            tap_present,
            nat_present,
        })
    }

    /// Accept connections until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(e) => {
                        error!(error = %e, "netd accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("netd shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        if let Ok(cred) = stream.peer_cred() {
            debug!(uid = cred.uid(), gid = cred.gid(), pid = ?cred.pid(), "netd client connected");
        }

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let read = wire::read_line(&mut reader, MAX_REQUEST_BYTES);
            let Ok(next) = tokio::time::timeout(self.idle_timeout, read).await else {
                debug!(idle_secs = self.idle_timeout.as_secs(), "netd client idle, closing");
                return;
            };
            let response = match next {
                Ok(None) => return,
                Ok(Some(line)) => match serde_json::from_slice::<Request>(&line) {
                    Ok(req) => self.handle(req).await,
                    Err(e) => NetdError::new(NetdErrorKind::Malformed, e.to_string()).into(),
                },
                Err(FrameError::TooLarge(max)) => {
                    let resp: Response = NetdError::new(
                        NetdErrorKind::Malformed,
                        format!("request exceeds {max} bytes"),
                    )
                    .into();
                    let _ = wire::write_frame(&mut write_half, &resp).await;
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "netd connection closed");
                    return;
                }
            };

            if let Err(e) = wire::write_frame(&mut write_half, &response).await {
                debug!(error = %e, "netd client went away");
                return;
            }
        }
    }
}

fn build_allocation(lab_id: Uuid, names: &DeviceNames, slot: SubnetSlot) -> NetAllocation {
    NetAllocation {
        lab_id,
        bridge_name: names.bridge.clone(),
        tap_name: names.tap.clone(),
        guest_mac: names.guest_mac.clone(),
        subnet: slot.cidr(),
        gateway_ip: slot.gateway,
        guest_ip: slot.guest,
        prefix_len: SubnetSlot::PREFIX_LEN,
        slot: slot.index,
        allocated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Socket setup
// ---------------------------------------------------------------------------

/// Bind the daemon socket with mode 0660, group-owned by `group`.
///
/// A leftover socket file is removed unless a live daemon still answers on
/// it, in which case binding fails with `AddrInUse`.
pub fn bind_socket(path: &Path, group: Option<&str>) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another netd is serving {}", path.display()),
                ));
            }
            Err(_) => {
                warn!(path = %path.display(), "removing stale netd socket");
                std::fs::remove_file(path)?;
            }
        }
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    if let Some(group) = group {
        let gid = lookup_gid(group)?;
        std::os::unix::fs::chown(path, None, Some(gid))?;
    }

    info!(path = %path.display(), group = ?group, "netd socket bound");
    Ok(listener)
}

fn lookup_gid(group: &str) -> io::Result<u32> {
    let name = CString::new(group)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "group name contains NUL"))?;
    // SAFETY: `name` is a valid C string; the returned record is read
    // immediately, before any other getgr* call on this thread.
    let entry = unsafe { libc::getgrnam(name.as_ptr()) };
    if entry.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("group {group:?} does not exist"),
        ));
    }
    // SAFETY: non-null pointer returned by getgrnam.
    Ok(unsafe { (*entry).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netd::MemoryNetBackend;
    use std::net::Ipv4Addr;

    fn server(backend: Arc<MemoryNetBackend>) -> NetdServer {
        let pool = SubnetPool::new(Ipv4Addr::new(10, 213, 0, 0), 28).unwrap();
        NetdServer::new(backend, pool, AllocationTable::in_memory())
    }

    #[tokio::test]
    async fn alloc_is_idempotent() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(Arc::clone(&backend));
        let id = Uuid::new_v4();
        let first = srv.alloc(id).await.unwrap();
        let second = srv.alloc(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.links().len(), 2);
        assert_eq!(backend.rule_count(), 1);
    }

    #[tokio::test]
    async fn alloc_repairs_missing_devices() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(Arc::clone(&backend));
        let id = Uuid::new_v4();
        let first = srv.alloc(id).await.unwrap();
        backend.delete_link(&first.tap_name).await.unwrap();
        let second = srv.alloc(id).await.unwrap();
        assert_eq!(first, second);
        assert!(backend.links().contains(&first.tap_name));
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(backend);
        for _ in 0..4 {
            srv.alloc(Uuid::new_v4()).await.unwrap();
        }
        let err = srv.alloc(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind, NetdErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn failed_alloc_leaves_nothing() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(Arc::clone(&backend));
        backend.set_fail_creates(true);
        let id = Uuid::new_v4();
        let err = srv.alloc(id).await.unwrap_err();
        assert_eq!(err.kind, NetdErrorKind::OsError);
        assert!(srv.diag(id).await.unwrap().is_clear());
    }

    #[tokio::test]
    async fn release_frees_slot_for_reuse() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(Arc::clone(&backend));
        let a = Uuid::new_v4();
        let first = srv.alloc(a).await.unwrap();
        assert!(srv.release(a).await.unwrap());
        assert!(!srv.release(a).await.unwrap());
        let b = srv.alloc(Uuid::new_v4()).await.unwrap();
        assert_eq!(b.slot, first.slot);
        assert_eq!(backend.links().len(), 2);
    }

    #[tokio::test]
    async fn idle_lab_locks_are_forgotten() {
        let backend = Arc::new(MemoryNetBackend::new());
        let srv = server(Arc::clone(&backend));
        for _ in 0..200 {
            let id = Uuid::new_v4();
            srv.alloc(id).await.unwrap();
            srv.release(id).await.unwrap();
        }

        let id = Uuid::new_v4();
        let results = futures_util::future::join_all((0..8).map(|_| srv.alloc(id))).await;
        assert!(results.iter().all(Result::is_ok));
        srv.release(id).await.unwrap();

        srv.release(Uuid::new_v4()).await.unwrap();
        backend.set_fail_creates(true);
        srv.alloc(Uuid::new_v4()).await.unwrap_err();

        assert_eq!(srv.lab_locks.lock().unwrap().len(), 0);
    }

    #[test]
    fn failed_persist_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("netd");
        let pool = SubnetPool::new(Ipv4Addr::new(10, 213, 0, 0), 28).unwrap();
        let mut table = AllocationTable::load(&state_dir).unwrap();

        let kept = Uuid::new_v4();
        table
            .insert(build_allocation(kept, &DeviceNames::derive(&kept), pool.slot(0).unwrap()))
            .unwrap();

        // A file where the state directory was makes every write fail.
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        let added = Uuid::new_v4();
        table
            .insert(build_allocation(added, &DeviceNames::derive(&added), pool.slot(1).unwrap()))
            .unwrap_err();
        assert!(table.get(&added).is_none());

        table.remove(&kept).unwrap_err();
        assert!(table.get(&kept).is_some());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn table_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryNetBackend::new());
        let pool = SubnetPool::new(Ipv4Addr::new(10, 213, 0, 0), 24).unwrap();
        let id = Uuid::new_v4();

        let srv = NetdServer::new(
            Arc::clone(&backend) as Arc<dyn NetBackend>,
            pool,
            AllocationTable::load(dir.path()).unwrap(),
        );
        let first = srv.alloc(id).await.unwrap();
        drop(srv);

        let reloaded = AllocationTable::load(dir.path()).unwrap();
        assert_eq!(reloaded.get(&id), Some(&first));
        let srv = NetdServer::new(backend, pool, reloaded);
        assert_eq!(srv.alloc(id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn unknown_op_is_unsupported() {
        let srv = server(Arc::new(MemoryNetBackend::new()));
        let resp = srv
            .handle(Request {
                op: "exec".into(),
                lab_id: None,
                params: serde_json::Value::Null,
            })
            .await;
        assert!(matches!(
            resp,
            Response::Error {
                kind: NetdErrorKind::UnsupportedOp,
                ..
            }
        ));
    }
}
