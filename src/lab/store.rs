//! SQLite persistence for lab rows.
//!
//! One connection behind a std mutex; every read-check-write runs inside a
//! transaction while the mutex is held, so the tenancy check, the quota
//! count and the insert are atomic with respect to each other. A partial
//! unique index backs the one-active-lab-per-owner rule in the schema too.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use tracing::debug;
use uuid::Uuid;

use super::{FailureReason, Lab, LabStatus, NetworkHandle, VmHandle};
use crate::error::{LabError, LabResult};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS labs (
    lab_id              TEXT PRIMARY KEY,
    owner_id            TEXT NOT NULL,
    recipe_ref          TEXT NOT NULL,
    status              TEXT NOT NULL CHECK (status IN
                            ('REQUESTED','PROVISIONING','READY','ENDING','FINISHED','FAILED')),
    runtime_kind        TEXT NOT NULL,
    connection_endpoint TEXT,
    network_handle      TEXT,
    vm_handle           TEXT,
    failure_reason      TEXT,
    failure_detail      TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS labs_one_active_per_owner
    ON labs(owner_id) WHERE status NOT IN ('FINISHED','FAILED');
CREATE INDEX IF NOT EXISTS labs_by_status ON labs(status);
";

const LAB_COLUMNS: &str = "lab_id, owner_id, recipe_ref, status, runtime_kind, \
    connection_endpoint, network_handle, vm_handle, failure_reason, failure_detail, \
    created_at, updated_at";

/// Fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct LabUpdate {
    /// Only kept when the target status is `READY`.
    pub endpoint: Option<String>,
    pub network: Option<NetworkHandle>,
    pub vm: Option<VmHandle>,
    pub failure: Option<(FailureReason, Option<String>)>,
}

impl LabUpdate {
    pub fn ready(endpoint: String) -> Self {
        Self {
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    pub fn failed(reason: FailureReason, detail: Option<String>) -> Self {
        Self {
            failure: Some((reason, detail)),
            ..Self::default()
        }
    }
}

pub struct LabStore {
    conn: Mutex<Connection>,
}

impl LabStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> LabResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LabError::Internal(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
        if mode != "wal" {
            return Err(LabError::Internal(format!(
                "failed to enable WAL mode: journal_mode is '{mode}'"
            )));
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> LabResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LabResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> LabResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LabError::Internal("lab store lock poisoned".into()))
    }

    /// Insert a new `REQUESTED` lab, enforcing tenancy and the quota.
    pub fn insert_new(&self, lab: &Lab, max_active: usize) -> LabResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT lab_id FROM labs
                 WHERE owner_id = ?1 AND status NOT IN ('FINISHED','FAILED')
                 LIMIT 1",
                params![lab.owner_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            let id = Uuid::parse_str(&existing)
                .map_err(|e| LabError::Internal(format!("corrupt lab id {existing:?}: {e}")))?;
            return Err(LabError::ActiveLabExists(id));
        }

        let active = count_active(&tx)?;
        if active >= max_active {
            return Err(LabError::QuotaExceeded {
                active,
                limit: max_active,
            });
        }

        tx.execute(
            &format!("INSERT INTO labs ({LAB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                lab.lab_id.to_string(),
                lab.owner_id,
                lab.recipe_ref,
                lab.status.as_str(),
                lab.runtime_kind.as_str(),
                lab.connection_endpoint,
                to_json(&lab.network_handle)?,
                to_json(&lab.vm_handle)?,
                lab.failure_reason.map(FailureReason::as_str),
                lab.failure_detail,
                lab.created_at.to_rfc3339(),
                lab.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        debug!(lab_id = %lab.lab_id, owner_id = %lab.owner_id, "lab row inserted");
        Ok(())
    }

    pub fn get(&self, lab_id: &Uuid) -> LabResult<Option<Lab>> {
        let conn = self.lock()?;
        query_lab(&conn, lab_id)
    }

    /// The lab if it exists and belongs to `owner_id`; `NotFound` otherwise.
    pub fn get_owned(&self, lab_id: &Uuid, owner_id: &str) -> LabResult<Lab> {
        match self.get(lab_id)? {
            Some(lab) if lab.owner_id == owner_id => Ok(lab),
            _ => Err(LabError::NotFound),
        }
    }

    pub fn count_active(&self) -> LabResult<usize> {
        let conn = self.lock()?;
        count_active(&conn)
    }

    pub fn list_by_status(&self, statuses: &[LabStatus]) -> LabResult<Vec<Lab>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {LAB_COLUMNS} FROM labs WHERE status IN ({placeholders}) ORDER BY created_at"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let labs = stmt
            .query_map(
                rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str())),
                row_to_lab,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labs)
    }

    /// Record runtime handles without a status change. Terminal labs are
    /// left untouched.
    pub fn attach_handles(
        &self,
        lab_id: &Uuid,
        network: Option<NetworkHandle>,
        vm: Option<VmHandle>,
    ) -> LabResult<Lab> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut lab = query_lab(&tx, lab_id)?.ok_or(LabError::NotFound)?;
        if lab.status.is_terminal() {
            return Ok(lab);
        }
        if network.is_some() {
            lab.network_handle = network;
        }
        if vm.is_some() {
            lab.vm_handle = vm;
        }
        lab.updated_at = Utc::now();
        write_lab(&tx, &lab)?;
        tx.commit()?;
        Ok(lab)
    }

    /// Move a lab to `to`, applying `update`.
    ///
    /// The connection endpoint is kept only on `READY`; every other target
    /// status clears it.
    pub fn transition(&self, lab_id: &Uuid, to: LabStatus, update: LabUpdate) -> LabResult<Lab> {
        self.transition_checked(lab_id, None, to, update)
    }

    /// Like [`LabStore::transition`], but only from one of `from`. Any other
    /// current status is an `InvalidTransition`.
    pub fn transition_from(
        &self,
        lab_id: &Uuid,
        from: &[LabStatus],
        to: LabStatus,
        update: LabUpdate,
    ) -> LabResult<Lab> {
        self.transition_checked(lab_id, Some(from), to, update)
    }

    fn transition_checked(
        &self,
        lab_id: &Uuid,
        from: Option<&[LabStatus]>,
        to: LabStatus,
        update: LabUpdate,
    ) -> LabResult<Lab> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = query_lab(&tx, lab_id)?.ok_or(LabError::NotFound)?;
        let expected = from.is_none_or(|from| from.contains(&current.status));
        if !expected || !current.status.can_transition_to(to) {
            return Err(LabError::InvalidTransition {
                lab_id: *lab_id,
                from: current.status,
                to,
            });
        }

        let from = current.status;
        let mut next = current;
        next.status = to;
        next.connection_endpoint = match to {
            LabStatus::Ready => update.endpoint.or(next.connection_endpoint),
            _ => None,
        };
        if let Some(network) = update.network {
            next.network_handle = Some(network);
        }
        if let Some(vm) = update.vm {
            next.vm_handle = Some(vm);
        }
        if let Some((reason, detail)) = update.failure {
            next.failure_reason = Some(reason);
            next.failure_detail = detail;
        }
        next.updated_at = Utc::now();

        write_lab(&tx, &next)?;
        tx.commit()?;
        debug!(lab_id = %lab_id, %from, %to, "lab transitioned");
        Ok(next)
    }
}

fn count_active(conn: &Connection) -> LabResult<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM labs WHERE status NOT IN ('FINISHED','FAILED')",
        [],
        |row| row.get(0),
    )?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn query_lab(conn: &Connection, lab_id: &Uuid) -> LabResult<Option<Lab>> {
    let lab = conn
        .query_row(
            &format!("SELECT {LAB_COLUMNS} FROM labs WHERE lab_id = ?1"),
            params![lab_id.to_string()],
            row_to_lab,
        )
        .optional()?;
    Ok(lab)
}

fn write_lab(tx: &Transaction<'_>, lab: &Lab) -> LabResult<()> {
    tx.execute(
        "UPDATE labs SET status = ?2, connection_endpoint = ?3, network_handle = ?4,
             vm_handle = ?5, failure_reason = ?6, failure_detail = ?7, updated_at = ?8
         WHERE lab_id = ?1",
        params![
            lab.lab_id.to_string(),
            lab.status.as_str(),
            lab.connection_endpoint,
            to_json(&lab.network_handle)?,
            to_json(&lab.vm_handle)?,
            lab.failure_reason.map(FailureReason::as_str),
            lab.failure_detail,
            lab.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &Option<T>) -> LabResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| LabError::Internal(format!("encode handle: {e}")))
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn row_to_lab(row: &Row<'_>) -> rusqlite::Result<Lab> {
    let lab_id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let runtime_kind: String = row.get(4)?;
    let failure_reason: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(Lab {
        lab_id: Uuid::parse_str(&lab_id).map_err(|e| conversion(0, e))?,
        owner_id: row.get(1)?,
        recipe_ref: row.get(2)?,
        status: status.parse().map_err(|e: String| conversion(3, e))?,
        runtime_kind: runtime_kind.parse().map_err(|e: String| conversion(4, e))?,
        connection_endpoint: row.get(5)?,
        network_handle: parse_json(6, row.get(6)?)?,
        vm_handle: parse_json(7, row.get(7)?)?,
        failure_reason: failure_reason
            .map(|r| r.parse().map_err(|e: String| conversion(8, e)))
            .transpose()?,
        failure_detail: row.get(9)?,
        created_at: parse_time(10, &created_at)?,
        updated_at: parse_time(11, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeKind;

    fn lab(owner: &str) -> Lab {
        Lab::new(owner, "web-basic", RuntimeKind::Noop)
    }

    #[test]
    fn second_active_lab_for_owner_is_rejected() {
        let store = LabStore::open_in_memory().unwrap();
        let first = lab("u1");
        store.insert_new(&first, 10).unwrap();

        let err = store.insert_new(&lab("u1"), 10).unwrap_err();
        assert!(matches!(err, LabError::ActiveLabExists(id) if id == first.lab_id));

        store.insert_new(&lab("u2"), 10).unwrap();
    }

    #[test]
    fn terminal_lab_frees_the_owner() {
        let store = LabStore::open_in_memory().unwrap();
        let first = lab("u1");
        store.insert_new(&first, 10).unwrap();
        store
            .transition(
                &first.lab_id,
                LabStatus::Failed,
                LabUpdate::failed(FailureReason::Boot, None),
            )
            .unwrap();
        store.insert_new(&lab("u1"), 10).unwrap();
    }

    #[test]
    fn quota_counts_every_active_lab() {
        let store = LabStore::open_in_memory().unwrap();
        store.insert_new(&lab("a"), 2).unwrap();
        store.insert_new(&lab("b"), 2).unwrap();
        let err = store.insert_new(&lab("c"), 2).unwrap_err();
        assert!(matches!(err, LabError::QuotaExceeded { active: 2, limit: 2 }));
    }

    #[test]
    fn endpoint_only_survives_on_ready() {
        let store = LabStore::open_in_memory().unwrap();
        let l = lab("u1");
        store.insert_new(&l, 10).unwrap();
        store
            .transition(&l.lab_id, LabStatus::Provisioning, LabUpdate::default())
            .unwrap();
        let ready = store
            .transition(
                &l.lab_id,
                LabStatus::Ready,
                LabUpdate::ready("10.213.0.2:3389".into()),
            )
            .unwrap();
        assert_eq!(ready.connection_endpoint.as_deref(), Some("10.213.0.2:3389"));

        let ending = store
            .transition(&l.lab_id, LabStatus::Ending, LabUpdate::default())
            .unwrap();
        assert_eq!(ending.connection_endpoint, None);
        assert_eq!(store.get(&l.lab_id).unwrap().unwrap().connection_endpoint, None);
    }

    #[test]
    fn terminal_rows_refuse_transitions() {
        let store = LabStore::open_in_memory().unwrap();
        let l = lab("u1");
        store.insert_new(&l, 10).unwrap();
        store
            .transition(&l.lab_id, LabStatus::Ending, LabUpdate::default())
            .unwrap();
        store
            .transition(&l.lab_id, LabStatus::Finished, LabUpdate::default())
            .unwrap();
        let err = store
            .transition(&l.lab_id, LabStatus::Failed, LabUpdate::default())
            .unwrap_err();
        assert!(matches!(err, LabError::InvalidTransition { .. }));
    }

    #[test]
    fn transition_from_only_moves_expected_rows() {
        let store = LabStore::open_in_memory().unwrap();
        let l = lab("u1");
        store.insert_new(&l, 10).unwrap();
        store
            .transition(&l.lab_id, LabStatus::Ending, LabUpdate::default())
            .unwrap();

        let pending = [LabStatus::Requested, LabStatus::Provisioning];
        let err = store
            .transition_from(
                &l.lab_id,
                &pending,
                LabStatus::Failed,
                LabUpdate::failed(FailureReason::Boot, None),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::InvalidTransition {
                from: LabStatus::Ending,
                ..
            }
        ));
        assert_eq!(store.get(&l.lab_id).unwrap().unwrap().status, LabStatus::Ending);

        store
            .transition_from(&l.lab_id, &[LabStatus::Ending], LabStatus::Finished, LabUpdate::default())
            .unwrap();
    }

    #[test]
    fn foreign_owner_sees_not_found() {
        let store = LabStore::open_in_memory().unwrap();
        let l = lab("u1");
        store.insert_new(&l, 10).unwrap();
        assert!(store.get_owned(&l.lab_id, "u1").is_ok());
        assert!(matches!(
            store.get_owned(&l.lab_id, "u2"),
            Err(LabError::NotFound)
        ));
        assert!(matches!(
            store.get_owned(&Uuid::new_v4(), "u1"),
            Err(LabError::NotFound)
        ));
    }

    #[test]
    fn handles_roundtrip_through_the_row() {
        let store = LabStore::open_in_memory().unwrap();
        let l = lab("u1");
        store.insert_new(&l, 10).unwrap();
        let vm = VmHandle {
            pid: 4242,
            api_socket: "/tmp/x/api.sock".into(),
            vsock_socket: "/tmp/x/vsock.sock".into(),
            state_dir: "/tmp/x".into(),
        };
        let update = LabUpdate {
            vm: Some(vm.clone()),
            ..LabUpdate::default()
        };
        store
            .transition(&l.lab_id, LabStatus::Provisioning, update)
            .unwrap();
        let loaded = store.get(&l.lab_id).unwrap().unwrap();
        assert_eq!(loaded.vm_handle, Some(vm));
        assert_eq!(loaded.status, LabStatus::Provisioning);
        assert_eq!(
            store
                .list_by_status(&[LabStatus::Provisioning])
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labs.db");
        let l = lab("u1");
        {
            let store = LabStore::open(&path).unwrap();
            store.insert_new(&l, 10).unwrap();
            store
                .transition(&l.lab_id, LabStatus::Ending, LabUpdate::default())
                .unwrap();
        }
        let store = LabStore::open(&path).unwrap();
        let ending = store.list_by_status(&[LabStatus::Ending]).unwrap();
        assert_eq!(ending.len(), 1);
        assert_eq!(ending[0].lab_id, l.lab_id);
    }
}
