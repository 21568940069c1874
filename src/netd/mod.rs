//! Network Resource Daemon (netd).
//!
//! netd is the only process allowed to create or remove lab network devices
//! and NAT/forwarding rules. Everything else reaches it through a
//! group-restricted Unix socket speaking newline-delimited JSON:
//!
//! ```text
//! client                                   netd
//!   │ {"op":"hello"}                        │
//!   │ ────────────────────────────────────► │
//!   │ {"status":"ok","result":{"protocol_version":1,"ops":[…]}}
//!   │ ◄──────────────────────────────────── │
//!   │ {"op":"alloc_vm_net","lab_id":"…"}    │  validate id → derive names
//!   │ ────────────────────────────────────► │  → bridge + tap + NAT
//!   │ {"status":"ok","result":{"bridge_name":"lwbr…",…}}
//! ```
//!
//! Device names are a pure function of the lab id (truncated SHA-256), so
//! no client-supplied string ever reaches a device name or a command line.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod backend;
pub mod client;
pub mod server;

pub use backend::{IpBackend, MemoryNetBackend, NetBackend};
pub use client::NetdClient;
pub use server::{AllocationTable, NetdServer};

/// Wire protocol version reported by `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame cap for netd requests; requests are tiny.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Hello,
    Ping,
    AllocVmNet,
    ReleaseVmNet,
    DiagVmNet,
}

impl Op {
    pub const ALL: [Op; 5] = [
        Op::Hello,
        Op::Ping,
        Op::AllocVmNet,
        Op::ReleaseVmNet,
        Op::DiagVmNet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Hello => "hello",
            Op::Ping => "ping",
            Op::AllocVmNet => "alloc_vm_net",
            Op::ReleaseVmNet => "release_vm_net",
            Op::DiagVmNet => "diag_vm_net",
        }
    }

    pub fn from_wire(s: &str) -> Option<Op> {
        Op::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// `{op, lab_id, params}` request. `op` stays a string on the wire so an
/// unknown op can be answered with `unsupported_op` instead of a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(op: Op, lab_id: Option<&Uuid>) -> Self {
        Self {
            op: op.as_str().to_string(),
            lab_id: lab_id.map(Uuid::to_string),
            params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { result: serde_json::Value },
    Error { kind: NetdErrorKind, message: String },
}

impl Response {
    pub fn ok<T: Serialize>(result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Response::Ok { result },
            Err(e) => Response::Error {
                kind: NetdErrorKind::OsError,
                message: format!("encode result: {e}"),
            },
        }
    }
}

impl From<NetdError> for Response {
    fn from(err: NetdError) -> Self {
        Response::Error {
            kind: err.kind,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloResult {
    pub protocol_version: u32,
    pub ops: Vec<String>,
}

/// Resources held by one lab. Returned by `alloc_vm_net` and `diag_vm_net`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetAllocation {
    pub lab_id: Uuid,
    pub bridge_name: String,
    pub tap_name: String,
    pub guest_mac: String,
    /// Network in CIDR form, e.g. `10.213.0.4/30`.
    pub subnet: String,
    pub gateway_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub slot: u32,
    pub allocated_at: DateTime<Utc>,
}

/// Observed state for one lab; never mutates anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagResult {
    pub lab_id: Uuid,
    pub allocation: Option<NetAllocation>,
    pub bridge_present: bool,
    pub tap_present: bool,
    pub nat_present: bool,
}

impl DiagResult {
    /// True when neither the table nor the host holds anything for the lab.
    pub fn is_clear(&self) -> bool {
        self.allocation.is_none() && !self.bridge_present && !self.tap_present && !self.nat_present
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetdErrorKind {
    InvalidId,
    NotFound,
    OsError,
    Exhausted,
    UnsupportedOp,
    Malformed,
}

impl fmt::Display for NetdErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetdErrorKind::InvalidId => "invalid_id",
            NetdErrorKind::NotFound => "not_found",
            NetdErrorKind::OsError => "os_error",
            NetdErrorKind::Exhausted => "exhausted",
            NetdErrorKind::UnsupportedOp => "unsupported_op",
            NetdErrorKind::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NetdError {
    pub kind: NetdErrorKind,
    pub message: String,
}

impl NetdError {
    pub fn new(kind: NetdErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn os(message: impl Into<String>) -> Self {
        Self::new(NetdErrorKind::OsError, message)
    }
}

// ---------------------------------------------------------------------------
// Validation and naming
// ---------------------------------------------------------------------------

static LAB_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("static pattern")
});

/// Accept only the canonical lowercase hyphenated UUID form.
pub fn validate_lab_id(raw: Option<&str>) -> Result<Uuid, NetdError> {
    let raw = raw.ok_or_else(|| NetdError::new(NetdErrorKind::InvalidId, "lab_id is required"))?;
    if !LAB_ID_PATTERN.is_match(raw) {
        return Err(NetdError::new(
            NetdErrorKind::InvalidId,
            "lab_id must be a lowercase hyphenated UUID",
        ));
    }
    Uuid::parse_str(raw).map_err(|e| NetdError::new(NetdErrorKind::InvalidId, e.to_string()))
}

/// Host device names for one lab. All fit in IFNAMSIZ (15 usable bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceNames {
    pub bridge: String,
    pub tap: String,
    pub guest_mac: String,
}

impl DeviceNames {
    pub fn derive(lab_id: &Uuid) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"labwarden-netdev:");
        hasher.update(lab_id.as_hyphenated().to_string().as_bytes());
        let digest = hasher.finalize();

        let tag = hex::encode(&digest[..5]);
        // Locally administered, unicast.
        let guest_mac = format!(
            "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
            digest[5], digest[6], digest[7], digest[8]
        );

        Self {
            bridge: format!("lwbr{tag}"),
            tap: format!("lwtap{tag}"),
            guest_mac,
        }
    }
}

// ---------------------------------------------------------------------------
// Subnet pool
// ---------------------------------------------------------------------------

/// Addresses of one /30 slot: network, gateway (host side), guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetSlot {
    pub index: u32,
    pub network: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub guest: Ipv4Addr,
}

impl SubnetSlot {
    pub const PREFIX_LEN: u8 = 30;

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, Self::PREFIX_LEN)
    }
}

/// Server-controlled pool carved into /30 slots.
#[derive(Debug, Clone, Copy)]
pub struct SubnetPool {
    base: u32,
    prefix: u8,
}

impl SubnetPool {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, NetdError> {
        if !(8..=30).contains(&prefix) {
            return Err(NetdError::os(format!("pool prefix /{prefix} out of range")));
        }
        let base = u32::from(base);
        let mask = u32::MAX << (32 - prefix);
        if base & !mask != 0 {
            return Err(NetdError::os("pool base is not aligned to its prefix"));
        }
        Ok(Self { base, prefix })
    }

    pub fn capacity(&self) -> u32 {
        1u32 << (32 - self.prefix - 2)
    }

    /// CIDR of the whole pool, used by the lab-to-lab isolation rule.
    pub fn cidr(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }

    pub fn slot(&self, index: u32) -> Option<SubnetSlot> {
        if index >= self.capacity() {
            return None;
        }
        let network = self.base + index * 4;
        Some(SubnetSlot {
            index,
            network: Ipv4Addr::from(network),
            gateway: Ipv4Addr::from(network + 1),
            guest: Ipv4Addr::from(network + 2),
        })
    }

    /// Lowest slot not in `used`.
    pub fn first_free<I>(&self, used: I) -> Option<SubnetSlot>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut taken: Vec<u32> = used.into_iter().collect();
        taken.sort_unstable();
        let mut candidate = 0u32;
        for index in taken {
            if index == candidate {
                candidate += 1;
            } else if index > candidate {
                break;
            }
        }
        self.slot(candidate)
    }
}
