//! Client side of the netd protocol.
//!
//! Each call opens a fresh connection, writes one request line and reads one
//! response line under a deadline. The client never retries; callers decide.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tracing::debug;
use uuid::Uuid;

use super::{
    DiagResult, HelloResult, NetAllocation, NetdError, NetdErrorKind, Op, PROTOCOL_VERSION,
    Request, Response,
};
use crate::wire::{self, MAX_FRAME_BYTES};

#[derive(Debug, Clone)]
pub struct NetdClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl NetdClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn hello(&self) -> Result<HelloResult, NetdError> {
        self.call(Request::new(Op::Hello, None)).await
    }

    pub async fn ping(&self) -> Result<(), NetdError> {
        self.call::<serde_json::Value>(Request::new(Op::Ping, None))
            .await
            .map(|_| ())
    }

    pub async fn alloc_vm_net(&self, lab_id: &Uuid) -> Result<NetAllocation, NetdError> {
        self.call(Request::new(Op::AllocVmNet, Some(lab_id))).await
    }

    /// Returns whether netd held an allocation for the lab.
    pub async fn release_vm_net(&self, lab_id: &Uuid) -> Result<bool, NetdError> {
        let value: serde_json::Value = self.call(Request::new(Op::ReleaseVmNet, Some(lab_id))).await?;
        Ok(value
            .get("released")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn diag_vm_net(&self, lab_id: &Uuid) -> Result<DiagResult, NetdError> {
        self.call(Request::new(Op::DiagVmNet, Some(lab_id))).await
    }

    /// Fail unless netd answers `hello` with our protocol version and every
    /// op in `required`.
    pub async fn ensure_compatible(&self, required: &[Op]) -> Result<HelloResult, NetdError> {
        let hello = self.hello().await?;
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(NetdError::new(
                NetdErrorKind::UnsupportedOp,
                format!(
                    "netd speaks protocol {}, expected {PROTOCOL_VERSION}",
                    hello.protocol_version
                ),
            ));
        }
        let missing: Vec<&str> = required
            .iter()
            .map(|op| op.as_str())
            .filter(|op| !hello.ops.iter().any(|have| have == op))
            .collect();
        if !missing.is_empty() {
            return Err(NetdError::new(
                NetdErrorKind::UnsupportedOp,
                format!("netd lacks ops: {}", missing.join(", ")),
            ));
        }
        Ok(hello)
    }

    /// Send a raw request and return the raw response.
    pub async fn send(&self, req: &Request) -> Result<Response, NetdError> {
        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                NetdError::os(format!("connect {}: {e}", self.socket_path.display()))
            })?;
            let (read_half, mut write_half) = stream.into_split();
            wire::write_frame(&mut write_half, req)
                .await
                .map_err(|e| NetdError::os(format!("send request: {e}")))?;
            let mut reader = BufReader::new(read_half);
            wire::read_frame::<_, Response>(&mut reader, MAX_FRAME_BYTES)
                .await
                .map_err(|e| NetdError::os(format!("read response: {e}")))?
                .ok_or_else(|| NetdError::os("netd closed the connection"))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetdError::os(format!(
                "netd did not answer {} within {:?}",
                req.op, self.timeout
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, req: Request) -> Result<T, NetdError> {
        debug!(op = %req.op, lab_id = ?req.lab_id, "netd request");
        match self.send(&req).await? {
            Response::Ok { result } => serde_json::from_value(result)
                .map_err(|e| NetdError::new(NetdErrorKind::Malformed, format!("decode result: {e}"))),
            Response::Error { kind, message } => Err(NetdError { kind, message }),
        }
    }
}
