//! Control channel to the in-VM agent.
//!
//! The host reaches the guest through the hypervisor's vsock Unix socket:
//!
//! ```text
//! host                         vsock.sock                     guest agent
//!   │ CONNECT <port>\n             │                               │
//!   │ ───────────────────────────► │ ────────────────────────────► │
//!   │ OK <host_port>\n             │                               │
//!   │ ◄─────────────────────────── │                               │
//!   │ {"type":"handshake",…}\n     │                               │
//!   │ ───────────────────────────────────────────────────────────► │
//!   │ {"status":"ok",…}\n          │                               │
//!   │ ◄─────────────────────────────────────────────────────────── │
//! ```
//!
//! One request is in flight at a time and every exchange is bounded by a
//! timeout. The channel is trusted only because nothing outside the host
//! can reach the host side of the vsock device.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::recipe::{BundleFile, MAX_BUNDLE_BYTES};
use crate::wire::{self, MAX_FRAME_BYTES};

/// Agent protocol version sent in the handshake.
pub const AGENT_PROTOCOL_VERSION: u32 = 1;

/// Largest encoded upload sent to the agent: a full bundle in base64 plus
/// headroom for paths.
pub const MAX_UPLOAD_BYTES: usize = 4 * MAX_BUNDLE_BYTES.div_ceil(3) + 64 * 1024;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireFile {
    pub path: String,
    pub data_b64: String,
}

impl From<&BundleFile> for WireFile {
    fn from(file: &BundleFile) -> Self {
        Self {
            path: file.path.clone(),
            data_b64: BASE64.encode(&file.contents),
        }
    }
}

impl WireFile {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data_b64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Handshake {
        protocol_version: u32,
        lab_id: Uuid,
    },
    UploadBundle {
        files: Vec<WireFile>,
    },
    StartWorkload {
        compose_file: String,
        project: String,
    },
    StopWorkload {
        project: String,
    },
}

impl AgentRequest {
    pub fn name(&self) -> &'static str {
        match self {
            AgentRequest::Handshake { .. } => "handshake",
            AgentRequest::UploadBundle { .. } => "upload_bundle",
            AgentRequest::StartWorkload { .. } => "start_workload",
            AgentRequest::StopWorkload { .. } => "stop_workload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentReply {
    Ok {
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        message: String,
        /// Captured engine output, when the agent has any.
        #[serde(default)]
        output: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot reach agent: {0}")]
    Connect(String),
    #[error("agent timed out during {0}")]
    Timeout(&'static str),
    #[error("agent rejected {request}: {message}")]
    Rejected {
        request: &'static str,
        message: String,
        output: Option<String>,
    },
    #[error("agent protocol error: {0}")]
    Protocol(String),
    #[error("bundle encodes to {bytes} bytes, limit is {max}")]
    TooLarge { bytes: usize, max: usize },
}

impl AgentError {
    /// Captured output worth keeping for operators.
    pub fn output(&self) -> Option<&str> {
        match self {
            AgentError::Rejected { output, .. } => output.as_deref(),
            _ => None,
        }
    }
}

pub struct AgentClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl AgentClient {
    /// Connect through the vsock socket, retrying until the guest agent
    /// answers or `timeout` elapses.
    pub async fn connect(vsock_socket: &Path, port: u32, timeout: Duration) -> Result<Self, AgentError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_error = String::from("no attempt made");

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AgentError::Connect(last_error));
            }
            match tokio::time::timeout(remaining, Self::try_connect(vsock_socket, port)).await {
                Ok(Ok(client)) => {
                    info!(socket = %vsock_socket.display(), port, "agent channel open");
                    return Ok(client);
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "agent not reachable yet");
                    last_error = e;
                }
                Err(_) => return Err(AgentError::Connect(last_error)),
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }

    async fn try_connect(vsock_socket: &Path, port: u32) -> Result<Self, String> {
        let stream = UnixStream::connect(vsock_socket)
            .await
            .map_err(|e| format!("connect {}: {e}", vsock_socket.display()))?;
        let (read_half, mut writer) = stream.into_split();
        writer
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await
            .map_err(|e| format!("send CONNECT: {e}"))?;

        let mut reader = BufReader::new(read_half);
        let line = wire::read_line(&mut reader, 256)
            .await
            .map_err(|e| format!("read CONNECT reply: {e}"))?
            .ok_or_else(|| "vsock closed before CONNECT reply".to_string())?;
        let line = String::from_utf8_lossy(&line);
        if !line.starts_with("OK ") {
            return Err(format!("unexpected CONNECT reply {:?}", line.trim()));
        }
        Ok(Self { reader, writer })
    }

    /// Send one request and wait for its reply.
    pub async fn call(
        &mut self,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, AgentError> {
        let name = request.name();
        debug!(request = name, "agent request");

        let exchange = async {
            wire::write_frame(&mut self.writer, request)
                .await
                .map_err(|e| AgentError::Protocol(format!("send {name}: {e}")))?;
            wire::read_frame::<_, AgentReply>(&mut self.reader, MAX_FRAME_BYTES)
                .await
                .map_err(|e| AgentError::Protocol(format!("read {name} reply: {e}")))?
                .ok_or_else(|| AgentError::Protocol(format!("agent closed during {name}")))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(AgentError::Timeout(name)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(AgentReply::Ok { result })) => Ok(result),
            Ok(Ok(AgentReply::Error { message, output })) => Err(AgentError::Rejected {
                request: name,
                message,
                output,
            }),
        }
    }

    pub async fn handshake(&mut self, lab_id: Uuid, timeout: Duration) -> Result<(), AgentError> {
        let request = AgentRequest::Handshake {
            protocol_version: AGENT_PROTOCOL_VERSION,
            lab_id,
        };
        let result = self.call(&request, timeout).await?;
        let version = result
            .get("protocol_version")
            .and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(AGENT_PROTOCOL_VERSION)) {
            return Err(AgentError::Protocol(format!(
                "agent speaks protocol {version:?}, expected {AGENT_PROTOCOL_VERSION}"
            )));
        }
        Ok(())
    }

    pub async fn upload_bundle(&mut self, files: &[BundleFile], timeout: Duration) -> Result<(), AgentError> {
        let request = upload_request(files)?;
        self.call(&request, timeout).await.map(|_| ())
    }

    pub async fn start_workload(
        &mut self,
        compose_file: &str,
        project: &str,
        timeout: Duration,
    ) -> Result<(), AgentError> {
        let request = AgentRequest::StartWorkload {
            compose_file: compose_file.to_string(),
            project: project.to_string(),
        };
        self.call(&request, timeout).await.map(|_| ())
    }

    pub async fn stop_workload(&mut self, project: &str, timeout: Duration) -> Result<(), AgentError> {
        let request = AgentRequest::StopWorkload {
            project: project.to_string(),
        };
        self.call(&request, timeout).await.map(|_| ())
    }
}

/// Encode `files` for upload, refusing anything over [`MAX_UPLOAD_BYTES`].
fn upload_request(files: &[BundleFile]) -> Result<AgentRequest, AgentError> {
    let files: Vec<WireFile> = files.iter().map(WireFile::from).collect();
    let bytes: usize = files.iter().map(|f| f.path.len() + f.data_b64.len()).sum();
    if bytes > MAX_UPLOAD_BYTES {
        return Err(AgentError::TooLarge {
            bytes,
            max: MAX_UPLOAD_BYTES,
        });
    }
    Ok(AgentRequest::UploadBundle { files })
}
