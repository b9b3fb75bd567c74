//! Control-surface wire protocol.
//!
//! Length-prefixed JSON over the Unix control socket: each frame is a 4-byte
//! big-endian length followed by one JSON document, capped at
//! [`MAX_FRAME_SIZE`] so a bad client cannot make the daemon allocate
//! unboundedly. Requests are `{op, args}`; responses are `{ok, value}` or
//! `{ok: false, error}`.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::{HostDescriptor, Reachability};
use crate::ledger::{ChangeState, PendingChange};
use crate::snapshot::SnapshotMeta;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Client-side connect/read budget.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Request {
    Status,
    ListChanges {
        #[serde(default)]
        live_only: bool,
    },
    Confirm {
        change_id: String,
    },
    Cancel {
        change_id: String,
    },
    SnapshotsList,
    SnapshotsCreate {
        #[serde(default)]
        description: Option<String>,
    },
    SnapshotsRestore {
        snapshot_id: String,
    },
    SelfTest,
    /// Internal: re-read the configuration and swap in fresh policies and
    /// glob lists. Triggered by SIGHUP, not exposed on the CLI.
    ReloadPolicies,
    Shutdown,
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn ok(value: ResponseValue) -> Self {
        Response {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Response {
            ok: false,
            value: None,
            error: Some(ErrorPayload {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Untagged: every variant carries a distinguishing required field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum ResponseValue {
    Status(StatusInfo),
    Changes { changes: Vec<ChangeSummary> },
    ChangeUpdated { change_id: String, state: ChangeState },
    Snapshots { snapshots: Vec<SnapshotMeta> },
    SnapshotCreated { snapshot_id: String },
    Restored { files_restored: usize },
    SelfTest(SelfTestReport),
    Reloaded { reloaded: bool },
    ShuttingDown { shutting_down: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub version: String,
    pub pid: u32,
    pub safe_mode: bool,
    pub open_changes: usize,
    pub grace_changes: usize,
    pub host: HostDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub change_id: String,
    pub category: String,
    pub state: ChangeState,
    pub paths: Vec<String>,
    pub snapshot_id: String,
    pub created_at_ms: u64,
    pub deadline_wall_ms: u64,
    /// Seconds until the confirmation deadline; zero once expired.
    pub remaining_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_remaining_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reachability: Option<Reachability>,
}

impl ChangeSummary {
    pub fn from_change(change: &PendingChange, now: std::time::Instant) -> Self {
        ChangeSummary {
            change_id: change.id.to_string(),
            category: change.category.clone(),
            state: change.state,
            paths: change
                .paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            snapshot_id: change.snapshot_id.to_string(),
            created_at_ms: change.created_at_ms,
            deadline_wall_ms: change.deadline_wall_ms,
            remaining_secs: change.remaining(now).as_secs(),
            grace_remaining_secs: change
                .grace_deadline
                .map(|d| d.saturating_duration_since(now).as_secs()),
            reachability: change.reachability.clone(),
        }
    }
}

/// Machine-readable capability report for `revertit test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub root: bool,
    pub distro_family: String,
    pub init_system: String,
    pub init_system_known: bool,
    pub snapshot_store_writable: bool,
    pub ping_available: bool,
    pub watched_paths: usize,
}

impl SelfTestReport {
    /// The capabilities the daemon cannot operate without.
    pub fn required_ok(&self) -> bool {
        self.init_system_known && self.snapshot_store_writable
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),

    #[error("daemon closed the connection")]
    Disconnected,

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),
}

// =============================================================================
// Framing
// =============================================================================

pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> Result<(), IpcError> {
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>, IpcError> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(IpcError::Disconnected)
        }
        Err(e) => return Err(IpcError::Io(e)),
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Disconnected
        } else {
            IpcError::Io(e)
        }
    })?;
    Ok(payload)
}

pub fn write_request(stream: &mut impl Write, request: &Request) -> Result<(), IpcError> {
    write_frame(stream, &serde_json::to_vec(request)?)
}

pub fn read_request(stream: &mut impl Read) -> Result<Request, IpcError> {
    Ok(serde_json::from_slice(&read_frame(stream)?)?)
}

pub fn write_response(stream: &mut impl Write, response: &Response) -> Result<(), IpcError> {
    write_frame(stream, &serde_json::to_vec(response)?)
}

pub fn read_response(stream: &mut impl Read) -> Result<Response, IpcError> {
    Ok(serde_json::from_slice(&read_frame(stream)?)?)
}

// =============================================================================
// Client
// =============================================================================

/// One request/response round trip against the daemon socket.
pub fn send_request(socket: &Path, request: &Request) -> Result<Response, IpcError> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|e| IpcError::DaemonUnavailable(format!("connect {}: {e}", socket.display())))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
    write_request(&mut stream, request)?;
    read_response(&mut stream)
}
