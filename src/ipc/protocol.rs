// IPC Protocol definitions for client-daemon communication

use crate::error::{ErrorKind, WardenError};
use crate::process::ProcessInfo;
use crate::supervisor::ReloadSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Status { name: Option<String> },
    Reload,
    /// Daemon liveness and basic facts
    DaemonStatus,
    /// Stop every process and exit the daemon
    Shutdown,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    Started { name: String },
    Stopped { name: String },
    Restarted { name: String },
    Status { processes: Vec<ProcessInfo> },
    Reloaded { summary: ReloadSummary },
    DaemonStatus {
        pid: u32,
        uptime: Duration,
        processes: usize,
        config_path: Option<PathBuf>,
    },
    ShuttingDown,
}

/// Error side of a response
///
/// `kind` lets the client reproduce the daemon-side exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&WardenError> for ErrorPayload {
    fn from(error: &WardenError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<ErrorPayload> for WardenError {
    fn from(payload: ErrorPayload) -> Self {
        WardenError::Remote {
            kind: payload.kind,
            message: payload.message,
        }
    }
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorPayload>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: &WardenError) -> Self {
        Self {
            id,
            result: Err(ErrorPayload::from(error)),
        }
    }
}
