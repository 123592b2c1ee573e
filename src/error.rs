use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Process-related errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process is not running: {0}")]
    NotRunning(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Cron errors
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    #[error("PID file error: {0}")]
    PidFileError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// An error reported by the daemon, re-raised on the client side
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

/// Coarse error classification shared between daemon and client
///
/// The kind survives the trip over the IPC socket so the CLI can pick the
/// right process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Spawn,
    InvalidConfig,
    Other,
}

impl ErrorKind {
    /// Process exit code for the CLI
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::NotFound => 1,
            ErrorKind::Spawn => 2,
            ErrorKind::InvalidConfig => 3,
            ErrorKind::Other => 1,
        }
    }
}

impl WardenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::ProcessNotFound(_) => ErrorKind::NotFound,
            WardenError::SpawnError(_) => ErrorKind::Spawn,
            WardenError::InvalidCronExpression { .. }
            | WardenError::ConfigError(_)
            | WardenError::InvalidConfig(_)
            | WardenError::MissingConfigField(_)
            | WardenError::ConfigValidationError(_) => ErrorKind::InvalidConfig,
            WardenError::Remote { kind, .. } => *kind,
            _ => ErrorKind::Other,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub(crate) fn invalid_cron(expr: &str, reason: impl Into<String>) -> Self {
        WardenError::InvalidCronExpression {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
