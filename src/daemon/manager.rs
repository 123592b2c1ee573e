// Daemon lifecycle management

use super::pid::PidFile;
use crate::error::{Result, WardenError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PID-file based view of the daemon, usable from both sides
pub struct DaemonManager {
    pid_file: PidFile,
}

impl DaemonManager {
    pub fn new() -> Self {
        Self {
            pid_file: PidFile::new(),
        }
    }

    pub fn with_pid_file(pid_file: PidFile) -> Self {
        Self { pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.pid_file.is_daemon_running()
    }

    /// PID of the running daemon, if any
    pub fn get_pid(&self) -> Option<u32> {
        if self.is_running() {
            self.pid_file.read().ok()
        } else {
            None
        }
    }

    /// Claim the PID file for the current process
    ///
    /// A stale file left by a dead daemon is replaced.
    pub fn register_daemon(&self) -> Result<()> {
        if self.is_running() {
            return Err(WardenError::DaemonAlreadyRunning);
        }
        self.pid_file.remove()?;
        self.pid_file.write()
    }

    /// Release the PID file if it still names this process
    pub fn unregister_daemon(&self) -> Result<()> {
        match self.pid_file.read() {
            Ok(pid) if pid != std::process::id() => Ok(()),
            _ => self.pid_file.remove(),
        }
    }

    /// Send SIGTERM to the daemon and wait up to `timeout` for it to exit
    ///
    /// Used when the daemon does not answer on its socket.
    pub fn stop_daemon(&self, timeout: Duration) -> Result<()> {
        let pid = self.get_pid().ok_or(WardenError::DaemonNotRunning)?;

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| WardenError::SignalError(format!("Failed to send SIGTERM: {}", e)))?;

        if self.wait_for_exit(timeout) {
            Ok(())
        } else {
            Err(WardenError::Internal(format!(
                "daemon (pid {}) did not exit within {:?}",
                pid, timeout
            )))
        }
    }

    /// Poll until the daemon is gone; false on timeout
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        !self.is_running()
    }

    pub fn get_status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: self.get_pid(),
            pid_file: self.pid_file.path().to_path_buf(),
        }
    }
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Daemon status as seen through the PID file
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}

impl DaemonStatus {
    pub fn running(&self) -> bool {
        self.pid.is_some()
    }
}
