use crate::process::restart::{started_within, RestartTracker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Lifecycle state of a supervised instance
///
/// `Stopped` and `Failed` are terminal: only an explicit command moves an
/// instance out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Restarting,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Stopping, Running)
                | (Stopping, Restarting)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Restarting, Starting)
                | (Restarting, Stopped)
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Restarting => write!(f, "restarting"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// How a child terminated: an exit code or the signal that killed it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitDescriptor {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitDescriptor {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// True when the child exited with one of `clean_exit_codes`
    ///
    /// A signal death is never clean.
    pub fn is_clean(&self, clean_exit_codes: &BTreeSet<i32>) -> bool {
        self.code.is_some_and(|code| clean_exit_codes.contains(&code))
    }

    /// Exit whose status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitDescriptor {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => match nix::sys::signal::Signal::try_from(sig) {
                Ok(signal) => write!(f, "signal {} ({})", sig, signal.as_str()),
                Err(_) => write!(f, "signal {}", sig),
            },
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// One unsolicited exit, kept for the rolling restart window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashEvent {
    pub started_at: SystemTime,
    pub exit: ExitDescriptor,
    pub exited_at: SystemTime,
}

/// Status snapshot of one instance, as reported by `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub uptime: Duration,
    /// Relaunches of this instance, whatever triggered them
    pub restarts: usize,
    /// Crashes currently counted against `max_restarts`
    pub crashes_in_window: usize,
    pub max_restarts: usize,
    pub last_exit: Option<ExitDescriptor>,
    pub cron_restart: Option<String>,
    pub next_cron_restart: Option<SystemTime>,
    /// Start times of crashed runs still held by the restart tracker
    #[serde(skip)]
    crash_starts: Vec<SystemTime>,
    #[serde(skip)]
    window: Duration,
}

impl ProcessInfo {
    /// Recompute time-dependent fields against `now`
    ///
    /// Crashes age out of `crashes_in_window` here as well, so a snapshot
    /// published long ago still reports the current count.
    pub fn refreshed(mut self, now: SystemTime) -> Self {
        self.uptime = match (self.state, self.started_at) {
            (ProcessState::Running, Some(started)) => {
                now.duration_since(started).unwrap_or(Duration::ZERO)
            }
            _ => Duration::ZERO,
        };
        // A snapshot received over IPC carries no history
        if !self.window.is_zero() {
            let window = self.window;
            self.crashes_in_window = self
                .crash_starts
                .iter()
                .filter(|started_at| started_within(**started_at, window, now))
                .count();
        }
        self
    }
}

/// Runtime record of one supervised process
///
/// Owned by exactly one instance task; every mutation happens there.
#[derive(Debug)]
pub struct ProcessInstance {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restarts: usize,
    pub last_exit: Option<ExitDescriptor>,
    pub tracker: RestartTracker,
}

impl ProcessInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::Starting,
            pid: None,
            started_at: None,
            restarts: 0,
            last_exit: None,
            tracker: RestartTracker::new(),
        }
    }

    /// Move to `next`, logging transitions the state machine does not allow
    pub fn transition(&mut self, next: ProcessState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "Unexpected transition for '{}': {} -> {}",
                self.name, self.state, next
            );
        }
        debug!("'{}': {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    pub fn mark_running(&mut self, pid: u32, started_at: SystemTime) {
        self.pid = Some(pid);
        self.started_at = Some(started_at);
        self.transition(ProcessState::Running);
    }

    pub fn record_exit(&mut self, exit: ExitDescriptor) {
        self.pid = None;
        self.last_exit = Some(exit);
    }

    pub fn snapshot(&self, window: Duration, max_restarts: usize, now: SystemTime) -> ProcessInfo {
        ProcessInfo {
            name: self.name.clone(),
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            uptime: Duration::ZERO,
            restarts: self.restarts,
            crashes_in_window: self.tracker.count_within(window, now),
            max_restarts,
            last_exit: self.last_exit,
            cron_restart: None,
            next_cron_restart: None,
            crash_starts: self.tracker.start_times(),
            window,
        }
        .refreshed(now)
    }
}
