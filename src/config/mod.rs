use crate::cron::CronSchedule;
use crate::daemon::pid::DEFAULT_PID_FILE;
use crate::error::{Result, WardenError};
use crate::ipc::DEFAULT_SOCKET_PATH;
use crate::process::restart::BackoffStrategy;
use nix::sys::signal::Signal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Declarative definition of one supervised process
///
/// Specs are immutable once loaded. A reload builds fresh specs and
/// compares them by value to decide which instances need a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Process name (unique key)
    pub name: String,

    /// Executable to run, or a full command line when `shell` is set
    pub command: String,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Run `command` through `/bin/sh -c`
    #[serde(default)]
    pub shell: bool,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variable overrides
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Restart on unclean exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Crash restarts allowed inside the rolling window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Uptime below which an exit is reported as an unstable start
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,

    /// Length of the rolling crash window
    #[serde(default = "default_restart_window")]
    pub restart_window_ms: u64,

    /// Base delay before a crash restart
    #[serde(default)]
    pub restart_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Optional 5-field cron expression for scheduled restarts
    #[serde(default)]
    pub cron_restart: Option<String>,

    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Time to wait after the stop signal before SIGKILL
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,

    /// Exit codes that count as a deliberate, clean stop
    #[serde(default = "default_clean_exit_codes")]
    pub clean_exit_codes: BTreeSet<i32>,

    /// Signal the whole process group instead of the leader only
    #[serde(default = "default_tree_kill")]
    pub tree_kill: bool,

    /// File receiving the child's stdout (appended)
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// File receiving the child's stderr (appended)
    #[serde(default)]
    pub error_file: Option<PathBuf>,
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> usize {
    10
}

fn default_min_uptime() -> u64 {
    1_000
}

fn default_restart_window() -> u64 {
    60_000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout() -> u64 {
    1_600
}

fn default_clean_exit_codes() -> BTreeSet<i32> {
    BTreeSet::from([0])
}

fn default_tree_kill() -> bool {
    true
}

impl ProcessSpec {
    /// Build a spec with every optional field at its default
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: BTreeMap::new(),
            autorestart: default_autorestart(),
            max_restarts: default_max_restarts(),
            min_uptime_ms: default_min_uptime(),
            restart_window_ms: default_restart_window(),
            restart_delay_ms: 0,
            backoff: BackoffStrategy::default(),
            cron_restart: None,
            stop_signal: default_stop_signal(),
            kill_timeout_ms: default_kill_timeout(),
            clean_exit_codes: default_clean_exit_codes(),
            tree_kill: default_tree_kill(),
            out_file: None,
            error_file: None,
        }
    }

    /// Validate the spec in isolation
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }

        if self.name.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(WardenError::ConfigValidationError(format!(
                "name '{}' must not contain whitespace or '/'",
                self.name
            )));
        }

        if self.command.trim().is_empty() {
            return Err(WardenError::MissingConfigField(format!(
                "{}.command",
                self.name
            )));
        }

        if self.restart_window_ms == 0 {
            return Err(WardenError::ConfigValidationError(format!(
                "{}: restart_window_ms must be positive",
                self.name
            )));
        }

        self.stop_signal()?;
        self.cron_schedule()?;

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(WardenError::ConfigValidationError(format!(
                    "{}: working directory does not exist: {}",
                    self.name,
                    cwd.display()
                )));
            }
        }

        Ok(())
    }

    /// Parsed stop signal
    pub fn stop_signal(&self) -> Result<Signal> {
        parse_signal(&self.stop_signal).map_err(|_| {
            WardenError::ConfigValidationError(format!(
                "{}: invalid stop_signal '{}'",
                self.name, self.stop_signal
            ))
        })
    }

    /// Parsed cron schedule, if one is configured
    pub fn cron_schedule(&self) -> Result<Option<CronSchedule>> {
        self.cron_restart
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Expand `$VAR` and `${VAR}` from the supervisor's environment
    fn expand_env_vars(&mut self) {
        self.command = expand_env_in_string(&self.command);
        self.args = self.args.iter().map(|a| expand_env_in_string(a)).collect();
        self.cwd = self.cwd.as_deref().map(expand_env_in_path);
        self.out_file = self.out_file.as_deref().map(expand_env_in_path);
        self.error_file = self.error_file.as_deref().map(expand_env_in_path);
        for value in self.env.values_mut() {
            *value = expand_env_in_string(value);
        }
    }
}

/// Accepts both `SIGTERM` and `TERM` spellings
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&canonical)
        .map_err(|e| WardenError::SignalError(format!("Invalid signal name '{}': {}", name, e)))
}

fn env_var_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
                .map_err(|e| warn!("Environment expansion disabled: {}", e))
                .ok()
        })
        .as_ref()
}

/// Values are left untouched when the pattern is unavailable
fn expand_env_in_string(s: &str) -> String {
    let Some(pattern) = env_var_pattern() else {
        return s.to_string();
    };
    pattern
        .replace_all(s, |caps: &regex::Captures| {
            let key = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(key).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

/// Daemon-level settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonSettings,
    #[serde(default)]
    processes: Vec<ProcessSpec>,
}

/// A spec that failed validation and was left out of the loaded set
#[derive(Debug)]
pub struct RejectedSpec {
    pub name: String,
    pub error: WardenError,
}

/// Result of loading a configuration file
#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    pub daemon: DaemonSettings,
    pub specs: Vec<ProcessSpec>,
    pub rejected: Vec<RejectedSpec>,
}

impl Config {
    /// Load and validate a configuration file (TOML or JSON)
    ///
    /// File-level problems are errors. A spec that fails its own validation
    /// is moved to `rejected` so the remaining specs still load.
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let file = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        let mut config = Self::from_parts(file.daemon, file.processes)?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    fn from_parts(daemon: DaemonSettings, processes: Vec<ProcessSpec>) -> Result<Config> {
        let mut seen = HashSet::new();
        for spec in &processes {
            if !seen.insert(spec.name.as_str()) {
                return Err(WardenError::InvalidConfig(format!(
                    "Duplicate process name: {}",
                    spec.name
                )));
            }
        }

        let mut specs = Vec::with_capacity(processes.len());
        let mut rejected = Vec::new();

        for mut spec in processes {
            spec.expand_env_vars();
            match spec.validate() {
                Ok(()) => specs.push(spec),
                Err(error) => {
                    warn!("Rejecting process '{}': {}", spec.name, error);
                    rejected.push(RejectedSpec {
                        name: spec.name,
                        error,
                    });
                }
            }
        }

        if specs.is_empty() && rejected.is_empty() {
            warn!("Configuration declares no processes");
        }

        Ok(Config {
            path: PathBuf::new(),
            daemon,
            specs,
            rejected,
        })
    }

    fn parse_toml(contents: &str) -> Result<ConfigFile> {
        toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<ConfigFile> {
        serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

}
