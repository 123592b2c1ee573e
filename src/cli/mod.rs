// CLI module - User-facing command-line interface

pub mod output;

use crate::daemon::{DaemonManager, PidFile};
use crate::error::{Result, WardenError};
use crate::ipc::{Command, IpcClient, ResponseData, DEFAULT_SOCKET_PATH};
use clap::{Parser, Subcommand};
use output::{create_progress_bar, finish_progress_error, print_info, print_success};
use std::path::PathBuf;
use std::time::Duration;

/// How long `daemon stop` waits for the daemon to exit
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Warden - supervise long-running processes
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the daemon's control socket
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Path to the daemon's PID file
    #[arg(long, global = true)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a stopped or failed process
    Start {
        /// Process name from the configuration
        name: String,
    },

    /// Stop a process (no-op if already stopped)
    Stop { name: String },

    /// Restart a process, clearing a failed state
    Restart { name: String },

    /// Show the state of one or all processes
    Status { name: Option<String> },

    /// Re-read the configuration file and apply the differences
    Reload,

    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommands {
    /// Check whether the daemon is running
    Status,
    /// Stop every process and shut the daemon down
    Stop,
}

impl Cli {
    /// Execute the parsed command against the daemon
    pub fn execute(&self) -> Result<()> {
        let client = IpcClient::with_socket_path(
            self.socket
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
        );

        match &self.command {
            Commands::Daemon {
                command: DaemonCommands::Status,
            } => self.daemon_status(&client),
            Commands::Daemon {
                command: DaemonCommands::Stop,
            } => self.daemon_stop(&client),
            command => {
                let (ipc_command, progress) = Self::to_ipc_command(command)?;
                let spinner = progress.map(create_progress_bar);
                match client.request(ipc_command) {
                    Ok(data) => {
                        if let Some(pb) = spinner {
                            pb.finish_and_clear();
                        }
                        print_success(&data);
                        Ok(())
                    }
                    Err(e) => {
                        if let Some(pb) = spinner {
                            pb.finish_and_clear();
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Map a subcommand to its request, plus a spinner message for slow ones
    fn to_ipc_command(command: &Commands) -> Result<(Command, Option<&'static str>)> {
        let mapped = match command {
            Commands::Start { name } => (Command::Start { name: name.clone() }, None),
            Commands::Stop { name } => (
                Command::Stop { name: name.clone() },
                Some("Stopping process..."),
            ),
            Commands::Restart { name } => (
                Command::Restart { name: name.clone() },
                Some("Restarting process..."),
            ),
            Commands::Status { name } => (Command::Status { name: name.clone() }, None),
            Commands::Reload => (Command::Reload, Some("Reloading configuration...")),
            Commands::Daemon { .. } => {
                return Err(WardenError::Internal(
                    "daemon commands are not forwarded".to_string(),
                ))
            }
        };
        Ok(mapped)
    }

    fn daemon_manager(&self) -> DaemonManager {
        match self.pid_file {
            Some(ref path) => DaemonManager::with_pid_file(PidFile::with_path(path)),
            None => DaemonManager::new(),
        }
    }

    fn daemon_status(&self, client: &IpcClient) -> Result<()> {
        match client.request(Command::DaemonStatus) {
            Ok(data) => {
                print_success(&data);
                Ok(())
            }
            Err(e @ (WardenError::DaemonNotRunning | WardenError::ConnectionError(_))) => {
                let status = self.daemon_manager().get_status();
                match status.pid {
                    Some(pid) => print_info(&format!(
                        "Daemon process {} is alive but not answering on {}",
                        pid,
                        client.socket_path().display()
                    )),
                    None => print_info("Daemon is not running"),
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn daemon_stop(&self, client: &IpcClient) -> Result<()> {
        let manager = self.daemon_manager();
        let pb = create_progress_bar("Stopping daemon...");

        let result = match client.request(Command::Shutdown) {
            Ok(ResponseData::ShuttingDown) => {
                if manager.wait_for_exit(DAEMON_STOP_TIMEOUT) {
                    Ok(())
                } else {
                    Err(WardenError::Internal(format!(
                        "daemon did not exit within {:?}",
                        DAEMON_STOP_TIMEOUT
                    )))
                }
            }
            Ok(other) => Err(WardenError::ProtocolError(format!(
                "unexpected response to shutdown: {:?}",
                other
            ))),
            // Socket gone but the PID is alive: fall back to SIGTERM
            Err(WardenError::DaemonNotRunning) if manager.is_running() => {
                manager.stop_daemon(DAEMON_STOP_TIMEOUT)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                pb.finish_and_clear();
                print_success(&ResponseData::ShuttingDown);
                Ok(())
            }
            Err(e) => {
                finish_progress_error(pb, "Failed to stop daemon");
                Err(e)
            }
        }
    }
}
