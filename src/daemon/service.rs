// Daemon service - wires the supervisor to the IPC socket and to signals

use super::manager::DaemonManager;
use super::pid::PidFile;
use crate::config::Config;
use crate::error::Result;
use crate::ipc::{Command, IpcServer, ResponseData};
use crate::supervisor::{ReloadSummary, Supervisor};
use std::path::PathBuf;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Command-line overrides for the daemon
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub socket_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

/// State shared by every IPC request handler
#[derive(Clone)]
pub struct DaemonContext {
    supervisor: Supervisor,
    started_at: Instant,
    shutdown_tx: mpsc::Sender<()>,
}

impl DaemonContext {
    pub fn new(supervisor: Supervisor, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self {
            supervisor,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Execute one client command
    pub async fn handle_command(&self, command: Command) -> Result<ResponseData> {
        let supervisor = &self.supervisor;
        match command {
            Command::Start { name } => {
                supervisor.start(&name).await?;
                Ok(ResponseData::Started { name })
            }
            Command::Stop { name } => {
                supervisor.stop(&name).await?;
                Ok(ResponseData::Stopped { name })
            }
            Command::Restart { name } => {
                supervisor.restart(&name).await?;
                Ok(ResponseData::Restarted { name })
            }
            Command::Status { name } => Ok(ResponseData::Status {
                processes: supervisor.status(name.as_deref()).await?,
            }),
            Command::Reload => Ok(ResponseData::Reloaded {
                summary: supervisor.reload().await?,
            }),
            Command::DaemonStatus => Ok(ResponseData::DaemonStatus {
                pid: std::process::id(),
                uptime: self.started_at.elapsed(),
                processes: supervisor.names().await.len(),
                config_path: supervisor.config_path().map(PathBuf::from),
            }),
            Command::Shutdown => {
                info!("Shutdown requested by client");
                // A full channel means a shutdown is already pending
                let _ = self.shutdown_tx.try_send(());
                Ok(ResponseData::ShuttingDown)
            }
        }
    }
}

/// The foreground supervisor daemon
pub struct Daemon {
    config: Config,
    socket_path: PathBuf,
    pid_file: PathBuf,
}

impl Daemon {
    /// Load the configuration; a file-level error is fatal
    pub fn new(options: DaemonOptions) -> Result<Self> {
        let config = Config::from_file(&options.config_path)?;
        let socket_path = options
            .socket_path
            .unwrap_or_else(|| config.daemon.socket_path.clone());
        let pid_file = options
            .pid_file
            .unwrap_or_else(|| config.daemon.pid_file.clone());

        Ok(Self {
            config,
            socket_path,
            pid_file,
        })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// Run until SIGTERM, SIGINT or a client shutdown request
    ///
    /// SIGHUP reloads the configuration file.
    pub async fn run(self) -> Result<()> {
        let daemon_manager = DaemonManager::with_pid_file(PidFile::with_path(&self.pid_file));
        daemon_manager.register_daemon()?;

        let result = self.serve().await;

        if let Err(e) = daemon_manager.unregister_daemon() {
            warn!("{}", e);
        }
        result
    }

    async fn serve(self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut ipc_server = IpcServer::with_socket_path(&self.socket_path);
        ipc_server.start()?;
        info!("Listening on {}", self.socket_path.display());

        let supervisor = Supervisor::new(Some(self.config.path.clone()));
        log_summary(&supervisor.apply(&self.config).await);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let context = DaemonContext::new(supervisor.clone(), shutdown_tx);

        let server_task = tokio::spawn(async move {
            let result = ipc_server
                .run(move |command| {
                    let context = context.clone();
                    async move { context.handle_command(command).await }
                })
                .await;
            if let Err(e) = result {
                error!("IPC server error: {}", e);
            }
        });

        info!("Daemon started (pid {})", std::process::id());

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    match supervisor.reload().await {
                        Ok(summary) => log_summary(&summary),
                        Err(e) => error!("Reload failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Dropping the server task removes the socket
        server_task.abort();
        let _ = server_task.await;

        supervisor.shutdown().await;
        info!("Daemon stopped");
        Ok(())
    }
}

fn log_summary(summary: &ReloadSummary) {
    for rejected in &summary.rejected {
        warn!("Rejected '{}': {}", rejected.name, rejected.error);
    }
    for failed in &summary.failed {
        error!("'{}' failed to launch: {}", failed.name, failed.error);
    }
}
