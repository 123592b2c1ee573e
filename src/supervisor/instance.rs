use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::shutdown::{self, classify, ExitClass};
use crate::process::spawner::{self, ProcessHandle};
use crate::process::{
    CrashEvent, Decision, ExitDescriptor, ProcessInfo, ProcessInstance, ProcessState,
    RestartPolicy,
};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 32;

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Manual,
    Cron,
    Reload,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::Manual => write!(f, "manual"),
            RestartReason::Cron => write!(f, "cron"),
            RestartReason::Reload => write!(f, "reload"),
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

enum InstanceCommand {
    Start(Reply),
    Stop(Reply),
    Restart {
        reason: RestartReason,
        reply: Option<Reply>,
    },
    Replace {
        spec: Box<ProcessSpec>,
        reply: Reply,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Client side of one instance task
///
/// Every lifecycle change for the instance goes through the mailbox, so
/// there is never more than one child per name.
pub struct InstanceHandle {
    name: String,
    tx: mpsc::Sender<InstanceCommand>,
    status: watch::Receiver<ProcessInfo>,
    task: JoinHandle<()>,
}

impl InstanceHandle {
    /// Spawn the instance task and launch the first child
    ///
    /// The returned receiver resolves with the outcome of that first launch.
    pub fn spawn(spec: ProcessSpec) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let instance = ProcessInstance::new(spec.name.clone());
        let policy = RestartPolicy::from_spec(&spec);
        let initial = instance.snapshot(policy.window, policy.max_restarts, SystemTime::now());
        let (status_tx, status_rx) = watch::channel(initial);

        let actor = InstanceActor {
            spec: spec.clone(),
            policy,
            instance,
            child: None,
            pending_restart: None,
            status_tx,
            rx,
        };
        let task = tokio::spawn(actor.run(ready_tx));

        let handle = Self {
            name: spec.name,
            tx,
            status: status_rx,
            task,
        };
        (handle, ready_rx)
    }

    /// Latest published status, with uptime computed now
    pub fn status(&self) -> ProcessInfo {
        self.status.borrow().clone().refreshed(SystemTime::now())
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessInfo> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.request(InstanceCommand::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(InstanceCommand::Stop).await
    }

    pub async fn restart(&self, reason: RestartReason) -> Result<()> {
        self.request(|reply| InstanceCommand::Restart {
            reason,
            reply: Some(reply),
        })
        .await
    }

    /// Install a changed spec, restarting the child unless it is stopped
    pub async fn replace(&self, spec: ProcessSpec) -> Result<()> {
        self.request(|reply| InstanceCommand::Replace {
            spec: Box::new(spec),
            reply,
        })
        .await
    }

    /// Queue a cron restart without waiting for it
    pub fn trigger_cron(&self) {
        let command = InstanceCommand::Restart {
            reason: RestartReason::Cron,
            reply: None,
        };
        if let Err(e) = self.tx.try_send(command) {
            warn!("Dropping cron restart for '{}': {}", self.name, e);
        }
    }

    /// Stop the child and end the instance task
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(InstanceCommand::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = self.task.await {
            error!("Instance task for '{}' ended abnormally: {}", self.name, e);
        }
    }

    async fn request<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(Reply) -> InstanceCommand,
    {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| self.gone())?;
        response.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> WardenError {
        WardenError::Internal(format!("instance task for '{}' has exited", self.name))
    }
}

enum Wakeup {
    Command(Option<InstanceCommand>),
    Exited(Result<ExitDescriptor>),
    RestartDue,
}

struct InstanceActor {
    spec: ProcessSpec,
    policy: RestartPolicy,
    instance: ProcessInstance,
    child: Option<ProcessHandle>,
    pending_restart: Option<Instant>,
    status_tx: watch::Sender<ProcessInfo>,
    rx: mpsc::Receiver<InstanceCommand>,
}

impl InstanceActor {
    async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let _ = ready.send(self.launch());

        loop {
            match self.next_wakeup().await {
                Wakeup::Exited(result) => self.on_exit(result),
                Wakeup::RestartDue => self.restart_due(),
                Wakeup::Command(Some(command)) => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Wakeup::Command(None) => {
                    // Every handle dropped without a shutdown
                    self.cancel_pending_restart();
                    let _ = self.stop_child(ProcessState::Stopped).await;
                    break;
                }
            }
        }

        debug!("Instance task for '{}' finished", self.spec.name);
    }

    async fn next_wakeup(&mut self) -> Wakeup {
        let deadline = self.pending_restart;
        tokio::select! {
            command = self.rx.recv() => Wakeup::Command(command),
            exit = wait_child(&mut self.child) => Wakeup::Exited(exit),
            _ = sleep_until(deadline) => Wakeup::RestartDue,
        }
    }

    /// Returns true when the task should end
    async fn handle_command(&mut self, command: InstanceCommand) -> bool {
        match command {
            InstanceCommand::Start(reply) => {
                let _ = reply.send(self.start());
            }
            InstanceCommand::Stop(reply) => {
                let _ = reply.send(self.stop().await);
            }
            InstanceCommand::Restart { reason, reply } => {
                let result = self.restart(reason).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            error!("{} restart of '{}' failed: {}", reason, self.spec.name, e);
                        }
                    }
                }
            }
            InstanceCommand::Replace { spec, reply } => {
                let _ = reply.send(self.replace(*spec).await);
            }
            InstanceCommand::Shutdown(reply) => {
                self.cancel_pending_restart();
                if let Err(e) = self.stop_child(ProcessState::Stopped).await {
                    error!("Failed to stop '{}' during shutdown: {}", self.spec.name, e);
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn start(&mut self) -> Result<()> {
        match self.instance.state {
            ProcessState::Running | ProcessState::Starting | ProcessState::Stopping => {
                debug!("'{}' is already {}", self.spec.name, self.instance.state);
                Ok(())
            }
            ProcessState::Restarting => {
                self.pending_restart = None;
                self.instance.restarts += 1;
                self.launch()
            }
            ProcessState::Stopped => self.launch(),
            ProcessState::Failed => {
                self.instance.tracker.clear();
                self.launch()
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if self.cancel_pending_restart() {
            info!("Cancelled pending restart of '{}'", self.spec.name);
            self.instance.transition(ProcessState::Stopped);
            self.publish();
            return Ok(());
        }
        if self.child.is_none() {
            debug!("'{}' is already {}", self.spec.name, self.instance.state);
            return Ok(());
        }
        self.stop_child(ProcessState::Stopped).await
    }

    async fn restart(&mut self, reason: RestartReason) -> Result<()> {
        match (reason, self.instance.state) {
            (RestartReason::Cron, state) if state.is_terminal() => {
                info!(
                    "Ignoring cron restart for '{}': instance is {}",
                    self.spec.name, state
                );
                return Ok(());
            }
            (_, ProcessState::Failed) => self.instance.tracker.clear(),
            _ => {}
        }

        info!("Restarting '{}' ({})", self.spec.name, reason);

        if self.cancel_pending_restart() {
            debug!("'{}' had a pending restart, launching now", self.spec.name);
        } else if self.child.is_some() {
            self.stop_child(ProcessState::Restarting).await?;
        }

        self.instance.restarts += 1;
        self.launch()
    }

    async fn replace(&mut self, spec: ProcessSpec) -> Result<()> {
        info!("Applying changed configuration for '{}'", spec.name);
        self.policy = RestartPolicy::from_spec(&spec);
        self.spec = spec;

        if self.instance.state == ProcessState::Stopped {
            self.publish();
            return Ok(());
        }
        self.restart(RestartReason::Reload).await
    }

    fn launch(&mut self) -> Result<()> {
        self.instance.transition(ProcessState::Starting);

        match spawner::launch(&self.spec) {
            Ok(child) => {
                info!("Started '{}' (pid {})", self.spec.name, child.pid());
                self.instance.mark_running(child.pid(), child.started_at());
                self.child = Some(child);
                self.publish();
                Ok(())
            }
            Err(e) => {
                error!("Failed to launch '{}': {}", self.spec.name, e);
                self.instance.transition(ProcessState::Failed);
                self.publish();
                Err(e)
            }
        }
    }

    fn on_exit(&mut self, result: Result<ExitDescriptor>) {
        let now = SystemTime::now();
        let child = self.child.take();
        let exit = result.unwrap_or_else(|e| {
            error!("Failed to collect exit status of '{}': {}", self.spec.name, e);
            ExitDescriptor::unknown()
        });
        let started_at = child.as_ref().map_or(now, ProcessHandle::started_at);

        if self.spec.tree_kill {
            if let Some(ref child) = child {
                if let Err(e) = child.kill_group() {
                    warn!("{}", e);
                }
            }
        }

        self.instance.record_exit(exit);
        self.instance.transition(ProcessState::Stopping);

        let uptime = now.duration_since(started_at).unwrap_or_default();
        if uptime < self.spec.min_uptime() {
            warn!(
                "'{}' exited after {:?}, under min_uptime of {:?} (unstable start)",
                self.spec.name,
                uptime,
                self.spec.min_uptime()
            );
        }

        let event = CrashEvent {
            started_at,
            exit,
            exited_at: now,
        };
        match self
            .policy
            .should_restart(&mut self.instance.tracker, event, now)
        {
            Decision::Stop => {
                info!("'{}' exited cleanly ({})", self.spec.name, exit);
                self.instance.transition(ProcessState::Stopped);
            }
            Decision::Restart => {
                let delay = self.policy.restart_delay(&self.instance.tracker, now);
                warn!(
                    "'{}' crashed with {} ({}/{} in window), restarting in {:?}",
                    self.spec.name,
                    exit,
                    self.instance.tracker.count_within(self.policy.window, now),
                    self.policy.max_restarts,
                    delay
                );
                self.instance.transition(ProcessState::Restarting);
                self.pending_restart = Some(Instant::now() + delay);
            }
            Decision::GiveUp => {
                error!(
                    "'{}' crashed with {}, giving up after {} crashes within {:?}",
                    self.spec.name,
                    exit,
                    self.instance.tracker.count_within(self.policy.window, now),
                    self.policy.window
                );
                self.instance.transition(ProcessState::Failed);
            }
        }
        self.publish();
    }

    fn restart_due(&mut self) {
        self.pending_restart = None;
        self.instance.restarts += 1;
        // A failed relaunch leaves the instance Failed
        let _ = self.launch();
    }

    fn cancel_pending_restart(&mut self) -> bool {
        self.pending_restart.take().is_some()
    }

    /// Stop the running child and move to `next` once it is gone
    async fn stop_child(&mut self, next: ProcessState) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.instance.transition(next);
            self.publish();
            return Ok(());
        };

        self.instance.transition(ProcessState::Stopping);
        self.publish();

        match shutdown::stop(&mut child, &self.spec).await {
            Ok(outcome) => {
                let exit = outcome.exit();
                match classify(&outcome, &self.spec.clean_exit_codes) {
                    ExitClass::ExpectedExit => {
                        info!("Stopped '{}' (pid {}): {}", self.spec.name, child.pid(), exit)
                    }
                    ExitClass::UnexpectedExit => warn!(
                        "Stopped '{}' (pid {}) with unexpected {}{}",
                        self.spec.name,
                        child.pid(),
                        exit,
                        if outcome.is_forced() { " after SIGKILL" } else { "" }
                    ),
                }
                self.instance.record_exit(exit);
                self.instance.transition(next);
                self.publish();
                Ok(())
            }
            Err(e) => {
                error!("Failed to stop '{}': {}", self.spec.name, e);
                self.child = Some(child);
                self.instance.transition(ProcessState::Running);
                self.publish();
                Err(e)
            }
        }
    }

    fn publish(&self) {
        let mut info = self.instance.snapshot(
            self.policy.window,
            self.policy.max_restarts,
            SystemTime::now(),
        );
        info.cron_restart = self.spec.cron_restart.clone();
        self.status_tx.send_replace(info);
    }
}

async fn wait_child(child: &mut Option<ProcessHandle>) -> Result<ExitDescriptor> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
