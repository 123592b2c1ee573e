// Supervisor module - Instance table, reload diffing and cron dispatch

mod instance;

pub use instance::{InstanceHandle, RestartReason};

use crate::config::{Config, ProcessSpec};
use crate::cron::{CronScheduler, CronTrigger};
use crate::error::{Result, WardenError};
use crate::process::ProcessInfo;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A spec that could not be applied, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFailure {
    pub name: String,
    pub error: String,
}

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Specs that failed validation; existing instances keep running
    pub rejected: Vec<SpecFailure>,
    /// Specs that were applied but whose launch failed
    pub failed: Vec<SpecFailure>,
}

struct Entry {
    spec: ProcessSpec,
    handle: InstanceHandle,
}

struct Inner {
    table: RwLock<HashMap<String, Entry>>,
    cron: Mutex<CronScheduler>,
    config_path: Option<PathBuf>,
}

/// Owns every supervised instance
///
/// Cheap to clone. Lock order is always instance table, then cron.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create an empty supervisor; must be called inside a tokio runtime
    ///
    /// `config_path` is the file re-read by [`Supervisor::reload`].
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            table: RwLock::new(HashMap::new()),
            cron: Mutex::new(CronScheduler::new(trigger_tx)),
            config_path,
        });
        tokio::spawn(dispatch_triggers(Arc::downgrade(&inner), trigger_rx));
        Self { inner }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.inner.config_path.as_deref()
    }

    /// Create an instance for `spec` and launch it
    ///
    /// A launch failure leaves the instance in the table as `Failed` and is
    /// returned to the caller.
    pub async fn deploy(&self, spec: ProcessSpec) -> Result<()> {
        let mut table = self.inner.table.write().await;
        if table.contains_key(&spec.name) {
            return Err(WardenError::InvalidConfig(format!(
                "process '{}' is already deployed",
                spec.name
            )));
        }
        self.deploy_locked(&mut table, spec).await
    }

    async fn deploy_locked(
        &self,
        table: &mut HashMap<String, Entry>,
        spec: ProcessSpec,
    ) -> Result<()> {
        spec.validate()?;

        info!("Deploying '{}'", spec.name);
        let (handle, ready) = InstanceHandle::spawn(spec.clone());
        self.inner.cron.lock().await.schedule(&spec)?;
        let name = spec.name.clone();
        table.insert(name.clone(), Entry { spec, handle });

        ready.await.map_err(|_| {
            WardenError::Internal(format!("instance task for '{}' exited early", name))
        })?
    }

    /// Apply a loaded configuration to the running set
    ///
    /// New names are deployed, missing names are undeployed, changed specs
    /// are swapped in and restarted, unchanged ones are left alone. Rejected
    /// specs never disturb an instance of the same name. The table stays
    /// write-locked for the whole diff.
    pub async fn apply(&self, config: &Config) -> ReloadSummary {
        let mut table = self.inner.table.write().await;
        let mut summary = ReloadSummary {
            rejected: config
                .rejected
                .iter()
                .map(|r| SpecFailure {
                    name: r.name.clone(),
                    error: r.error.to_string(),
                })
                .collect(),
            ..Default::default()
        };

        let keep: HashSet<&str> = config
            .specs
            .iter()
            .map(|s| s.name.as_str())
            .chain(config.rejected.iter().map(|r| r.name.as_str()))
            .collect();

        let mut removed: Vec<String> = table
            .keys()
            .filter(|name| !keep.contains(name.as_str()))
            .cloned()
            .collect();
        removed.sort();

        for name in removed {
            if let Some(entry) = table.remove(&name) {
                self.inner.cron.lock().await.unschedule(&name);
                info!("Undeploying '{}'", name);
                entry.handle.shutdown().await;
                summary.removed.push(name);
            }
        }

        for spec in &config.specs {
            let name = spec.name.clone();

            if !table.contains_key(&name) {
                if let Err(e) = self.deploy_locked(&mut table, spec.clone()).await {
                    summary.failed.push(SpecFailure {
                        name: name.clone(),
                        error: e.to_string(),
                    });
                }
                summary.added.push(name);
                continue;
            }

            let Some(entry) = table.get_mut(&name) else {
                continue;
            };
            if entry.spec == *spec {
                debug!("'{}' is unchanged", name);
                summary.unchanged.push(name);
                continue;
            }

            entry.spec = spec.clone();
            if let Err(e) = self.inner.cron.lock().await.schedule(spec) {
                warn!("Failed to reschedule cron for '{}': {}", name, e);
            }
            if let Err(e) = entry.handle.replace(spec.clone()).await {
                summary.failed.push(SpecFailure {
                    name: name.clone(),
                    error: e.to_string(),
                });
            }
            summary.changed.push(name);
        }

        info!(
            "Applied configuration: {} added, {} removed, {} changed, {} unchanged, {} rejected",
            summary.added.len(),
            summary.removed.len(),
            summary.changed.len(),
            summary.unchanged.len(),
            summary.rejected.len()
        );
        summary
    }

    /// Re-read the configuration file and apply it
    ///
    /// A file that fails to load changes nothing.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let path = self.inner.config_path.as_deref().ok_or_else(|| {
            WardenError::ConfigError("no configuration file to reload".to_string())
        })?;

        info!("Reloading configuration from {}", path.display());
        let config = Config::from_file(path).map_err(|e| {
            error!("Reload aborted, configuration unchanged: {}", e);
            e
        })?;
        Ok(self.apply(&config).await)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let table = self.inner.table.read().await;
        lookup(&table, name)?.handle.start().await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let table = self.inner.table.read().await;
        lookup(&table, name)?.handle.stop().await
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let table = self.inner.table.read().await;
        lookup(&table, name)?
            .handle
            .restart(RestartReason::Manual)
            .await
    }

    /// Status of one instance, or of all of them sorted by name
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<ProcessInfo>> {
        let table = self.inner.table.read().await;
        let cron = self.inner.cron.lock().await;

        let describe = |entry: &Entry| {
            let mut info = entry.handle.status();
            if !info.state.is_terminal() {
                info.next_cron_restart = cron.next_fire(&entry.spec.name).map(SystemTime::from);
            }
            info
        };

        match name {
            Some(name) => Ok(vec![describe(lookup(&table, name)?)]),
            None => {
                let mut infos: Vec<ProcessInfo> = table.values().map(describe).collect();
                infos.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(infos)
            }
        }
    }

    /// Stop and forget one instance
    pub async fn undeploy(&self, name: &str) -> Result<()> {
        let mut table = self.inner.table.write().await;
        let entry = table
            .remove(name)
            .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))?;
        self.inner.cron.lock().await.unschedule(name);
        info!("Undeploying '{}'", name);
        entry.handle.shutdown().await;
        Ok(())
    }

    /// Stop every instance concurrently and empty the table
    pub async fn shutdown(&self) {
        let mut table = self.inner.table.write().await;
        self.inner.cron.lock().await.unschedule_all();

        info!("Stopping {} process(es)", table.len());
        let mut stops = JoinSet::new();
        for (_, entry) in table.drain() {
            stops.spawn(entry.handle.shutdown());
        }
        while let Some(result) = stops.join_next().await {
            if let Err(e) = result {
                error!("Shutdown task failed: {}", e);
            }
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let table = self.inner.table.read().await;
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort();
        names
    }

}

fn lookup<'a>(table: &'a HashMap<String, Entry>, name: &str) -> Result<&'a Entry> {
    table
        .get(name)
        .ok_or_else(|| WardenError::ProcessNotFound(name.to_string()))
}

/// Route cron triggers to the named instance
///
/// Holds only a weak reference so dropping the last `Supervisor` ends it.
async fn dispatch_triggers(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<CronTrigger>) {
    while let Some(trigger) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let table = inner.table.read().await;
        match table.get(&trigger.name) {
            Some(entry) => {
                info!(
                    "Cron restart for '{}' fired at {}",
                    trigger.name, trigger.fired_at
                );
                entry.handle.trigger_cron();
            }
            None => debug!("Cron trigger for unknown process '{}'", trigger.name),
        }
    }
    debug!("Cron dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;

    fn sleeper(name: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new(name, "/bin/sleep");
        spec.args = vec!["30".to_string()];
        spec.kill_timeout_ms = 500;
        spec
    }

    #[tokio::test]
    async fn test_deploy_and_status() {
        let supervisor = Supervisor::new(None);
        supervisor.deploy(sleeper("b")).await.unwrap();
        supervisor.deploy(sleeper("a")).await.unwrap();

        let infos = supervisor.status(None).await.unwrap();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(infos.iter().all(|i| i.state == ProcessState::Running));

        supervisor.shutdown().await;
        assert!(supervisor.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_deploy_rejected() {
        let supervisor = Supervisor::new(None);
        supervisor.deploy(sleeper("api")).await.unwrap();
        let err = supervisor.deploy(sleeper("api")).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let supervisor = Supervisor::new(None);
        for result in [
            supervisor.start("nope").await,
            supervisor.stop("nope").await,
            supervisor.restart("nope").await,
            supervisor.status(Some("nope")).await.map(|_| ()),
        ] {
            assert!(matches!(result, Err(WardenError::ProcessNotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_cron_spec_reports_next_fire() {
        let supervisor = Supervisor::new(None);
        let mut spec = sleeper("hourly");
        spec.cron_restart = Some("0 * * * *".to_string());
        supervisor.deploy(spec).await.unwrap();

        let info = supervisor.status(Some("hourly")).await.unwrap().remove(0);
        assert_eq!(info.cron_restart.as_deref(), Some("0 * * * *"));
        assert!(info.next_cron_restart.unwrap() > SystemTime::now());

        supervisor.stop("hourly").await.unwrap();
        let info = supervisor.status(Some("hourly")).await.unwrap().remove(0);
        assert_eq!(info.next_cron_restart, None);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_undeploy_removes_instance() {
        let supervisor = Supervisor::new(None);
        supervisor.deploy(sleeper("a")).await.unwrap();
        supervisor.deploy(sleeper("b")).await.unwrap();
        supervisor.stop("b").await.unwrap();
        let states: Vec<ProcessState> = supervisor
            .status(None)
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.state)
            .collect();
        assert_eq!(states, vec![ProcessState::Running, ProcessState::Stopped]);

        supervisor.undeploy("a").await.unwrap();
        assert_eq!(supervisor.names().await, vec!["b".to_string()]);
        assert!(matches!(
            supervisor.undeploy("a").await,
            Err(WardenError::ProcessNotFound(_))
        ));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_without_config_path() {
        let supervisor = Supervisor::new(None);
        let err = supervisor.reload().await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
