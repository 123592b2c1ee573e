use crate::config::ProcessSpec;
use crate::cron::CronSchedule;
use crate::error::Result;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on a single sleep so wall-clock jumps are noticed
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A scheduled restart request emitted by a cron task
#[derive(Debug, Clone)]
pub struct CronTrigger {
    pub name: String,
    pub fired_at: DateTime<Local>,
}

/// Owns one timer task per cron-scheduled process
///
/// Every task feeds the same trigger channel; the receiving side decides
/// what a trigger means for the named process.
pub struct CronScheduler {
    tasks: HashMap<String, (CronSchedule, JoinHandle<()>)>,
    trigger_tx: mpsc::UnboundedSender<CronTrigger>,
}

impl CronScheduler {
    pub fn new(trigger_tx: mpsc::UnboundedSender<CronTrigger>) -> Self {
        Self {
            tasks: HashMap::new(),
            trigger_tx,
        }
    }

    /// Start the timer task for `spec` if it carries a `cron_restart`
    ///
    /// Any task previously registered under the same name is replaced.
    /// Returns the parsed schedule, or `None` when the spec has no cron.
    pub fn schedule(&mut self, spec: &ProcessSpec) -> Result<Option<CronSchedule>> {
        self.unschedule(&spec.name);

        let Some(schedule) = spec.cron_schedule()? else {
            return Ok(None);
        };

        info!(
            "Scheduling cron restart for '{}' ({})",
            spec.name,
            schedule.expression()
        );

        let handle = tokio::spawn(run_timer(
            spec.name.clone(),
            schedule.clone(),
            self.trigger_tx.clone(),
        ));
        self.tasks
            .insert(spec.name.clone(), (schedule.clone(), handle));

        Ok(Some(schedule))
    }

    /// Stop the timer task for `name`, if any
    pub fn unschedule(&mut self, name: &str) {
        if let Some((_, handle)) = self.tasks.remove(name) {
            debug!("Cancelling cron task for '{}'", name);
            handle.abort();
        }
    }

    pub fn unschedule_all(&mut self) {
        for (name, (_, handle)) in self.tasks.drain() {
            debug!("Cancelling cron task for '{}'", name);
            handle.abort();
        }
    }

    /// Next fire time for `name` as seen from now
    pub fn next_fire(&self, name: &str) -> Option<DateTime<Local>> {
        self.tasks
            .get(name)
            .and_then(|(schedule, _)| schedule.next_after(&Local::now()))
    }

}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.unschedule_all();
    }
}

async fn run_timer(
    name: String,
    schedule: CronSchedule,
    trigger_tx: mpsc::UnboundedSender<CronTrigger>,
) {
    let mut last_fired: Option<DateTime<Local>> = None;

    loop {
        let now = Local::now();
        let from = match last_fired {
            Some(last) if last > now => last,
            _ => now,
        };

        let Some(next) = schedule.next_after(&from) else {
            warn!(
                "Cron expression '{}' for '{}' has no upcoming fire time",
                schedule.expression(),
                name
            );
            return;
        };

        debug!("Next cron restart for '{}' at {}", name, next);
        sleep_until(next).await;

        let trigger = CronTrigger {
            name: name.clone(),
            fired_at: next,
        };
        if trigger_tx.send(trigger).is_err() {
            debug!("Trigger channel closed, cron task for '{}' exiting", name);
            return;
        }
        last_fired = Some(next);
    }
}

async fn sleep_until(target: DateTime<Local>) {
    loop {
        let now = Local::now();
        if now >= target {
            return;
        }
        let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(remaining.min(MAX_SLEEP)).await;
    }
}
