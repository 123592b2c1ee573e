use crate::config::ProcessSpec;
use crate::process::types::CrashEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, SystemTime};

/// Ceiling for exponential restart delays
const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(60);

/// Outcome of evaluating an exit against the restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Relaunch the process
    Restart,
    /// Clean exit, leave the instance stopped
    Stop,
    /// Crash budget exhausted, mark the instance failed
    GiveUp,
}

/// Restart policy derived from a process spec
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Crashes tolerated inside the window
    pub max_restarts: usize,
    /// Rolling window for counting crashes
    pub window: Duration,
    /// Exit codes treated as a clean stop
    pub clean_exit_codes: BTreeSet<i32>,
    /// Base delay before a crash restart
    pub initial_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl RestartPolicy {
    pub fn from_spec(spec: &ProcessSpec) -> Self {
        Self {
            enabled: spec.autorestart,
            max_restarts: spec.max_restarts,
            window: spec.restart_window(),
            clean_exit_codes: spec.clean_exit_codes.clone(),
            initial_delay: spec.restart_delay(),
            backoff_strategy: spec.backoff,
        }
    }

    /// Decide what happens after an unsolicited exit
    ///
    /// A clean exit code stops the instance without touching the history.
    /// Anything else is recorded as a crash, the history is pruned to the
    /// window, and the instance gives up once the in-window count exceeds
    /// `max_restarts`.
    pub fn should_restart(
        &self,
        tracker: &mut RestartTracker,
        event: CrashEvent,
        now: SystemTime,
    ) -> Decision {
        if event.exit.is_clean(&self.clean_exit_codes) {
            return Decision::Stop;
        }

        tracker.record(event);
        tracker.prune(self.window, now);

        if !self.enabled {
            return Decision::GiveUp;
        }

        if tracker.count_within(self.window, now) <= self.max_restarts {
            Decision::Restart
        } else {
            Decision::GiveUp
        }
    }

    /// Delay before relaunching after the most recent crash
    pub fn restart_delay(&self, tracker: &RestartTracker, now: SystemTime) -> Duration {
        let attempt = tracker.count_within(self.window, now).saturating_sub(1);
        self.backoff_strategy
            .calculate_delay(self.initial_delay, attempt)
    }
}

/// Backoff strategy for crash restart delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every restart
    #[default]
    Fixed,
    /// Delay doubles with every crash in the window
    Exponential,
}

impl BackoffStrategy {
    /// Calculate the delay for a given restart attempt (0-based)
    pub fn calculate_delay(&self, initial_delay: Duration, attempt: usize) -> Duration {
        match self {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt.min(31) as u32);
                initial_delay
                    .checked_mul(factor)
                    .unwrap_or(MAX_BACKOFF_DELAY)
                    .min(MAX_BACKOFF_DELAY)
            }
        }
    }
}

/// Crash history of one instance, bounded to the restart window
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    events: VecDeque<CrashEvent>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: CrashEvent) {
        self.events.push_back(event);
    }

    /// Crashes of runs that started inside the trailing `window`
    pub fn count_within(&self, window: Duration, now: SystemTime) -> usize {
        self.events
            .iter()
            .filter(|event| started_within(event.started_at, window, now))
            .count()
    }

    /// Start times of the recorded crashed runs, oldest first
    pub fn start_times(&self) -> Vec<SystemTime> {
        self.events.iter().map(|event| event.started_at).collect()
    }

    /// Drop events that have aged out of the window
    pub fn prune(&mut self, window: Duration, now: SystemTime) {
        self.events
            .retain(|event| started_within(event.started_at, window, now));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Forget all crashes (an operator restarted the instance)
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Whether a run started at `started_at` still counts against the window
pub(crate) fn started_within(started_at: SystemTime, window: Duration, now: SystemTime) -> bool {
    match now.duration_since(started_at) {
        Ok(age) => age < window,
        // Start stamped after `now`: clock went backwards, keep counting it
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::ExitDescriptor;

    fn policy(max_restarts: usize) -> RestartPolicy {
        let mut spec = ProcessSpec::new("test", "/bin/false");
        spec.max_restarts = max_restarts;
        RestartPolicy::from_spec(&spec)
    }

    fn crash_at(exited_at: SystemTime, code: i32) -> CrashEvent {
        CrashEvent {
            started_at: exited_at - Duration::from_millis(10),
            exit: ExitDescriptor::code(code),
            exited_at,
        }
    }

    #[test]
    fn test_policy_from_spec() {
        let mut spec = ProcessSpec::new("api", "/bin/true");
        spec.max_restarts = 5;
        spec.restart_window_ms = 30_000;
        spec.restart_delay_ms = 250;
        spec.backoff = BackoffStrategy::Exponential;

        let policy = RestartPolicy::from_spec(&spec);
        assert!(policy.enabled);
        assert_eq!(policy.max_restarts, 5);
        assert_eq!(policy.window, Duration::from_secs(30));
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_gives_up_after_max_plus_one_crashes() {
        let policy = policy(3);
        let mut tracker = RestartTracker::new();
        let base = SystemTime::now();

        for i in 0..3 {
            let now = base + Duration::from_secs(i);
            assert_eq!(
                policy.should_restart(&mut tracker, crash_at(now, 1), now),
                Decision::Restart
            );
        }

        let now = base + Duration::from_secs(3);
        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(now, 1), now),
            Decision::GiveUp
        );
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn test_zero_max_restarts_gives_up_immediately() {
        let policy = policy(0);
        let mut tracker = RestartTracker::new();
        let now = SystemTime::now();
        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(now, 1), now),
            Decision::GiveUp
        );
    }

    #[test]
    fn test_clean_exit_stops_without_recording() {
        let policy = policy(0);
        let mut tracker = RestartTracker::new();
        let now = SystemTime::now();

        for _ in 0..5 {
            assert_eq!(
                policy.should_restart(&mut tracker, crash_at(now, 0), now),
                Decision::Stop
            );
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_signal_exit_is_never_clean() {
        let policy = policy(1);
        let mut tracker = RestartTracker::new();
        let now = SystemTime::now();
        let event = CrashEvent {
            started_at: now,
            exit: ExitDescriptor::signal(9),
            exited_at: now,
        };
        assert_eq!(policy.should_restart(&mut tracker, event, now), Decision::Restart);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_old_crashes_age_out_of_window() {
        let policy = policy(1);
        let mut tracker = RestartTracker::new();
        let base = SystemTime::now();

        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(base, 1), base),
            Decision::Restart
        );

        // Second crash after the 60s window: only one crash in window
        let later = base + Duration::from_secs(61);
        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(later, 1), later),
            Decision::Restart
        );
        assert_eq!(tracker.count_within(policy.window, later), 1);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_long_run_before_crash_is_outside_window() {
        let mut spec = ProcessSpec::new("longrun", "/bin/false");
        spec.max_restarts = 0;
        spec.restart_window_ms = 300;
        let policy = RestartPolicy::from_spec(&spec);
        let mut tracker = RestartTracker::new();

        let started_at = SystemTime::now();
        let now = started_at + Duration::from_millis(600);
        let event = CrashEvent {
            started_at,
            exit: ExitDescriptor::code(1),
            exited_at: now,
        };
        assert_eq!(policy.should_restart(&mut tracker, event, now), Decision::Restart);
        assert_eq!(tracker.count_within(policy.window, now), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_short_run_before_crash_counts() {
        let mut spec = ProcessSpec::new("shortrun", "/bin/false");
        spec.max_restarts = 0;
        spec.restart_window_ms = 300;
        let policy = RestartPolicy::from_spec(&spec);
        let mut tracker = RestartTracker::new();

        let started_at = SystemTime::now();
        let now = started_at + Duration::from_millis(100);
        let event = CrashEvent {
            started_at,
            exit: ExitDescriptor::code(1),
            exited_at: now,
        };
        assert_eq!(policy.should_restart(&mut tracker, event, now), Decision::GiveUp);
        assert_eq!(tracker.start_times(), vec![started_at]);
    }

    #[test]
    fn test_autorestart_disabled_gives_up() {
        let mut spec = ProcessSpec::new("oneshot", "/bin/false");
        spec.autorestart = false;
        let policy = RestartPolicy::from_spec(&spec);
        let mut tracker = RestartTracker::new();
        let now = SystemTime::now();

        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(now, 1), now),
            Decision::GiveUp
        );
        assert_eq!(
            policy.should_restart(&mut tracker, crash_at(now, 0), now),
            Decision::Stop
        );
    }

    #[test]
    fn test_backoff_fixed() {
        let strategy = BackoffStrategy::Fixed;
        let base = Duration::from_millis(500);
        assert_eq!(strategy.calculate_delay(base, 0), base);
        assert_eq!(strategy.calculate_delay(base, 10), base);
    }

    #[test]
    fn test_backoff_exponential() {
        let strategy = BackoffStrategy::Exponential;
        let base = Duration::from_secs(1);

        assert_eq!(strategy.calculate_delay(base, 0), Duration::from_secs(1));
        assert_eq!(strategy.calculate_delay(base, 1), Duration::from_secs(2));
        assert_eq!(strategy.calculate_delay(base, 3), Duration::from_secs(8));
        // 1 * 2^6 = 64, capped at 60
        assert_eq!(strategy.calculate_delay(base, 6), Duration::from_secs(60));
        assert_eq!(strategy.calculate_delay(base, 500), Duration::from_secs(60));
        assert_eq!(strategy.calculate_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn test_restart_delay_grows_with_crashes() {
        let mut spec = ProcessSpec::new("api", "/bin/false");
        spec.restart_delay_ms = 100;
        spec.backoff = BackoffStrategy::Exponential;
        let policy = RestartPolicy::from_spec(&spec);
        let mut tracker = RestartTracker::new();
        let now = SystemTime::now();

        policy.should_restart(&mut tracker, crash_at(now, 1), now);
        assert_eq!(policy.restart_delay(&tracker, now), Duration::from_millis(100));

        policy.should_restart(&mut tracker, crash_at(now, 1), now);
        assert_eq!(policy.restart_delay(&tracker, now), Duration::from_millis(200));
    }
}
