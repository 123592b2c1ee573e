use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::spawner::ProcessHandle;
use crate::process::types::ExitDescriptor;
use nix::sys::signal::Signal;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// How a stopped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited within the kill timeout
    Graceful(ExitDescriptor),
    /// Killed with SIGKILL after the timeout elapsed
    Forced(ExitDescriptor),
}

impl ExitOutcome {
    pub fn exit(&self) -> ExitDescriptor {
        match self {
            ExitOutcome::Graceful(exit) | ExitOutcome::Forced(exit) => *exit,
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, ExitOutcome::Forced(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    ExpectedExit,
    UnexpectedExit,
}

/// Classify the result of a deliberate stop
///
/// A graceful exit is expected when it ends with a clean code or by the
/// signal we sent. Forced kills and unclean codes are unexpected.
pub fn classify(outcome: &ExitOutcome, clean_exit_codes: &BTreeSet<i32>) -> ExitClass {
    match outcome {
        ExitOutcome::Forced(_) => ExitClass::UnexpectedExit,
        ExitOutcome::Graceful(exit) if exit.is_clean(clean_exit_codes) => ExitClass::ExpectedExit,
        ExitOutcome::Graceful(exit) if exit.code.is_none() && exit.signal.is_some() => {
            ExitClass::ExpectedExit
        }
        ExitOutcome::Graceful(_) => ExitClass::UnexpectedExit,
    }
}

/// Stop a child: stop signal, wait up to `kill_timeout`, then SIGKILL
///
/// A child that already exited is reported as `Graceful` without sending
/// anything. With `tree_kill` the whole process group is signalled and
/// any group members outliving the leader are swept afterwards.
pub async fn stop(handle: &mut ProcessHandle, spec: &ProcessSpec) -> Result<ExitOutcome> {
    let name = handle.name().to_string();
    let pid = handle.pid();

    if let Some(exit) = handle.try_wait()? {
        debug!("'{}' (pid {}) already exited with {}", name, pid, exit);
        sweep(handle, spec);
        return Ok(ExitOutcome::Graceful(exit));
    }

    let stop_signal = spec.stop_signal()?;
    let timeout = spec.kill_timeout();

    info!(
        "Stopping '{}' (pid {}) with {}, kill timeout {:?}",
        name, pid, stop_signal, timeout
    );

    match handle.signal(stop_signal) {
        Ok(()) => {}
        // Exited between try_wait and the signal
        Err(WardenError::NotRunning(_)) => {
            let exit = handle.wait().await?;
            sweep(handle, spec);
            return Ok(ExitOutcome::Graceful(exit));
        }
        Err(e) => return Err(WardenError::StopError(name, e.to_string())),
    }

    match tokio::time::timeout(timeout, handle.wait()).await {
        Ok(exit) => {
            let exit = exit?;
            debug!("'{}' (pid {}) exited with {}", name, pid, exit);
            sweep(handle, spec);
            Ok(ExitOutcome::Graceful(exit))
        }
        Err(_) => {
            warn!(
                "'{}' (pid {}) did not exit within {:?}, sending SIGKILL",
                name, pid, timeout
            );
            match handle.signal(Signal::SIGKILL) {
                Ok(()) | Err(WardenError::NotRunning(_)) => {}
                Err(e) => return Err(WardenError::StopError(name, e.to_string())),
            }
            let exit = handle.wait().await?;
            sweep(handle, spec);
            Ok(ExitOutcome::Forced(exit))
        }
    }
}

fn sweep(handle: &ProcessHandle, spec: &ProcessSpec) {
    if !spec.tree_kill {
        return;
    }
    if let Err(e) = handle.kill_group() {
        warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::spawner::launch;
    use std::time::{Duration, Instant};

    fn shell_spec(name: &str, script: &str, kill_timeout_ms: u64) -> ProcessSpec {
        let mut spec = ProcessSpec::new(name, script);
        spec.shell = true;
        spec.kill_timeout_ms = kill_timeout_ms;
        spec
    }

    #[tokio::test]
    async fn test_prompt_exit_is_graceful() {
        let spec = shell_spec("sleeper", "exec sleep 30", 2_000);
        let mut handle = launch(&spec).unwrap();

        let outcome = stop(&mut handle, &spec).await.unwrap();
        assert_eq!(
            outcome,
            ExitOutcome::Graceful(ExitDescriptor::signal(Signal::SIGTERM as i32))
        );
        assert!(!outcome.is_forced());
        assert_eq!(
            classify(&outcome, &spec.clean_exit_codes),
            ExitClass::ExpectedExit
        );
    }

    #[tokio::test]
    async fn test_ignored_signal_is_forced() {
        let spec = shell_spec("stubborn", "trap '' TERM; while true; do sleep 1; done", 300);
        let mut handle = launch(&spec).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcome = stop(&mut handle, &spec).await.unwrap();

        assert!(outcome.is_forced());
        assert_eq!(outcome.exit(), ExitDescriptor::signal(Signal::SIGKILL as i32));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(
            classify(&outcome, &spec.clean_exit_codes),
            ExitClass::UnexpectedExit
        );
    }

    #[tokio::test]
    async fn test_handled_signal_exit_code() {
        let spec = shell_spec("trapper", "trap 'exit 0' TERM; while true; do sleep 0.1; done", 2_000);
        let mut handle = launch(&spec).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = stop(&mut handle, &spec).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Graceful(ExitDescriptor::code(0)));
    }

    #[tokio::test]
    async fn test_stop_already_exited() {
        let spec = ProcessSpec::new("quick", "/bin/true");
        let mut handle = launch(&spec).unwrap();
        handle.wait().await.unwrap();

        let outcome = stop(&mut handle, &spec).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Graceful(ExitDescriptor::code(0)));
    }

    #[tokio::test]
    async fn test_custom_stop_signal() {
        let mut spec = shell_spec("interrupted", "exec sleep 30", 2_000);
        spec.stop_signal = "SIGINT".to_string();
        let mut handle = launch(&spec).unwrap();

        let outcome = stop(&mut handle, &spec).await.unwrap();
        assert_eq!(
            outcome.exit(),
            ExitDescriptor::signal(Signal::SIGINT as i32)
        );
    }

    #[test]
    fn test_classify_unclean_code() {
        let clean = BTreeSet::from([0, 2]);
        assert_eq!(
            classify(&ExitOutcome::Graceful(ExitDescriptor::code(2)), &clean),
            ExitClass::ExpectedExit
        );
        assert_eq!(
            classify(&ExitOutcome::Graceful(ExitDescriptor::code(1)), &clean),
            ExitClass::UnexpectedExit
        );
    }
}
