use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::types::ExitDescriptor;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::Stdio;
use std::time::SystemTime;
use tokio::process::{Child, Command};
use tracing::debug;

/// A live child process launched from a [`ProcessSpec`]
///
/// The child leads its own process group so a stop can reach every
/// descendant. Dropping the handle kills the leader.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    name: String,
    tree_kill: bool,
    started_at: SystemTime,
    exit: Option<ExitDescriptor>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Exit status, once the child has been reaped
    pub fn exit(&self) -> Option<ExitDescriptor> {
        self.exit
    }

    /// Deliver `sig` to the child, or to its whole group with `tree_kill`
    ///
    /// Fails with `NotRunning` once the child has been reaped.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Err(WardenError::NotRunning(self.name.clone()));
        }

        let pid = Pid::from_raw(self.pid as i32);
        let result = if self.tree_kill {
            signal::killpg(pid, sig)
        } else {
            signal::kill(pid, sig)
        };

        match result {
            Ok(()) => {
                debug!("Sent {} to '{}' (pid {})", sig, self.name, self.pid);
                Ok(())
            }
            Err(Errno::ESRCH) => Err(WardenError::NotRunning(self.name.clone())),
            Err(e) => Err(WardenError::SignalError(format!(
                "failed to send {} to '{}' (pid {}): {}",
                sig, self.name, self.pid, e
            ))),
        }
    }

    /// SIGKILL whatever is left of the process group
    ///
    /// Used after the leader has exited to sweep orphaned descendants.
    /// An already empty group is not an error.
    pub fn kill_group(&self) -> Result<()> {
        match signal::killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                debug!("Swept process group {} of '{}'", self.pid, self.name);
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(WardenError::SignalError(format!(
                "failed to kill process group {} of '{}': {}",
                self.pid, self.name, e
            ))),
        }
    }

    /// Wait for the child to exit
    ///
    /// Cancel safe; calling it again after the exit returns the cached status.
    pub async fn wait(&mut self) -> Result<ExitDescriptor> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = ExitDescriptor::from(status);
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitDescriptor>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let exit = self.child.try_wait()?.map(ExitDescriptor::from);
        self.exit = exit;
        Ok(exit)
    }
}

/// Launch the process described by `spec`
///
/// Spawn failures (missing executable, bad working directory, unwritable
/// output file) are reported as `SpawnError`.
pub fn launch(spec: &ProcessSpec) -> Result<ProcessHandle> {
    let mut command = if spec.shell {
        let mut line = spec.command.clone();
        for arg in &spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(line);
        command
    } else {
        let mut command = Command::new(&spec.command);
        command.args(&spec.args);
        command
    };

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }
    command.envs(&spec.env);

    command.stdin(Stdio::null());
    command.stdout(output_stream(&spec.name, spec.out_file.as_deref())?);
    command.stderr(output_stream(&spec.name, spec.error_file.as_deref())?);

    command.process_group(0);
    command.kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        WardenError::SpawnError(format!("failed to spawn '{}': {}", spec.name, e))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| WardenError::SpawnError(format!("no pid for '{}'", spec.name)))?;

    debug!("Launched '{}' with pid {}", spec.name, pid);

    Ok(ProcessHandle {
        child,
        pid,
        name: spec.name.clone(),
        tree_kill: spec.tree_kill,
        started_at: SystemTime::now(),
        exit: None,
    })
}

fn output_stream(name: &str, path: Option<&Path>) -> Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::inherit());
    };
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            WardenError::SpawnError(format!(
                "cannot open output file {} for '{}': {}",
                path.display(),
                name,
                e
            ))
        })?;
    Ok(Stdio::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_launch_simple_process() {
        let spec = ProcessSpec::new("echo", "/bin/echo");
        let mut handle = launch(&spec).unwrap();

        assert_eq!(handle.name(), "echo");
        assert!(handle.pid() > 0);
        assert_eq!(handle.wait().await.unwrap(), ExitDescriptor::code(0));
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let mut spec = ProcessSpec::new("exit3", "/bin/sh");
        spec.args = vec!["-c".to_string(), "exit 3".to_string()];

        let mut handle = launch(&spec).unwrap();
        assert_eq!(handle.wait().await.unwrap(), ExitDescriptor::code(3));
        // Cached after the first wait
        assert_eq!(handle.wait().await.unwrap(), ExitDescriptor::code(3));
        assert_eq!(handle.try_wait().unwrap(), Some(ExitDescriptor::code(3)));
    }

    #[tokio::test]
    async fn test_shell_mode_joins_args() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("out.log");

        let mut spec = ProcessSpec::new("shell", "echo");
        spec.shell = true;
        spec.args = vec!["$GREETING".to_string(), "world".to_string()];
        spec.env.insert("GREETING".to_string(), "hello".to_string());
        spec.out_file = Some(out.clone());

        let mut handle = launch(&spec).unwrap();
        assert_eq!(handle.wait().await.unwrap(), ExitDescriptor::code(0));
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn test_output_files_are_appended() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("out.log");
        let err = temp_dir.path().join("err.log");

        let mut spec = ProcessSpec::new("writer", "echo out; echo err >&2");
        spec.shell = true;
        spec.out_file = Some(out.clone());
        spec.error_file = Some(err.clone());

        for _ in 0..2 {
            let mut handle = launch(&spec).unwrap();
            handle.wait().await.unwrap();
        }

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "out\nout\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "err\nerr\n");
    }

    #[tokio::test]
    async fn test_launch_with_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("pwd.log");

        let mut spec = ProcessSpec::new("pwd", "/bin/pwd");
        spec.cwd = Some(temp_dir.path().to_path_buf());
        spec.out_file = Some(out.clone());

        let mut handle = launch(&spec).unwrap();
        handle.wait().await.unwrap();

        let printed = PathBuf::from(std::fs::read_to_string(&out).unwrap().trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            temp_dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_launch_missing_executable() {
        let spec = ProcessSpec::new("ghost", "/nonexistent/binary");
        match launch(&spec) {
            Err(WardenError::SpawnError(msg)) => assert!(msg.contains("ghost")),
            other => panic!("Expected SpawnError, got {:?}", other.map(|h| h.pid())),
        }
    }

    #[tokio::test]
    async fn test_launch_invalid_working_directory() {
        let mut spec = ProcessSpec::new("nowhere", "/bin/true");
        spec.cwd = Some(PathBuf::from("/nonexistent/directory"));
        assert!(matches!(launch(&spec), Err(WardenError::SpawnError(_))));
    }

    #[tokio::test]
    async fn test_signal_terminates_child() {
        let mut spec = ProcessSpec::new("sleeper", "/bin/sleep");
        spec.args = vec!["30".to_string()];

        let mut handle = launch(&spec).unwrap();
        handle.signal(Signal::SIGTERM).unwrap();

        let exit = handle.wait().await.unwrap();
        assert_eq!(exit, ExitDescriptor::signal(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_not_running() {
        let spec = ProcessSpec::new("quick", "/bin/true");
        let mut handle = launch(&spec).unwrap();
        handle.wait().await.unwrap();

        assert!(matches!(
            handle.signal(Signal::SIGTERM),
            Err(WardenError::NotRunning(_))
        ));
        // Empty group is fine
        handle.kill_group().unwrap();
    }
}
