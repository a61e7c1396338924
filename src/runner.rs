//! Execution of a single step.
//!
//! [`CommandRunner`] is the seam the engine drives. [`ShellRunner`] stages the
//! step in a temporary script, runs it as `<shell> -x <script>` in its own
//! process group and sends the combined stdout/stderr to the job's output log.
//! With `-x` the interpreter echoes each command before running it, so the
//! log shows what ran next to what it printed.

use std::fs::File;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the step process could not be started.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;
/// Exit code reported when a step is killed by its timeout.
pub const TIMED_OUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a step is killed by cancellation.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// How a step process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Exited,
    Signalled,
    SpawnFailed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// True iff the process exited with code 0.
    pub success: bool,
    pub exit_code: i32,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self {
                success: code == 0,
                exit_code: code,
                status: StepStatus::Exited,
            },
            (None, Some(signal)) => Self {
                success: false,
                exit_code: 128 + signal,
                status: StepStatus::Signalled,
            },
            (None, None) => Self::failed(SPAWN_FAILED_EXIT_CODE, StepStatus::SpawnFailed),
        }
    }

    pub fn failed(exit_code: i32, status: StepStatus) -> Self {
        Self {
            success: false,
            exit_code,
            status,
        }
    }
}

/// Everything a runner needs besides the command text.
pub struct StepContext<'a> {
    /// Output log the combined stdout/stderr is appended to.
    pub sink: File,
    pub working_dir: &'a Path,
    pub timeout: Option<Duration>,
    pub cancel: &'a CancellationToken,
}

#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Runs `command` to completion. Never fails: problems starting the
    /// process are reported as an unsuccessful outcome.
    async fn run(&self, command: &str, ctx: StepContext<'_>) -> StepOutcome;
}

/// Runs steps through a shell interpreter with tracing enabled.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("/bin/bash")
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn spawn(&self, script: &Path, ctx: StepContext<'_>) -> std::io::Result<Child> {
        let stderr = ctx.sink.try_clone()?;

        let mut command = std::process::Command::new(&self.shell);
        command
            .arg("-x")
            .arg(script)
            .current_dir(ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(ctx.sink))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        command.spawn()
    }
}

impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, ctx: StepContext<'_>) -> StepOutcome {
        // Removed when dropped, on every return path below.
        let script = match stage_script(command) {
            Ok(script) => script,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to stage step script");
                return StepOutcome::failed(SPAWN_FAILED_EXIT_CODE, StepStatus::SpawnFailed);
            }
        };

        let timeout = ctx.timeout;
        let cancel = ctx.cancel.clone();
        let mut child = match self.spawn(script.path(), ctx) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(shell = %self.shell, error = %e, "Failed to spawn step");
                return StepOutcome::failed(SPAWN_FAILED_EXIT_CODE, StepStatus::SpawnFailed);
            }
        };

        let expiry = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => StepOutcome::from_status(status),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for step");
                    StepOutcome::failed(SPAWN_FAILED_EXIT_CODE, StepStatus::SpawnFailed)
                }
            },
            _ = expiry => {
                tracing::warn!(?timeout, "Step timed out, killing process group");
                kill_group(&mut child).await;
                StepOutcome::failed(TIMED_OUT_EXIT_CODE, StepStatus::TimedOut)
            }
            _ = cancel.cancelled() => {
                tracing::warn!("Step cancelled, killing process group");
                kill_group(&mut child).await;
                StepOutcome::failed(CANCELLED_EXIT_CODE, StepStatus::Cancelled)
            }
        }
    }
}

fn stage_script(command: &str) -> std::io::Result<NamedTempFile> {
    let mut script = tempfile::Builder::new()
        .prefix("viki-")
        .suffix(".sh")
        .tempfile()?;
    writeln!(script, "{command}")?;
    script.flush()?;
    Ok(script)
}

/// Kills every process in the child's group, then reaps the child.
async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        // The child leads its own group (process_group(0)), so pgid == pid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Step already exited");
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Write;

    use super::{CommandRunner, StepContext, StepOutcome, StepStatus};

    /// Test double that records commands and returns preset exit codes.
    /// Steps without a preset code succeed.
    #[derive(Default)]
    pub struct MockRunner {
        codes: RefCell<VecDeque<i32>>,
        commands: RefCell<Vec<String>>,
        working_dirs: RefCell<Vec<std::path::PathBuf>>,
    }

    impl MockRunner {
        pub fn with_codes(codes: Vec<i32>) -> Self {
            Self {
                codes: RefCell::new(codes.into()),
                ..Default::default()
            }
        }

        pub fn executed_commands(&self) -> Vec<String> {
            self.commands.borrow().clone()
        }

        pub fn working_dirs(&self) -> Vec<std::path::PathBuf> {
            self.working_dirs.borrow().clone()
        }
    }

    impl CommandRunner for MockRunner {
        async fn run(&self, command: &str, mut ctx: StepContext<'_>) -> StepOutcome {
            self.commands.borrow_mut().push(command.to_string());
            self.working_dirs
                .borrow_mut()
                .push(ctx.working_dir.to_path_buf());
            let _ = writeln!(ctx.sink, "+ {command}");
            // Let other runs on the same task make progress.
            tokio::task::yield_now().await;

            let code = self.codes.borrow_mut().pop_front().unwrap_or(0);
            StepOutcome {
                success: code == 0,
                exit_code: code,
                status: StepStatus::Exited,
            }
        }
    }
}
