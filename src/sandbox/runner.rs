//! Timeout-bounded script execution.
//!
//! # Notes on stdout/stderr capture and timeouts
//!
//! Output is drained concurrently with the wait: a child that fills a pipe
//! would otherwise block forever and never exit. One deadline covers both
//! the wait and the drain, so a descendant that escaped into its own session
//! and still holds the pipes cannot stretch a run past its timeout.
//!
//! On Unix the interpreter is started as the leader of a new process group.
//! When the timeout fires the whole group receives SIGKILL, so subprocesses
//! the script spawned cannot keep the pipes open and stall the run. On Linux
//! the group is also killed after a normal exit: the leader's exit is
//! observed with `waitid(WNOWAIT)`, which leaves it a zombie, so its pid and
//! therefore the group id cannot be handed to another process before the
//! signal is sent. Other platforms skip that step and rely on the deadline.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace};

use super::ExecutionConfig;
use super::artifacts::{harvest_artifacts, purge_artifacts};
use super::shim::compose_script;
use crate::environment::SCRIPT_NAME;
use crate::error::ExecutionError;

/// Output of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, or the reason the run did not happen.
    pub stderr: String,
    /// Base64-encoded PNG images, oldest first.
    pub artifacts: Vec<String>,
    /// Interpreter exit code; `None` if it never ran to completion.
    pub exit_code: Option<i32>,
    /// Whether the run hit the wall-clock limit.
    pub timed_out: bool,
}

impl ExecutionResult {
    /// A result for a run that did not produce output.
    #[must_use]
    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Returns `true` if the interpreter exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs composed scripts with an interpreter inside a working directory.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    config: ExecutionConfig,
}

impl ScriptRunner {
    /// Creates a runner with the given configuration.
    #[must_use]
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Returns a reference to the execution configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Runs `code` with `interpreter` in `workdir`. Never fails.
    ///
    /// Stale artifacts are purged first and new ones harvested afterwards,
    /// whatever happened in between. A timeout yields empty stdout and
    /// `"Execution timed out."`; any other failure yields empty stdout and
    /// the error text.
    #[instrument(skip(self, code), fields(interpreter = %interpreter.display(), workdir = %workdir.display()))]
    pub async fn run(&self, interpreter: &Path, workdir: &Path, code: &str) -> ExecutionResult {
        purge_artifacts(workdir).await;

        let mut result = match self.execute(interpreter, workdir, code).await {
            Ok(result) => {
                info!("Execution completed");
                result
            }
            Err(e @ ExecutionError::Timeout { .. }) => {
                error!("Execution timed out");
                ExecutionResult {
                    timed_out: true,
                    ..ExecutionResult::failure(e.to_string())
                }
            }
            Err(e) => {
                error!(error = %e, "Execution failed");
                ExecutionResult::failure(e.to_string())
            }
        };

        result.artifacts = harvest_artifacts(workdir).await;
        result
    }

    async fn execute(
        &self,
        interpreter: &Path,
        workdir: &Path,
        code: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        let script_path = workdir.join(SCRIPT_NAME);
        tokio::fs::write(&script_path, compose_script(code))
            .await
            .map_err(|source| ExecutionError::ScriptWrite {
                path: script_path.clone(),
                source,
            })?;

        // The child changes directory before exec, so a relative program
        // path would resolve against the wrong place.
        let program = std::path::absolute(interpreter).unwrap_or_else(|_| interpreter.to_path_buf());

        let mut cmd = Command::new(&program);
        cmd.arg(SCRIPT_NAME)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .envs(&self.config.env_vars)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        trace!("Spawning interpreter");
        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let mut stdout_task = drain(child.stdout.take());
        let mut stderr_task = drain(child.stderr.take());
        let timed_out = || ExecutionError::Timeout {
            timeout_seconds: self.config.timeout.as_secs(),
        };

        let status = match tokio::time::timeout_at(deadline, wait_and_clear_group(&mut child)).await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                kill_process_group(pid);
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecutionError::Wait(e));
            }
            Err(_) => {
                debug!(elapsed_ms = %start.elapsed().as_millis(), "Run timed out, killing process group");
                kill_process_group(pid);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(timed_out());
            }
        };

        let drained = tokio::time::timeout_at(deadline, async {
            let stdout = (&mut stdout_task).await.unwrap_or_default();
            let stderr = (&mut stderr_task).await.unwrap_or_default();
            (stdout, stderr)
        })
        .await;
        let (stdout, stderr) = match drained {
            Ok(output) => output,
            Err(_) => {
                debug!("Interpreter exited but its output pipes stayed open past the deadline");
                stdout_task.abort();
                stderr_task.abort();
                return Err(timed_out());
            }
        };

        debug!(exit_code = ?status.code(), elapsed_ms = %start.elapsed().as_millis(), "Interpreter exited");
        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            artifacts: Vec::new(),
            exit_code: status.code(),
            timed_out: false,
        })
    }
}

fn drain<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Waits for the interpreter and, where the platform allows it safely,
/// kills the rest of its process group before reaping it.
async fn wait_and_clear_group(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(target_os = "linux")]
    {
        let pid = child.id();
        wait_for_exit_unreaped(pid).await?;
        kill_process_group(pid);
    }
    child.wait().await
}

/// Blocks until `pid` has exited without reaping it.
#[cfg(target_os = "linux")]
async fn wait_for_exit_unreaped(pid: Option<u32>) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{Id, WaitPidFlag, waitid};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return Ok(());
    };
    tokio::task::spawn_blocking(move || {
        loop {
            match waitid(
                Id::Pid(Pid::from_raw(pid)),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
            ) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
                Ok(_) => return Ok(()),
            }
        }
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // ESRCH just means nothing is left in the group.
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
