/// Shell command job: runs `sh -c <command>` with the execution's parameters
/// exported as environment variables, streaming stdout and stderr into the
/// console line by line.
use crate::job::{BuildResult, Job, JobContext};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

/// Time a process group gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("child {0} was not captured")]
    MissingPipe(&'static str),
    #[error("failed waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

pub struct ShellJob {
    name: String,
    command: String,
}

impl ShellJob {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<BuildResult, ShellError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(ctx.parameters.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, command = %self.command, "job process started");

        let stdout = child.stdout.take().ok_or(ShellError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ShellError::MissingPipe("stderr"))?;
        let lines = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let console = ctx.console.clone();
        let mut pump = tokio::spawn(async move {
            tokio::pin!(lines);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => console.println(line),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed reading job output");
                        break;
                    }
                }
            }
        });
        let mut guard = GroupGuard {
            group: group_of(pid),
            pump: Some(pump.abort_handle()),
        };

        let mut result = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(ShellError::Wait)?;
                tracing::info!(exit_code = ?status.code(), "job process exited");
                if status.success() {
                    BuildResult::Success
                } else {
                    ctx.console.println(format!("Process exited with {status}"));
                    BuildResult::Failure
                }
            }
            _ = ctx.interrupt.cancelled() => {
                terminate(&mut child, guard.group).await?;
                BuildResult::Aborted
            }
        };

        // Drain whatever output is still buffered. Background members of the
        // group hold the pipes open, so interruption still applies here.
        tokio::select! {
            biased;
            joined = &mut pump => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "output reader task failed");
                }
            }
            _ = ctx.interrupt.cancelled() => {
                match guard.group {
                    Some(group) => stop_group(group, &mut pump).await,
                    None => pump.abort(),
                }
                result = BuildResult::Aborted;
            }
        }

        guard.disarm();
        Ok(result)
    }
}

fn group_of(pid: u32) -> Option<Pid> {
    // Group 0 would be our own.
    (pid != 0).then(|| Pid::from_raw(pid as i32))
}

fn signal_group(group: Pid, signal: Signal) {
    if let Err(e) = killpg(group, signal) {
        tracing::debug!(%group, %signal, error = %e, "signalling process group failed");
    }
}

/// Kills the process group and stops the output reader when the job is
/// dropped before finishing, e.g. abandoned after the interrupt grace period.
struct GroupGuard {
    group: Option<Pid>,
    pump: Option<AbortHandle>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.group = None;
        self.pump = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            tracing::warn!(%group, "job dropped while running, killing its process group");
            signal_group(group, Signal::SIGKILL);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// SIGTERM the whole process group, escalating to SIGKILL after `TERM_GRACE`.
async fn terminate(child: &mut Child, group: Option<Pid>) -> Result<(), ShellError> {
    let Some(group) = group else {
        return child.kill().await.or_else(|_| Ok(()));
    };
    tracing::info!(%group, "sending SIGTERM to job process group");
    signal_group(group, Signal::SIGTERM);

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => {
            status.map_err(ShellError::Wait)?;
        }
        Err(_) => {
            tracing::warn!(%group, "job ignored SIGTERM, sending SIGKILL");
            signal_group(group, Signal::SIGKILL);
            child.wait().await.map_err(ShellError::Wait)?;
        }
    }
    Ok(())
}

/// Stop group members that outlived the direct child and still hold its
/// output open.
async fn stop_group(group: Pid, pump: &mut JoinHandle<()>) {
    tracing::info!(%group, "job output still open after interruption, stopping process group");
    signal_group(group, Signal::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, &mut *pump).await.is_err() {
        tracing::warn!(%group, "process group ignored SIGTERM, sending SIGKILL");
        signal_group(group, Signal::SIGKILL);
        pump.abort();
    }
}

#[async_trait]
impl Job for ShellJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, ctx: JobContext) -> BuildResult {
        match self.execute(&ctx).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job = %self.name, error = %e, "job failed to run");
                ctx.console.println(format!("ERROR: {e}"));
                BuildResult::Failure
            }
        }
    }
}
