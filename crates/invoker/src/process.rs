//! Child-process execution.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use trigger::{
    CapturedOutput, CommandRunner, CommandSpec, InvocationId, InvocationOutcome, InvocationResult,
    LaunchError, OutputCapture,
};

use crate::capture::read_bounded;

/// How long to keep reading output after the child is gone. A grandchild that
/// inherited the pipes can hold them open indefinitely.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs [`CommandSpec`]s as child processes.
///
/// Every spawned child is waited on before `run` returns, including after a
/// timeout. If the `run` future itself is dropped (e.g. shutdown aborted the
/// worker), `kill_on_drop` terminates the child and tokio reaps it.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    drain_grace: Duration,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how long output is drained after the child exits.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    async fn run_inner(
        &self,
        id: InvocationId,
        spec: &CommandSpec,
    ) -> Result<InvocationResult, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .kill_on_drop(true)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let limit = match spec.capture {
            OutputCapture::Bounded { max_bytes } => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                Some(max_bytes)
            }
            OutputCapture::Disabled => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
        };

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_io(&spec.program, &e))?;
        info!(pid = child.id(), "command started");

        let stdin_task = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(bytes)) => Some(tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&bytes).await {
                    // The child may legitimately exit without reading stdin.
                    debug!(error = %e, "failed to write payload to stdin");
                }
            })),
            _ => None,
        };
        let stdout_task = limit.and_then(|max| {
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(read_bounded(out, max)))
        });
        let stderr_task = limit.and_then(|max| {
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(read_bounded(err, max)))
        });

        let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
        let outcome = match waited {
            Ok(Ok(status)) => outcome_from_status(status),
            Ok(Err(e)) => {
                if let Err(kill_err) = child.start_kill() {
                    debug!(error = %kill_err, "kill after wait failure");
                }
                if let Err(reap_err) = child.wait().await {
                    warn!(error = %reap_err, "failed to reap command after wait failure");
                }
                if let Some(task) = stdin_task {
                    task.abort();
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                return Err(LaunchError::Spawn {
                    program: spec.program.clone(),
                    message: format!("failed to wait for child: {e}"),
                });
            }
            Err(_) => {
                warn!(timeout = ?spec.timeout, "command timed out; killing");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out command");
                }
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "failed to reap timed-out command");
                }
                InvocationOutcome::TimedOut
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }
        let stdout = self.drain(stdout_task).await;
        let stderr = self.drain(stderr_task).await;

        Ok(InvocationResult {
            id,
            outcome,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }

    async fn drain(&self, task: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
        let Some(task) = task else {
            return CapturedOutput::default();
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(self.drain_grace, task).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "output reader failed");
                CapturedOutput::default()
            }
            Err(_) => {
                abort.abort();
                debug!("output pipe still open after child exit; giving up");
                CapturedOutput::new(Vec::new(), true)
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessInvoker {
    async fn run(&self, spec: &CommandSpec) -> Result<InvocationResult, LaunchError> {
        let id = InvocationId::new_random();
        let span = info_span!("invocation", invocation_id = %id, program = %spec.program);

        async {
            let result = self.run_inner(id, spec).await;
            match &result {
                Ok(r) if r.is_success() => {
                    info!(
                        duration_ms = r.duration.as_millis() as u64,
                        "command succeeded"
                    );
                }
                Ok(r) => {
                    warn!(
                        outcome = %r.outcome,
                        exit_code = ?r.outcome.exit_code(),
                        duration_ms = r.duration.as_millis() as u64,
                        stderr = %r.stderr.to_string_lossy(),
                        "command failed"
                    );
                }
                Err(e) => warn!(error = %e, "command could not be started"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

fn outcome_from_status(status: ExitStatus) -> InvocationOutcome {
    match status.code() {
        Some(code) => InvocationOutcome::Exited { code },
        None => InvocationOutcome::Signalled {
            signal: signal_of(status),
        },
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}
