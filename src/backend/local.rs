use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::logs::spawn_reader;
use super::{LogLine, LogStream, RunRequest, Termination};
use crate::artifact::Artifact;
use crate::cancel::CancellationToken;
use crate::error::HutError;
use crate::store::ContentStore;
use crate::util::process::{self, TERMINATE_GRACE, path_with_root, shell_program};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs artifacts as child processes of this machine, from their root
/// directory in the content store.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    poll_interval: Duration,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LocalBackend {
    pub(crate) fn execute(
        &self,
        request: &RunRequest,
        artifact: &Artifact,
        store: &ContentStore,
        cancel: &CancellationToken,
        tx: SyncSender<LogLine>,
    ) -> Result<Termination, HutError> {
        let rootfs = store.rootfs(&artifact.id);
        if !rootfs.is_dir() {
            return Err(HutError::store(
                &rootfs,
                std::io::Error::new(std::io::ErrorKind::NotFound, "artifact root is missing"),
            ));
        }
        debug!(
            cpu = artifact.resources.cpu,
            "cpu limit has no local mapping; running unconstrained"
        );

        let mut command = Command::new(shell_program());
        command
            .arg("-c")
            .arg(entry_script(artifact))
            .current_dir(&rootfs)
            .env("PATH", path_with_root(&rootfs))
            .envs(&request.env)
            .env("HUT_ARTIFACT_ID", artifact.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process::isolate(&mut command);

        info!(
            id = artifact.id.short(),
            entrypoint = %artifact.entrypoint,
            "starting local run"
        );
        let mut child = command.spawn().map_err(|err| HutError::RunFailure {
            code: 127,
            message: format!("failed to start `{}`: {err}", artifact.entrypoint),
        })?;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, LogStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, LogStream::Stderr, tx);
        }

        self.wait(&mut child, request.timeout, cancel)
    }

    fn wait(
        &self,
        child: &mut Child,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Termination, HutError> {
        let started = Instant::now();
        loop {
            let timed_out = timeout.is_some_and(|limit| started.elapsed() >= limit);
            if cancel.is_cancelled() || timed_out {
                if timed_out {
                    warn!(elapsed = ?started.elapsed(), "run timed out; stopping process group");
                } else {
                    info!("run cancelled; stopping process group");
                }
                return stop(child);
            }

            match child.try_wait() {
                // An exit racing a cancellation still counts as cancelled.
                Ok(Some(_)) if cancel.is_cancelled() => return stop(child),
                Ok(Some(status)) => {
                    let code = exit_code(status);
                    info!(code, "local run exited");
                    return Ok(Termination::exited(code));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(HutError::RunFailure {
                        code: 1,
                        message: format!("failed to poll child process: {err}"),
                    });
                }
            }

            thread::sleep(self.poll_interval);
        }
    }
}

fn stop(child: &mut Child) -> Result<Termination, HutError> {
    process::terminate(child, TERMINATE_GRACE).map_err(|err| HutError::RunFailure {
        code: 1,
        message: format!("failed to stop child process: {err}"),
    })?;
    Ok(Termination::cancelled())
}

#[cfg(unix)]
fn entry_script(artifact: &Artifact) -> String {
    let kib = u64::from(artifact.resources.memory_mb) * 1024;
    format!(
        "ulimit -v {kib} 2>/dev/null || true\n{}",
        artifact.entrypoint
    )
}

#[cfg(not(unix))]
fn entry_script(artifact: &Artifact) -> String {
    artifact.entrypoint.clone()
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
