//! Execution backends: run a published artifact and stream its output.
//!
//! Both backends push [`LogLine`]s into a bounded channel; a single consumer
//! forwards them to the caller's [`LogSink`] and keeps the most recent lines
//! for [`RunResult::logs`].

pub mod cloud;
pub mod local;
mod logs;

use std::collections::BTreeMap;
use std::collections::vec_deque;
use std::fmt;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::artifact::{Artifact, ArtifactId};
use crate::cancel::CancellationToken;
use crate::error::HutError;
use crate::store::ContentStore;

pub use cloud::{CloudBackend, CloudProfile};
pub use local::LocalBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Cloud => f.write_str("cloud"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub artifact_id: ArtifactId,
    pub backend: BackendKind,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    Remote,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    pub timestamp: OffsetDateTime,
    pub stream: LogStream,
    pub line: String,
}

impl LogLine {
    pub fn now(stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            stream,
            line: line.into(),
        }
    }
}

/// Receives every log line as it is produced, in order.
pub trait LogSink: Send {
    fn line(&mut self, line: &LogLine);
}

impl<F> LogSink for F
where
    F: FnMut(&LogLine) + Send,
{
    fn line(&mut self, line: &LogLine) {
        self(line)
    }
}

/// Echoes service output to the terminal: stderr lines to stderr, the rest
/// to stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn line(&mut self, line: &LogLine) {
        let _ = match line.stream {
            LogStream::Stderr => writeln!(std::io::stderr().lock(), "{}", line.line),
            LogStream::Stdout | LogStream::Remote => {
                writeln!(std::io::stdout().lock(), "{}", line.line)
            }
        };
    }
}

/// Discards everything; the lines are still retained in [`RunResult::logs`].
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&mut self, _line: &LogLine) {}
}

/// The retained tail of a run's output. Consumed once.
#[derive(Debug)]
pub struct LogLines {
    inner: vec_deque::IntoIter<LogLine>,
}

impl LogLines {
    pub(crate) fn new(lines: std::collections::VecDeque<LogLine>) -> Self {
        Self {
            inner: lines.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Default::default())
    }
}

impl Iterator for LogLines {
    type Item = LogLine;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub logs: LogLines,
}

/// How a backend's producer side ended, before logs are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Termination {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

impl Termination {
    pub fn exited(code: i32) -> Self {
        Self {
            status: if code == 0 {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            exit_code: Some(code),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            exit_code: None,
        }
    }
}

pub enum Backend {
    Local(LocalBackend),
    Cloud(CloudBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Cloud(_) => BackendKind::Cloud,
        }
    }

    /// Execute `artifact` and block until it reaches a terminal status.
    pub fn run(
        &self,
        request: &RunRequest,
        artifact: &Artifact,
        store: &ContentStore,
        cancel: &CancellationToken,
        sink: &mut dyn LogSink,
    ) -> Result<RunResult, HutError> {
        let (termination, logs) = logs::collect(sink, |tx| match self {
            Backend::Local(local) => local.execute(request, artifact, store, cancel, tx),
            Backend::Cloud(cloud) => cloud.execute(request, artifact, store, cancel, tx),
        });
        let termination = termination?;
        Ok(RunResult {
            status: termination.status,
            exit_code: termination.exit_code,
            logs,
        })
    }
}
