use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::{LogLine, LogStream, RunRequest, RunStatus, Termination};
use crate::artifact::Artifact;
use crate::cancel::CancellationToken;
use crate::error::HutError;
use crate::store::ContentStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for one remote execution service.
#[derive(Debug, Clone)]
pub struct CloudProfile {
    pub name: String,
    pub base_url: String,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further attempt.
    pub backoff: Duration,
}

impl CloudProfile {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitRunRequest<'a> {
    artifact_id: &'a str,
    env: &'a BTreeMap<String, String>,
    resources: SubmitResources,
}

#[derive(Debug, Serialize)]
struct SubmitResources {
    cpu: f64,
    memory: u32,
}

#[derive(Debug, Deserialize)]
struct SubmitRunResponse {
    run_id: String,
    poll_url: String,
}

#[derive(Debug, Deserialize)]
struct PollPage {
    #[serde(default)]
    events: Vec<RunEvent>,
    cursor: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RunEvent {
    Log {
        timestamp: Option<String>,
        log_line: String,
    },
    Terminal {
        status: RunStatus,
        exit_code: Option<i32>,
    },
}

/// Which failures a request may be repeated after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Connection errors and 5xx responses.
    Transient,
    /// Only failures where the request never reached the server.
    ConnectOnly,
}

/// The caller's timeout and cancellation, shared by every request of a run.
struct Budget<'a> {
    deadline: Option<Instant>,
    cancel: &'a CancellationToken,
}

impl<'a> Budget<'a> {
    fn start(timeout: Option<Duration>, cancel: &'a CancellationToken) -> Self {
        Self {
            deadline: timeout.map(|limit| Instant::now() + limit),
            cancel,
        }
    }

    fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn check(&self) -> Result<(), HutError> {
        if self.cancel.is_cancelled() || self.timed_out() {
            return Err(HutError::Cancelled);
        }
        Ok(())
    }

    /// `limit`, or less when the deadline is closer.
    fn cap(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
            None => limit,
        }
    }
}

/// Client for the remote run service: uploads artifacts it does not have,
/// submits runs and follows their event stream.
#[derive(Debug, Clone)]
pub struct CloudBackend {
    profile: CloudProfile,
    http: Client,
}

impl CloudBackend {
    pub fn new(profile: CloudProfile) -> Result<Self, HutError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| HutError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { profile, http })
    }

    pub fn profile(&self) -> &CloudProfile {
        &self.profile
    }

    pub(crate) fn execute(
        &self,
        request: &RunRequest,
        artifact: &Artifact,
        store: &ContentStore,
        cancel: &CancellationToken,
        tx: SyncSender<LogLine>,
    ) -> Result<Termination, HutError> {
        let budget = Budget::start(request.timeout, cancel);
        let submitted = self
            .ensure_uploaded(artifact, store, &budget)
            .and_then(|()| self.submit(request, artifact, &budget));
        let run = match submitted {
            Ok(run) => run,
            Err(HutError::Cancelled) => {
                self.log_stop(&budget, None);
                return Ok(Termination::cancelled());
            }
            Err(err) => return Err(err),
        };
        info!(
            profile = %self.profile.name,
            run_id = %run.run_id,
            id = artifact.id.short(),
            "submitted cloud run"
        );
        match self.follow(&run, &budget, &tx) {
            Err(HutError::Cancelled) => {
                self.log_stop(&budget, Some(&run.run_id));
                self.cancel_remote(&run.run_id);
                Ok(Termination::cancelled())
            }
            other => other,
        }
    }

    fn log_stop(&self, budget: &Budget<'_>, run_id: Option<&str>) {
        if budget.timed_out() {
            warn!(profile = %self.profile.name, ?run_id, "cloud run timed out");
        } else {
            info!(profile = %self.profile.name, ?run_id, "cloud run cancelled");
        }
    }

    fn ensure_uploaded(
        &self,
        artifact: &Artifact,
        store: &ContentStore,
        budget: &Budget<'_>,
    ) -> Result<(), HutError> {
        let url = self.url(&format!("/v1/artifacts/{}", artifact.id));
        let response = self.send_with_retry(&url, budget, Retry::Transient, || self.http.head(&url))?;
        match response.status() {
            status if status.is_success() => {
                debug!(id = artifact.id.short(), "artifact already present remotely");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => return Err(rejected(status, response)),
        }

        let bundle_dir = store.artifact_dir(&artifact.id);
        let bundle = bundle_artifact(&bundle_dir).map_err(|err| HutError::store(&bundle_dir, err))?;
        info!(id = artifact.id.short(), bytes = bundle.len(), "uploading artifact");
        let response = self.send_with_retry(&url, budget, Retry::Transient, || {
            self.http
                .put(&url)
                .header(CONTENT_TYPE, "application/zip")
                .body(bundle.clone())
        })?;
        if !response.status().is_success() {
            return Err(rejected(response.status(), response));
        }
        Ok(())
    }

    fn submit(
        &self,
        request: &RunRequest,
        artifact: &Artifact,
        budget: &Budget<'_>,
    ) -> Result<SubmitRunResponse, HutError> {
        let url = self.url("/v1/runs");
        let body = SubmitRunRequest {
            artifact_id: artifact.id.as_str(),
            env: &request.env,
            resources: SubmitResources {
                cpu: artifact.resources.cpu,
                memory: artifact.resources.memory_mb,
            },
        };
        // A retried submission after a server error could start the run twice.
        let response = self.send_with_retry(&url, budget, Retry::ConnectOnly, || {
            self.http.post(&url).json(&body)
        })?;
        if !response.status().is_success() {
            return Err(rejected(response.status(), response));
        }
        response
            .json::<SubmitRunResponse>()
            .map_err(|err| HutError::Protocol(format!("invalid submit response: {err}")))
    }

    fn follow(
        &self,
        run: &SubmitRunResponse,
        budget: &Budget<'_>,
        tx: &SyncSender<LogLine>,
    ) -> Result<Termination, HutError> {
        let poll_url = self.url(&run.poll_url);
        let mut cursor = 0u64;
        loop {
            budget.check()?;
            let response = self.send_with_retry(&poll_url, budget, Retry::Transient, || {
                self.http.get(&poll_url).query(&[("cursor", cursor)])
            })?;
            if !response.status().is_success() {
                return Err(rejected(response.status(), response));
            }
            let page: PollPage = response
                .json()
                .map_err(|err| HutError::Protocol(format!("invalid poll response: {err}")))?;
            cursor = page.cursor;

            for event in page.events {
                match event {
                    RunEvent::Log {
                        timestamp,
                        log_line,
                    } => {
                        let timestamp = timestamp
                            .and_then(|raw| OffsetDateTime::parse(&raw, &Rfc3339).ok())
                            .unwrap_or_else(OffsetDateTime::now_utc);
                        let _ = tx.send(LogLine {
                            timestamp,
                            stream: LogStream::Remote,
                            line: log_line,
                        });
                    }
                    RunEvent::Terminal { status, exit_code } => {
                        info!(run_id = %run.run_id, %status, ?exit_code, "cloud run finished");
                        return Ok(Termination { status, exit_code });
                    }
                }
            }

            thread::sleep(budget.cap(self.profile.poll_interval));
        }
    }

    fn cancel_remote(&self, run_id: &str) {
        let url = self.url(&format!("/v1/runs/{run_id}/cancel"));
        match self.authorized(self.http.post(&url)).timeout(CANCEL_TIMEOUT).send() {
            Ok(response) if response.status().is_success() => {
                debug!(run_id, "remote run cancelled");
            }
            Ok(response) => warn!(run_id, status = %response.status(), "remote cancel rejected"),
            Err(err) => warn!(run_id, error = %err, "remote cancel failed"),
        }
    }

    /// Send the request built by `build`, retrying the failures `retry` allows
    /// with exponential backoff. Every attempt is bounded by what is left of
    /// `budget`; running out of it yields [`HutError::Cancelled`].
    fn send_with_retry(
        &self,
        endpoint: &str,
        budget: &Budget<'_>,
        retry: Retry,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, HutError> {
        let attempts = self.profile.max_attempts.max(1);
        let mut delay = self.profile.backoff;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            budget.check()?;
            let retryable = match self
                .authorized(build())
                .timeout(budget.cap(REQUEST_TIMEOUT))
                .send()
            {
                Ok(response) if response.status().is_server_error() => {
                    last_error = format!("server responded with {}", response.status());
                    retry == Retry::Transient
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_error = err.to_string();
                    retry == Retry::Transient || err.is_connect()
                }
            };
            if !retryable {
                budget.check()?;
                return Err(HutError::BackendUnavailable {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    message: last_error,
                });
            }
            if attempt < attempts {
                warn!(endpoint, attempt, error = %last_error, "request failed; retrying");
                thread::sleep(budget.cap(delay));
                delay *= 2;
            }
        }
        budget.check()?;
        Err(HutError::BackendUnavailable {
            endpoint: endpoint.to_string(),
            attempts,
            message: last_error,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.profile.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.profile.base_url, path.trim_start_matches('/'))
    }
}

fn rejected(status: StatusCode, response: Response) -> HutError {
    let body = response.text().unwrap_or_default();
    HutError::RunFailure {
        code: i32::from(status.as_u16()),
        message: if body.is_empty() {
            format!("cloud backend rejected the request with {status}")
        } else {
            format!("cloud backend rejected the request with {status}: {body}")
        },
    }
}

/// Zip `artifact.json` and `rootfs/**` from a published artifact directory.
pub fn bundle_artifact(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let name = entry
            .path()
            .strip_prefix(dir)
            .map_err(std::io::Error::other)?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let file_type = entry.file_type();
        if file_type.is_dir() {
            writer.add_directory(name, options).map_err(std::io::Error::other)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            writer
                .add_symlink(name, target.to_string_lossy(), options)
                .map_err(std::io::Error::other)?;
        } else {
            writer
                .start_file(name, options.unix_permissions(file_mode(entry.path())?))
                .map_err(std::io::Error::other)?;
            writer.write_all(&fs::read(entry.path())?)?;
        }
    }
    Ok(writer.finish().map_err(std::io::Error::other)?.into_inner())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> std::io::Result<u32> {
    Ok(0o644)
}
