//! Drives one command invocation through its lifecycle and records every
//! phase it passes through.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hutfile::{ArtifactKind, DEFAULT_MANIFEST, Descriptor};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::artifact::Artifact;
use crate::backend::{Backend, LogSink, RunRequest, RunResult, RunStatus};
use crate::cancel::CancellationToken;
use crate::error::HutError;
use crate::hut_build::{BuildPipeline, BuildPlan};
use crate::registry::Registry;
use crate::store::ContentStore;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_UNKNOWN_COMMAND: i32 = 127;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalState {
    Success,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Building,
    Running,
    Terminal(TerminalState),
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Pending, Phase::Building | Phase::Running | Phase::Terminal(_)) => true,
            (Phase::Building, Phase::Running | Phase::Terminal(_)) => true,
            (Phase::Running, Phase::Terminal(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => f.write_str("pending"),
            Phase::Building => f.write_str("building"),
            Phase::Running => f.write_str("running"),
            Phase::Terminal(TerminalState::Success) => f.write_str("success"),
            Phase::Terminal(TerminalState::Failed) => f.write_str("failed"),
            Phase::Terminal(TerminalState::Cancelled) => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub phase: Phase,
    pub at: OffsetDateTime,
}

/// Inspectable record of a single invocation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub command: String,
    transitions: Vec<Transition>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            transitions: vec![Transition {
                phase: Phase::Pending,
                at: OffsetDateTime::now_utc(),
            }],
        }
    }

    pub fn phase(&self) -> Phase {
        self.transitions
            .last()
            .map(|transition| transition.phase)
            .unwrap_or(Phase::Pending)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.transitions.iter().map(|transition| transition.phase).collect()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        let current = self.phase();
        debug_assert!(
            current.can_advance_to(phase),
            "illegal transition {current} -> {phase}"
        );
        info!(command = %self.command, from = %current, to = %phase, "invocation phase");
        self.transitions.push(Transition {
            phase,
            at: OffsetDateTime::now_utc(),
        });
    }
}

/// Per-invocation arguments shared by every registered command.
#[derive(Clone, Debug)]
pub struct InvocationArgs {
    pub manifest: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Cloud profile override; ignored by local commands.
    pub profile: Option<String>,
}

impl Default for InvocationArgs {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            env: BTreeMap::new(),
            timeout: None,
            profile: None,
        }
    }
}

impl InvocationArgs {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            manifest: manifest.into(),
            ..Self::default()
        }
    }

    /// Directory `copy` sources are resolved against.
    pub fn context_dir(&self) -> PathBuf {
        match self.manifest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// What a successful command produced.
#[derive(Debug)]
pub enum Outcome {
    Built(Artifact),
    Ran(RunResult),
}

/// Everything a command may touch while it executes.
pub struct Context<'a> {
    pub store: &'a ContentStore,
    pub cancel: &'a CancellationToken,
    pub sink: &'a mut dyn LogSink,
}

#[derive(Debug)]
pub struct Report {
    pub invocation: Invocation,
    pub result: Result<Outcome, HutError>,
}

impl Report {
    pub fn terminal(&self) -> TerminalState {
        terminal_state(&self.result)
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.result, self.terminal()) {
            (Err(HutError::UnknownCommand { .. }), _) => EXIT_UNKNOWN_COMMAND,
            (_, TerminalState::Success) => EXIT_SUCCESS,
            (_, TerminalState::Failed) => EXIT_FAILED,
            (_, TerminalState::Cancelled) => EXIT_CANCELLED,
        }
    }
}

fn terminal_state(result: &Result<Outcome, HutError>) -> TerminalState {
    match result {
        Ok(Outcome::Built(_)) => TerminalState::Success,
        Ok(Outcome::Ran(run)) => match run.status {
            RunStatus::Success => TerminalState::Success,
            RunStatus::Failed => TerminalState::Failed,
            RunStatus::Cancelled => TerminalState::Cancelled,
        },
        Err(HutError::Cancelled) => TerminalState::Cancelled,
        Err(_) => TerminalState::Failed,
    }
}

/// Looks commands up in a [`Registry`] and runs them against one store.
pub struct Orchestrator<'a> {
    registry: &'a Registry,
    store: &'a ContentStore,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(registry: &'a Registry, store: &'a ContentStore, cancel: CancellationToken) -> Self {
        Self {
            registry,
            store,
            cancel,
        }
    }

    pub fn invoke(&self, name: &str, args: &InvocationArgs, sink: &mut dyn LogSink) -> Report {
        let mut invocation = Invocation::new(name);
        let result = self.registry.lookup(name).and_then(|command| {
            let mut ctx = Context {
                store: self.store,
                cancel: &self.cancel,
                sink,
            };
            command.execute(&mut ctx, args, &mut invocation)
        });
        invocation.enter(Phase::Terminal(terminal_state(&result)));
        Report { invocation, result }
    }
}

/// Parse the manifest at `args.manifest` and work out whether its artifact
/// already exists.
pub fn plan_build(
    store: &ContentStore,
    args: &InvocationArgs,
    kind: ArtifactKind,
) -> Result<(Descriptor, BuildPlan), HutError> {
    let descriptor = Descriptor::parse_file(&args.manifest, kind)?;
    let plan = BuildPipeline::new(store, args.context_dir()).plan(&descriptor, kind)?;
    debug!(
        manifest = %args.manifest.display(),
        id = plan.artifact_id().short(),
        cached = matches!(plan, BuildPlan::UpToDate(_)),
        "planned build"
    );
    Ok((descriptor, plan))
}

/// Build (or fetch from the cache) the artifact a build command asks for.
pub(crate) fn build_artifact(
    ctx: &mut Context<'_>,
    args: &InvocationArgs,
    kind: ArtifactKind,
    invocation: &mut Invocation,
) -> Result<Outcome, HutError> {
    let descriptor = Descriptor::parse_file(&args.manifest, kind)?;
    invocation.enter(Phase::Building);
    let outcome = BuildPipeline::new(ctx.store, args.context_dir())
        .cancel_on(ctx.cancel.clone())
        .build(&descriptor, kind)?;
    Ok(Outcome::Built(outcome.artifact))
}

/// Build the hut in `args.manifest` if it is not cached yet, then run it.
pub(crate) fn run_artifact(
    ctx: &mut Context<'_>,
    args: &InvocationArgs,
    backend: &Backend,
    invocation: &mut Invocation,
) -> Result<Outcome, HutError> {
    let (descriptor, plan) = plan_build(ctx.store, args, ArtifactKind::Hut)?;
    let artifact = match plan {
        BuildPlan::UpToDate(artifact) => artifact,
        plan @ BuildPlan::Build(_) => {
            invocation.enter(Phase::Building);
            BuildPipeline::new(ctx.store, args.context_dir())
                .cancel_on(ctx.cancel.clone())
                .apply(&descriptor, plan)?
                .artifact
        }
    };

    invocation.enter(Phase::Running);
    let request = RunRequest {
        artifact_id: artifact.id.clone(),
        backend: backend.kind(),
        env: args.env.clone(),
        timeout: args.timeout,
    };
    let result = backend.run(&request, &artifact, ctx.store, ctx.cancel, &mut *ctx.sink)?;
    Ok(Outcome::Ran(result))
}

pub fn manifest_or_default(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST))
}
