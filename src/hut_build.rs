use std::fs;
use std::path::{Path, PathBuf};

use hutfile::{ArtifactKind, Descriptor, Step, StepKind, ValidationError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::artifact::{Artifact, ArtifactId};
use crate::cancel::CancellationToken;
use crate::error::HutError;
use crate::store::ContentStore;
use crate::util::fs::{copy_tree, join_contained};
use crate::util::process::{self, CommandSpec, path_with_root};

/// Part of every build key; bump it when the key layout changes.
const BUILD_KEY_VERSION: u32 = 1;

/// Turns descriptors into content-addressed artifacts in a [`ContentStore`].
pub struct BuildPipeline<'a> {
    store: &'a ContentStore,
    context_dir: PathBuf,
    cancel: CancellationToken,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub artifact: Artifact,
    /// `true` when the artifact came from the store and no step ran.
    pub cached: bool,
    pub steps_executed: usize,
}

/// What a build would do, computed without running any step.
#[derive(Debug)]
pub enum BuildPlan {
    UpToDate(Artifact),
    Build(PendingBuild),
}

#[derive(Debug)]
pub struct PendingBuild {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    layer: String,
    parent: Option<Artifact>,
    copies: Vec<Option<CopySource>>,
}

impl BuildPlan {
    pub fn artifact_id(&self) -> &ArtifactId {
        match self {
            BuildPlan::UpToDate(artifact) => &artifact.id,
            BuildPlan::Build(pending) => &pending.id,
        }
    }
}

#[derive(Debug, Clone)]
struct CopySource {
    source: PathBuf,
    dest: String,
}

#[derive(Serialize)]
struct BuildKey<'a> {
    version: u32,
    kind: ArtifactKind,
    descriptor: &'a Descriptor,
    parent: Option<&'a ArtifactId>,
    inputs: &'a [InputDigest],
}

#[derive(Serialize)]
struct LayerKey<'a> {
    kind: ArtifactKind,
    steps: &'a [Step],
    inputs: &'a [InputDigest],
}

#[derive(Serialize)]
struct InputDigest {
    step: usize,
    files: Vec<(String, String)>,
}

impl<'a> BuildPipeline<'a> {
    /// `context_dir` is the directory `copy` sources are relative to, normally
    /// the directory holding the manifest.
    pub fn new(store: &'a ContentStore, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            context_dir: context_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between steps, and kill a running step, once `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(&self, descriptor: &Descriptor, kind: ArtifactKind) -> Result<BuildOutcome, HutError> {
        let plan = self.plan(descriptor, kind)?;
        self.apply(descriptor, plan)
    }

    /// Carry out a plan produced by [`BuildPipeline::plan`] for the same
    /// descriptor.
    pub fn apply(&self, descriptor: &Descriptor, plan: BuildPlan) -> Result<BuildOutcome, HutError> {
        match plan {
            BuildPlan::UpToDate(artifact) => {
                info!(
                    kind = %artifact.kind,
                    service = %descriptor.service_name,
                    id = artifact.id.short(),
                    "artifact up to date"
                );
                if artifact.kind == ArtifactKind::Stack {
                    self.store.tag(&descriptor.stack_ref, &artifact.id)?;
                }
                Ok(BuildOutcome {
                    artifact,
                    cached: true,
                    steps_executed: 0,
                })
            }
            BuildPlan::Build(pending) => self.execute(descriptor, pending),
        }
    }

    /// Resolve the parent stack, hash every input and check the build cache.
    pub fn plan(&self, descriptor: &Descriptor, kind: ArtifactKind) -> Result<BuildPlan, HutError> {
        let parent = match kind {
            ArtifactKind::Stack => None,
            ArtifactKind::Hut => {
                let parent = self
                    .store
                    .resolve_ref(&descriptor.stack_ref)?
                    .ok_or_else(|| HutError::MissingDependency {
                        stack_ref: descriptor.stack_ref.clone(),
                    })?;
                if parent.kind != ArtifactKind::Stack {
                    return Err(ValidationError::NotAStack {
                        stack_ref: descriptor.stack_ref.to_string(),
                    }
                    .into());
                }
                Some(parent)
            }
        };

        let copies = descriptor
            .build_steps
            .iter()
            .enumerate()
            .map(|(index, step)| match step.kind {
                StepKind::Copy => self.parse_copy(index, step).map(Some),
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut inputs = Vec::new();
        for (index, copy) in copies.iter().enumerate() {
            if let Some(copy) = copy {
                let files = digest_source(&copy.source)
                    .map_err(|err| step_error(index, &descriptor.build_steps[index], None, err.to_string()))?;
                inputs.push(InputDigest { step: index, files });
            }
        }

        let id = ArtifactId::digest(&canonical_json(&BuildKey {
            version: BUILD_KEY_VERSION,
            kind,
            descriptor,
            parent: parent.as_ref().map(|parent| &parent.id),
            inputs: &inputs,
        })?);

        if let Some(existing) = self.store.load(&id)? {
            return Ok(BuildPlan::UpToDate(existing));
        }

        let layer = ArtifactId::digest(&canonical_json(&LayerKey {
            kind,
            steps: &descriptor.build_steps,
            inputs: &inputs,
        })?)
        .to_string();

        Ok(BuildPlan::Build(PendingBuild {
            id,
            kind,
            layer,
            parent,
            copies,
        }))
    }

    fn execute(&self, descriptor: &Descriptor, pending: PendingBuild) -> Result<BuildOutcome, HutError> {
        let PendingBuild {
            id,
            kind,
            layer,
            parent,
            copies,
        } = pending;
        info!(
            kind = %kind,
            service = %descriptor.service_name,
            id = id.short(),
            steps = descriptor.build_steps.len(),
            "building artifact"
        );

        // Dropping `staging` on any early return discards the partial build.
        let staging = self.store.stage()?;
        let rootfs = staging.rootfs();

        let mut layers = Vec::new();
        if let Some(parent) = &parent {
            let parent_root = self.store.rootfs(&parent.id);
            copy_tree(&parent_root, &rootfs).map_err(|err| HutError::store(&parent_root, err))?;
            layers.extend(parent.layers.iter().cloned());
        }
        layers.push(layer);

        let installer = descriptor
            .installer
            .clone()
            .or_else(|| parent.as_ref().and_then(|parent| parent.installer.clone()));

        let mut steps_executed = 0;
        for (index, step) in descriptor.build_steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(index, "build cancelled; discarding staging");
                return Err(HutError::Cancelled);
            }
            debug!(index, kind = %step.kind, payload = %step.payload, "running build step");
            match step.kind {
                StepKind::Copy => {
                    let copy = copies[index].as_ref().ok_or_else(|| {
                        step_error(index, step, None, "copy source was not planned".into())
                    })?;
                    self.copy_step(index, step, copy, &rootfs)?;
                }
                StepKind::Exec => self.run_shell_step(index, step, &step.payload, &rootfs)?,
                StepKind::Install => {
                    let Some(installer) = installer.as_deref() else {
                        return Err(step_error(
                            index,
                            step,
                            None,
                            "no installer configured; declare `installer` in the stack manifest"
                                .into(),
                        ));
                    };
                    let script = format!("{installer} {}", step.payload);
                    self.run_shell_step(index, step, &script, &rootfs)?;
                }
            }
            steps_executed += 1;
        }

        let artifact = Artifact {
            id,
            kind,
            service_name: descriptor.service_name.clone(),
            stack_ref: descriptor.stack_ref.clone(),
            parent: parent.map(|parent| parent.id),
            layers,
            entrypoint: descriptor.run_entrypoint.clone(),
            resources: descriptor.resource_limits.clone(),
            installer,
            created_at: OffsetDateTime::now_utc(),
        };
        let artifact = self.store.publish(staging, artifact)?;
        if kind == ArtifactKind::Stack {
            self.store.tag(&descriptor.stack_ref, &artifact.id)?;
        }
        info!(id = artifact.id.short(), steps_executed, "published artifact");

        Ok(BuildOutcome {
            artifact,
            cached: false,
            steps_executed,
        })
    }

    fn parse_copy(&self, index: usize, step: &Step) -> Result<CopySource, HutError> {
        let mut parts = step.payload.split_whitespace();
        let (Some(src), dest, None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(step_error(index, step, None, "expected `SRC [DEST]`".into()));
        };
        let source = join_contained(&self.context_dir, src).ok_or_else(|| {
            step_error(
                index,
                step,
                None,
                format!("source `{src}` escapes the manifest directory"),
            )
        })?;
        if !source.exists() {
            return Err(step_error(
                index,
                step,
                None,
                format!("source `{}` does not exist", source.display()),
            ));
        }
        let dest = dest.unwrap_or(".").to_string();
        if join_contained(Path::new(""), &dest).is_none() {
            return Err(step_error(
                index,
                step,
                None,
                format!("destination `{dest}` escapes the artifact root"),
            ));
        }
        Ok(CopySource { source, dest })
    }

    fn copy_step(&self, index: usize, step: &Step, copy: &CopySource, rootfs: &Path) -> Result<(), HutError> {
        let fail = |message: String| step_error(index, step, None, message);
        let dest_dir = join_contained(rootfs, &copy.dest)
            .ok_or_else(|| fail(format!("destination `{}` escapes the artifact root", copy.dest)))?;
        if copy.source.is_dir() {
            copy_tree(&copy.source, &dest_dir).map_err(|err| fail(err.to_string()))?;
        } else {
            let file_name = copy
                .source
                .file_name()
                .ok_or_else(|| fail(format!("`{}` has no file name", copy.source.display())))?;
            fs::create_dir_all(&dest_dir).map_err(|err| fail(err.to_string()))?;
            fs::copy(&copy.source, dest_dir.join(file_name)).map_err(|err| fail(err.to_string()))?;
        }
        Ok(())
    }

    fn run_shell_step(&self, index: usize, step: &Step, script: &str, rootfs: &Path) -> Result<(), HutError> {
        let spec = CommandSpec::shell(script)
            .current_dir(rootfs)
            .env("HUT_ROOT", rootfs)
            .env("PATH", path_with_root(rootfs));
        debug!(command = %spec.display(), "spawning step command");
        let Some(output) =
            process::run(spec, &self.cancel).map_err(|err| step_error(index, step, None, err.to_string()))?
        else {
            info!(index, "build cancelled during step");
            return Err(HutError::Cancelled);
        };
        if output.status.success() {
            return Ok(());
        }
        Err(step_error(
            index,
            step,
            output.status.code(),
            output.combined(),
        ))
    }
}

fn step_error(index: usize, step: &Step, exit_code: Option<i32>, output: String) -> HutError {
    HutError::BuildStep {
        index,
        kind: step.kind,
        payload: step.payload.clone(),
        exit_code,
        output,
    }
}

fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, HutError> {
    serde_json::to_vec(value).map_err(|err| HutError::Config(format!("failed to encode build key: {err}")))
}

/// `(relative path, sha256)` for every file under `source`, in a stable order.
fn digest_source(source: &Path) -> std::io::Result<Vec<(String, String)>> {
    if source.is_file() {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![(name, file_digest(source)?)]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let digest = if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            format!("symlink:{}", target.to_string_lossy())
        } else {
            file_digest(entry.path())?
        };
        files.push((relative, digest));
    }
    Ok(files)
}

fn file_digest(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
