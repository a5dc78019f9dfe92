use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use hutfile::StackRef;
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::artifact::{Artifact, ArtifactId};
use crate::error::HutError;

const ARTIFACTS_DIR: &str = "artifacts";
const REFS_DIR: &str = "refs";
const TMP_DIR: &str = "tmp";
const METADATA_FILE: &str = "artifact.json";
const ROOTFS_DIR: &str = "rootfs";

/// Local content store keyed by artifact id.
///
/// Layout:
/// ```text
/// <root>/artifacts/<id>/artifact.json
/// <root>/artifacts/<id>/rootfs/...
/// <root>/refs/<name>@<version>      (contains a stack artifact id)
/// <root>/tmp/                       (staging, same filesystem as artifacts/)
/// ```
///
/// Artifacts are built under `tmp/` and become visible with a single
/// `rename`, so a reader either sees a complete artifact or nothing.
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

/// Scratch directory for one build; removed on drop unless published.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.path().join(ROOTFS_DIR)
    }
}

impl ContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, HutError> {
        let root = root.into();
        for dir in [ARTIFACTS_DIR, REFS_DIR, TMP_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|err| HutError::store(&path, err))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(ARTIFACTS_DIR).join(id.as_str())
    }

    pub fn rootfs(&self, id: &ArtifactId) -> PathBuf {
        self.artifact_dir(id).join(ROOTFS_DIR)
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.artifact_dir(id).join(METADATA_FILE).is_file()
    }

    pub fn load(&self, id: &ArtifactId) -> Result<Option<Artifact>, HutError> {
        let path = self.artifact_dir(id).join(METADATA_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HutError::store(&path, err)),
        };
        let artifact = serde_json::from_slice(&raw)
            .map_err(|err| HutError::store(&path, io::Error::new(io::ErrorKind::InvalidData, err)))?;
        Ok(Some(artifact))
    }

    /// Create a fresh staging directory with an empty `rootfs/`.
    pub fn stage(&self) -> Result<Staging, HutError> {
        let tmp = self.root.join(TMP_DIR);
        let dir = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&tmp)
            .map_err(|err| HutError::store(&tmp, err))?;
        let rootfs = dir.path().join(ROOTFS_DIR);
        fs::create_dir_all(&rootfs).map_err(|err| HutError::store(&rootfs, err))?;
        Ok(Staging { dir })
    }

    /// Atomically publish a fully built staging directory under `artifact.id`.
    ///
    /// If an identical artifact was published concurrently, the existing one is
    /// returned and the staging copy is discarded.
    pub fn publish(&self, staging: Staging, artifact: Artifact) -> Result<Artifact, HutError> {
        let metadata = staging.path().join(METADATA_FILE);
        let encoded = serde_json::to_vec_pretty(&artifact)
            .map_err(|err| HutError::store(&metadata, io::Error::other(err)))?;
        fs::write(&metadata, encoded).map_err(|err| HutError::store(&metadata, err))?;

        let target = self.artifact_dir(&artifact.id);
        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                debug!(id = %artifact.id, "published artifact");
                Ok(artifact)
            }
            Err(err) if self.contains(&artifact.id) => {
                debug!(id = %artifact.id, error = %err, "artifact already published; reusing it");
                self.load(&artifact.id)?
                    .ok_or_else(|| HutError::store(&target, err))
            }
            Err(err) => Err(HutError::store(&target, err)),
        }
    }

    /// Point `stack_ref` at `id`, superseding any previous target.
    pub fn tag(&self, stack_ref: &StackRef, id: &ArtifactId) -> Result<(), HutError> {
        let path = self.ref_path(stack_ref);
        let tmp = self.root.join(TMP_DIR);
        let mut file = NamedTempFile::new_in(&tmp).map_err(|err| HutError::store(&tmp, err))?;
        file.write_all(id.as_str().as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(|err| HutError::store(file.path(), err))?;
        file.persist(&path)
            .map_err(|err| HutError::store(&path, err.error))?;
        Ok(())
    }

    /// Look up the artifact a stack ref points at. A ref whose artifact has
    /// vanished resolves to `None`.
    pub fn resolve_ref(&self, stack_ref: &StackRef) -> Result<Option<Artifact>, HutError> {
        let path = self.ref_path(stack_ref);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HutError::store(&path, err)),
        };
        let id: ArtifactId = raw.parse().map_err(|err: String| {
            HutError::store(&path, io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        self.load(&id)
    }

    /// Resolve either a full artifact id or a `name@version` stack ref.
    pub fn resolve(&self, spec: &str) -> Result<Option<Artifact>, HutError> {
        if let Ok(id) = spec.parse::<ArtifactId>() {
            return self.load(&id);
        }
        let stack_ref: StackRef = spec.parse()?;
        self.resolve_ref(&stack_ref)
    }

    /// All published artifacts, oldest first.
    pub fn list(&self) -> Result<Vec<Artifact>, HutError> {
        let dir = self.root.join(ARTIFACTS_DIR);
        let entries = fs::read_dir(&dir).map_err(|err| HutError::store(&dir, err))?;
        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HutError::store(&dir, err))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<ArtifactId>() else {
                continue;
            };
            if let Some(artifact) = self.load(&id)? {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(artifacts)
    }

    fn ref_path(&self, stack_ref: &StackRef) -> PathBuf {
        self.root.join(REFS_DIR).join(stack_ref.to_string())
    }
}
