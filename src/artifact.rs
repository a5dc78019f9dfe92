use std::fmt;
use std::str::FromStr;

use hutfile::{ArtifactKind, ResourceLimits, StackRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const ID_LEN: usize = 64;

/// Hex-encoded SHA-256 content hash identifying an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn digest(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for ArtifactId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.len() != ID_LEN || !raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(format!("`{raw}` is not a sha256 artifact id"));
        }
        Ok(Self(raw.to_string()))
    }
}

impl TryFrom<String> for ArtifactId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactId> for String {
    fn from(value: ArtifactId) -> Self {
        value.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable build output. Stored as `artifact.json` next to its `rootfs/`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub service_name: String,
    pub stack_ref: StackRef,
    /// Stack this hut was layered on; `None` for stacks.
    pub parent: Option<ArtifactId>,
    /// Layer digests, base first.
    pub layers: Vec<String>,
    pub entrypoint: String,
    pub resources: ResourceLimits,
    pub installer: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex() {
        let id = ArtifactId::digest(b"stackhut");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id.as_str().parse::<ArtifactId>().unwrap(), id);
        assert_eq!(id.short().len(), 12);
    }

    #[test]
    fn rejects_non_hash_ids() {
        assert!("base@1".parse::<ArtifactId>().is_err());
        assert!("ABCDEF".parse::<ArtifactId>().is_err());
    }
}
