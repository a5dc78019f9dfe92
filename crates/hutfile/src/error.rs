use std::path::PathBuf;

use thiserror::Error;

/// Reasons a manifest is rejected. All of them are raised before any build
/// step runs and none of them is retryable without editing the manifest.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("failed to read manifest `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest YAML: {0}")]
    Yaml(String),
    #[error("manifest does not match the Hutfile schema: {0}")]
    Schema(String),
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("malformed stack reference `{value}`: {reason}")]
    StackRef { value: String, reason: String },
    #[error("`{stack_ref}` refers to a hut artifact, not a stack")]
    NotAStack { stack_ref: String },
    #[error("a hut build needs at least one build step")]
    NoBuildSteps,
    #[error("build step {index} (`{kind}`) has an empty payload")]
    EmptyStep { index: usize, kind: String },
    #[error("invalid resource limit `{field}`: {reason}")]
    Resources { field: &'static str, reason: String },
}
