//! Parsing and validation of `Hutfile.yaml` service manifests.
//!
//! A manifest is checked against the embedded JSON Schema first and then
//! semantically; the resulting [`Descriptor`] is plain data with no behaviour.

pub mod descriptor;
pub mod error;
pub mod schema;
pub mod stack_ref;

pub use descriptor::{
    ArtifactKind, DEFAULT_CPU, DEFAULT_MEMORY_MB, Descriptor, ResourceLimits, Step, StepKind,
};
pub use error::ValidationError;
pub use schema::{HUTFILE_SCHEMA, validate_yaml_against_schema};
pub use stack_ref::StackRef;

/// Conventional manifest file name looked up when no path is given.
pub const DEFAULT_MANIFEST: &str = "Hutfile.yaml";
