//! Build layered service artifacts ("stacks" and "huts") into a local
//! content-addressed store and run them on a local or cloud backend.

pub mod artifact;
pub mod backend;
pub mod cancel;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod hut_build;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod util;

pub use artifact::{Artifact, ArtifactId};
pub use cancel::CancellationToken;
pub use error::HutError;
pub use orchestrator::{InvocationArgs, Orchestrator, Outcome, Report};
pub use registry::Registry;
pub use store::ContentStore;
