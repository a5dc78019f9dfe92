use std::path::PathBuf;

use hutfile::{StackRef, StepKind, ValidationError};
use thiserror::Error;

/// Every way an invocation can fail. A cancelled run is a terminal
/// [`crate::backend::RunStatus`] instead; [`HutError::Cancelled`] only covers
/// work interrupted before a run started.
#[derive(Debug, Error)]
pub enum HutError {
    #[error("invalid manifest: {0}")]
    Validation(#[from] ValidationError),
    #[error("stack `{stack_ref}` is not in the content store; run `stackhut build-stack` first")]
    MissingDependency { stack_ref: StackRef },
    #[error("build step {index} (`{kind} {payload}`) failed{}:\n{output}", exit_suffix(.exit_code))]
    BuildStep {
        index: usize,
        kind: StepKind,
        payload: String,
        exit_code: Option<i32>,
        output: String,
    },
    #[error("run failed with code {code}: {message}")]
    RunFailure { code: i32, message: String },
    #[error("unknown command `{name}` (available: {})", .available.join(", "))]
    UnknownCommand {
        name: String,
        available: Vec<&'static str>,
    },
    #[error("backend `{endpoint}` unavailable after {attempts} attempt(s): {message}")]
    BackendUnavailable {
        endpoint: String,
        attempts: u32,
        message: String,
    },
    #[error("content store error at `{}`: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected response from cloud backend: {0}")]
    Protocol(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cancelled")]
    Cancelled,
}

impl HutError {
    pub(crate) fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HutError::Store {
            path: path.into(),
            source,
        }
    }

    /// Whether the same invocation could succeed later without editing the
    /// manifest.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HutError::MissingDependency { .. } | HutError::BackendUnavailable { .. }
        )
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_step_message_names_the_step() {
        let err = HutError::BuildStep {
            index: 2,
            kind: StepKind::Exec,
            payload: "make".into(),
            exit_code: Some(2),
            output: "make: *** No targets.".into(),
        };
        let message = err.to_string();
        assert!(message.contains("build step 2 (`exec make`) failed with exit code 2"));
        assert!(message.contains("No targets"));
    }

    #[test]
    fn only_dependency_and_backend_errors_are_retryable() {
        let missing = HutError::MissingDependency {
            stack_ref: "base@1".parse().unwrap(),
        };
        assert!(missing.is_retryable());
        assert!(!HutError::Protocol("bad".into()).is_retryable());
    }
}
