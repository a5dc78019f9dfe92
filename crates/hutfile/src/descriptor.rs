use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml_bw::Value as YamlValue;

use crate::ValidationError;
use crate::schema::{HUTFILE_SCHEMA, validate_yaml_against_schema};
use crate::stack_ref::StackRef;

pub const DEFAULT_CPU: f64 = 1.0;
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// The two build granularities: a base toolchain layer and a service layered
/// on top of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stack,
    Hut,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Stack => f.write_str("stack"),
            ArtifactKind::Hut => f.write_str("hut"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Copy,
    Exec,
    Install,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Copy => f.write_str("copy"),
            StepKind::Exec => f.write_str("exec"),
            StepKind::Install => f.write_str("install"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Fractional CPU cores.
    pub cpu: f64,
    pub memory_mb: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

/// Validated, immutable view of a `Hutfile.yaml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub service_name: String,
    pub stack_ref: StackRef,
    pub build_steps: Vec<Step>,
    pub run_entrypoint: String,
    pub resource_limits: ResourceLimits,
    pub installer: Option<String>,
}

impl Descriptor {
    /// Parse and validate a manifest for the given build kind.
    ///
    /// Validation is total: on success every field has been checked, so the
    /// build pipeline never discovers a manifest problem halfway through.
    pub fn parse(raw: &str, kind: ArtifactKind) -> Result<Self, ValidationError> {
        let document: YamlValue =
            serde_yaml_bw::from_str(raw).map_err(|error| ValidationError::Yaml(error.to_string()))?;
        validate_yaml_against_schema(&document, HUTFILE_SCHEMA).map_err(ValidationError::Schema)?;
        let doc: HutfileDoc = serde_yaml_bw::from_value(document)
            .map_err(|error| ValidationError::Yaml(error.to_string()))?;
        doc.into_descriptor(kind)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P, kind: ArtifactKind) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ValidationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, kind)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HutfileDoc {
    #[serde(rename = "serviceName", alias = "name")]
    service_name: String,
    stack: String,
    #[serde(default)]
    installer: Option<String>,
    #[serde(default)]
    build: Vec<StepDoc>,
    run: String,
    #[serde(default)]
    resources: Option<ResourcesDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StepDoc {
    Copy(String),
    Exec(String),
    Install(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourcesDoc {
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    memory: Option<u64>,
}

impl HutfileDoc {
    fn into_descriptor(self, kind: ArtifactKind) -> Result<Descriptor, ValidationError> {
        let service_name = non_empty(self.service_name, "serviceName")?;
        let stack_ref: StackRef = self.stack.trim().parse()?;
        let run_entrypoint = non_empty(self.run, "run")?;
        let installer = match self.installer {
            Some(raw) => Some(non_empty(raw, "installer")?),
            None => None,
        };

        let build_steps = self
            .build
            .into_iter()
            .enumerate()
            .map(|(index, step)| step.into_step(index))
            .collect::<Result<Vec<_>, _>>()?;
        if kind == ArtifactKind::Hut && build_steps.is_empty() {
            return Err(ValidationError::NoBuildSteps);
        }

        let resource_limits = resource_limits(self.resources)?;

        Ok(Descriptor {
            service_name,
            stack_ref,
            build_steps,
            run_entrypoint,
            resource_limits,
            installer,
        })
    }
}

impl StepDoc {
    fn into_step(self, index: usize) -> Result<Step, ValidationError> {
        let (kind, payload) = match self {
            StepDoc::Copy(payload) => (StepKind::Copy, payload),
            StepDoc::Exec(payload) => (StepKind::Exec, payload),
            StepDoc::Install(payload) => (StepKind::Install, payload),
        };
        let payload = payload.trim().to_string();
        if payload.is_empty() {
            return Err(ValidationError::EmptyStep {
                index,
                kind: kind.to_string(),
            });
        }
        Ok(Step { kind, payload })
    }
}

fn non_empty(value: String, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(trimmed.to_string())
}

fn resource_limits(doc: Option<ResourcesDoc>) -> Result<ResourceLimits, ValidationError> {
    let Some(doc) = doc else {
        return Ok(ResourceLimits::default());
    };
    let cpu = doc.cpu.unwrap_or(DEFAULT_CPU);
    if !cpu.is_finite() || cpu <= 0.0 {
        return Err(ValidationError::Resources {
            field: "cpu",
            reason: format!("must be a positive number of cores (got {cpu})"),
        });
    }
    let memory_mb = match doc.memory {
        None => DEFAULT_MEMORY_MB,
        Some(0) => {
            return Err(ValidationError::Resources {
                field: "memory",
                reason: "must be greater than zero".to_string(),
            });
        }
        Some(memory) => u32::try_from(memory).map_err(|_| ValidationError::Resources {
            field: "memory",
            reason: format!("{memory} MiB is out of range"),
        })?,
    };
    Ok(ResourceLimits { cpu, memory_mb })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
serviceName: echo
stack: base@1
build:
  - copy: ./src
run: echo.sh
"#;

    #[test]
    fn parses_the_echo_manifest() {
        let descriptor = Descriptor::parse(ECHO, ArtifactKind::Hut).unwrap();
        assert_eq!(descriptor.service_name, "echo");
        assert_eq!(descriptor.stack_ref.to_string(), "base@1");
        assert_eq!(
            descriptor.build_steps,
            vec![Step {
                kind: StepKind::Copy,
                payload: "./src".into()
            }]
        );
        assert_eq!(descriptor.run_entrypoint, "echo.sh");
        assert_eq!(descriptor.resource_limits, ResourceLimits::default());
        assert_eq!(descriptor.installer, None);
    }

    #[test]
    fn accepts_name_alias_and_resources() {
        let raw = r#"
name: py
stack: python@3
installer: pip install --target .
build:
  - install: requests
  - exec: python -m compileall .
run: python app.py
resources:
  cpu: 0.5
  memory: 128
"#;
        let descriptor = Descriptor::parse(raw, ArtifactKind::Stack).unwrap();
        assert_eq!(descriptor.service_name, "py");
        assert_eq!(descriptor.installer.as_deref(), Some("pip install --target ."));
        assert_eq!(descriptor.build_steps[0].kind, StepKind::Install);
        assert_eq!(descriptor.build_steps[1].kind, StepKind::Exec);
        assert_eq!(descriptor.resource_limits.memory_mb, 128);
        assert!((descriptor.resource_limits.cpu - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_required_fields_fail_schema_validation() {
        let raw = "serviceName: echo\nbuild:\n  - copy: ./src\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::Schema(_)), "got {err}");
    }

    #[test]
    fn missing_service_name_is_rejected() {
        let raw = "stack: base@1\nrun: x\nbuild:\n  - copy: ./src\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::Schema(_)), "got {err}");
    }

    #[test]
    fn empty_steps_are_only_fatal_for_huts() {
        let raw = "serviceName: base\nstack: base@1\nrun: sh\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::NoBuildSteps));
        let stack = Descriptor::parse(raw, ArtifactKind::Stack).unwrap();
        assert!(stack.build_steps.is_empty());
    }

    #[test]
    fn malformed_stack_ref_is_rejected() {
        let raw = "serviceName: echo\nstack: base\nrun: x\nbuild:\n  - copy: ./src\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::StackRef { .. }), "got {err}");
    }

    #[test]
    fn blank_payloads_and_entrypoints_are_rejected() {
        let raw = "serviceName: echo\nstack: base@1\nrun: x\nbuild:\n  - exec: '  '\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyStep { index: 0, .. }), "got {err}");

        let raw = "serviceName: echo\nstack: base@1\nrun: ''\nbuild:\n  - copy: ./src\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyField("run")), "got {err}");
    }

    #[test]
    fn zero_memory_is_rejected() {
        let raw = "serviceName: echo\nstack: base@1\nrun: x\nbuild:\n  - copy: ./src\nresources:\n  memory: 0\n";
        let err = Descriptor::parse(raw, ArtifactKind::Hut).unwrap_err();
        assert!(
            matches!(err, ValidationError::Resources { field: "memory", .. }),
            "got {err}"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "serviceName: echo\nstack: base@1\nrun: x\nbuild:\n  - copy: ./src\nports: [80]\n";
        assert!(Descriptor::parse(raw, ArtifactKind::Hut).is_err());
    }
}
