use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Reference to a published Stack artifact, written `name@version`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackRef {
    name: String,
    version: String,
}

impl StackRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let version = version.into();
        let raw = format!("{name}@{version}");
        check_name(&raw, &name)?;
        check_version(&raw, &version)?;
        Ok(Self { name, version })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FromStr for StackRef {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((name, version)) = raw.split_once('@') else {
            return Err(malformed(raw, "expected `name@version`"));
        };
        Self::new(name, version)
    }
}

impl TryFrom<String> for StackRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StackRef> for String {
    fn from(value: StackRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

fn check_name(raw: &str, name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(malformed(raw, "stack name is empty")),
        Some(first) if !(first.is_ascii_lowercase() || first.is_ascii_digit()) => {
            return Err(malformed(
                raw,
                "stack name must start with a lowercase letter or digit",
            ));
        }
        Some(_) => {}
    }
    if let Some(bad) = chars.find(|c| !is_name_char(*c)) {
        return Err(malformed(raw, &format!("invalid character `{bad}` in stack name")));
    }
    Ok(())
}

fn check_version(raw: &str, version: &str) -> Result<(), ValidationError> {
    if version.is_empty() {
        return Err(malformed(raw, "stack version is empty"));
    }
    if let Some(bad) = version
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(malformed(raw, &format!("invalid character `{bad}` in stack version")));
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
}

fn malformed(raw: &str, reason: &str) -> ValidationError {
    ValidationError::StackRef {
        value: raw.to_string(),
        reason: reason.to_string(),
    }
}
