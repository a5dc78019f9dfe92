use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use serde_yaml_bw::Value as YamlValue;

/// JSON Schema (draft 7) every `Hutfile.yaml` must satisfy before it is
/// converted into a [`crate::Descriptor`].
pub const HUTFILE_SCHEMA: &str = r#"{
  "$id": "https://stackhut.dev/schemas/v1/hutfile.schema.json",
  "type": "object",
  "additionalProperties": false,
  "required": ["stack", "run"],
  "anyOf": [
    { "required": ["serviceName"] },
    { "required": ["name"] }
  ],
  "properties": {
    "serviceName": { "type": "string" },
    "name": { "type": "string" },
    "stack": { "type": "string" },
    "installer": { "type": "string" },
    "run": { "type": "string" },
    "build": {
      "type": "array",
      "items": {
        "type": "object",
        "minProperties": 1,
        "maxProperties": 1,
        "additionalProperties": false,
        "properties": {
          "copy": { "type": "string" },
          "exec": { "type": "string" },
          "install": { "type": "string" }
        }
      }
    },
    "resources": {
      "type": "object",
      "additionalProperties": false,
      "properties": {
        "cpu": { "type": "number" },
        "memory": { "type": "integer" }
      }
    }
  }
}"#;

pub fn validate_yaml_against_schema(yaml: &YamlValue, schema_json: &str) -> Result<(), String> {
    let json = serde_json::to_value(yaml)
        .map_err(|error| format!("could not convert YAML to JSON: {error}"))?;
    let schema_value: Value = serde_json::from_str(schema_json)
        .map_err(|error| format!("invalid schema JSON: {error}"))?;

    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|error| format!("failed to compile schema: {error}"))?;

    if let Err(errors) = compiled.validate(&json) {
        let message = errors
            .map(|error| {
                let pointer = error.instance_path.to_string();
                if pointer.is_empty() {
                    error.to_string()
                } else {
                    format!("{pointer}: {error}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        Err(message)
    } else {
        Ok(())
    }
}
