use std::fs;

use anyhow::{Context, Result, anyhow, bail};
use toml_edit::{DocumentMut, Item, Table, Value, value};

use crate::cli::{ConfigCommand, ConfigSetArgs};
use crate::config::{self, StackhutConfig};

const KNOWN_KEYS: &str =
    "store.path, run.timeout_secs, cloud.<profile>.{base_url,token,poll_interval_ms,max_attempts}";

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Set(args) => set_value(&args),
    }
}

/// How a key's value is written to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    Text,
    Count,
}

impl Setting {
    fn for_key(segments: &[&str]) -> Option<Self> {
        match segments {
            ["store", "path"] => Some(Setting::Text),
            ["run", "timeout_secs"] => Some(Setting::Count),
            ["cloud", profile, field] if !profile.is_empty() => match *field {
                "base_url" | "token" => Some(Setting::Text),
                "poll_interval_ms" | "max_attempts" => Some(Setting::Count),
                _ => None,
            },
            _ => None,
        }
    }

    fn value(self, key: &str, raw: &str) -> Result<Value> {
        match self {
            Setting::Text => Ok(raw.into()),
            Setting::Count => {
                let count: u32 = raw
                    .parse()
                    .map_err(|_| anyhow!("`{key}` expects a whole number, got `{raw}`"))?;
                Ok(i64::from(count).into())
            }
        }
    }
}

fn set_value(args: &ConfigSetArgs) -> Result<()> {
    let path = match &args.file {
        Some(path) => path.clone(),
        None => config::config_path().ok_or_else(|| {
            anyhow!("no config file location; set STACKHUT_CONFIG or pass --file")
        })?,
    };

    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let mut doc = raw
        .parse::<DocumentMut>()
        .with_context(|| format!("failed to parse {}", path.display()))?;

    apply_key(&mut doc, &args.key, &args.value)?;

    let rendered = doc.to_string();
    let updated: StackhutConfig = toml::from_str(&rendered)
        .with_context(|| format!("`{}` would make {} unreadable", args.key, path.display()))?;
    updated.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Updated {}", path.display());
    Ok(())
}

fn apply_key(doc: &mut DocumentMut, key: &str, raw: &str) -> Result<()> {
    let segments = key.split('.').collect::<Vec<_>>();
    let Some(setting) = Setting::for_key(&segments) else {
        bail!("unknown config key `{key}`; expected one of {KNOWN_KEYS}");
    };
    let Some((last, parents)) = segments.split_last() else {
        bail!("config key cannot be empty");
    };

    let mut current = doc.as_table_mut();
    for segment in parents {
        current = current
            .entry(segment)
            .or_insert(Item::Table(Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow!("path `{segment}` is not a table in the config"))?;
    }

    current.insert(last, value(setting.value(key, raw)?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use tempfile::TempDir;

    fn set(path: &PathBuf, key: &str, value: &str) -> Result<()> {
        set_value(&ConfigSetArgs {
            key: key.into(),
            value: value.into(),
            file: Some(path.clone()),
        })
    }

    #[test]
    fn creates_new_document() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");
        set(&path, "cloud.default.base_url", "https://cloud.example").unwrap();
        let written = fs::read_to_string(path).unwrap();
        assert!(written.contains("[cloud.default]"));
        assert!(written.contains("base_url = \"https://cloud.example\""));
    }

    #[test]
    fn updates_nested_tables_with_typed_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[store]
path = "/srv/stackhut"
"#,
        )
        .unwrap();

        set(&path, "run.timeout_secs", "120").unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("timeout_secs = 120"));
        assert!(written.contains("path = \"/srv/stackhut\""));

        let parsed = config::load_file(&path).unwrap();
        assert_eq!(parsed.run.timeout_secs, Some(120));
    }

    #[test]
    fn unknown_keys_and_bad_values_leave_the_file_alone() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[run]\ntimeout_secs = 30\n").unwrap();

        let err = set(&path, "run.timeout", "30").unwrap_err();
        assert!(err.to_string().contains("unknown config key `run.timeout`"));
        let err = set(&path, "cloud.default.max_attempts", "many").unwrap_err();
        assert!(err.to_string().contains("expects a whole number"));
        let err = set(&path, "cloud.default.base_url", "cloud.example").unwrap_err();
        assert!(err.to_string().contains("http://"));
        assert!(set(&path, "run.timeout_secs", "0").is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), "[run]\ntimeout_secs = 30\n");
    }

    #[test]
    fn refuses_to_descend_into_values() {
        let mut doc: DocumentMut = "store = \"flat\"\n".parse().unwrap();
        let err = apply_key(&mut doc, "store.path", "/x").unwrap_err();
        assert!(err.to_string().contains("not a table"));
        assert!(apply_key(&mut doc, "..", "x").is_err());
    }
}
