use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::warn;

use crate::backend::CloudProfile;
use crate::backend::cloud::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};

pub const CONFIG_ENV: &str = "STACKHUT_CONFIG";
pub const STORE_ENV: &str = "STACKHUT_STORE";
pub const PROFILE_ENV: &str = "STACKHUT_CLOUD_PROFILE";
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Default, Deserialize)]
pub struct StackhutConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub run: RunSection,
    /// Map of profile name -> cloud backend settings.
    #[serde(default)]
    pub cloud: BTreeMap<String, CloudProfileConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunSection {
    /// Applied to runs started without `--timeout`.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudProfileConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// API token; allow env:VAR indirection.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl StackhutConfig {
    /// `STACKHUT_STORE`, then `[store] path`, then the per-user data dir.
    pub fn store_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os(STORE_ENV).filter(|value| !value.is_empty()) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.store.path {
            return path.clone();
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("stackhut").join("store"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".stackhut").join("store")))
            .unwrap_or_else(|| PathBuf::from(".stackhut/store"))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.run.timeout_secs.map(Duration::from_secs)
    }

    /// `STACKHUT_CLOUD_PROFILE` or `default`.
    pub fn default_profile(&self) -> String {
        std::env::var(PROFILE_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }

    /// Reject values that parse but cannot work: zero timeouts or attempts,
    /// and base URLs without an HTTP scheme.
    pub fn validate(&self) -> Result<()> {
        if self.run.timeout_secs == Some(0) {
            bail!("run.timeout_secs must be at least 1");
        }
        for (name, profile) in &self.cloud {
            if let Some(url) = &profile.base_url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    bail!("cloud.{name}.base_url must start with http:// or https://, got `{url}`");
                }
            }
            if profile.max_attempts == Some(0) {
                bail!("cloud.{name}.max_attempts must be at least 1");
            }
            if profile.poll_interval_ms == Some(0) {
                bail!("cloud.{name}.poll_interval_ms must be at least 1");
            }
        }
        Ok(())
    }

    pub fn cloud_profiles(&self) -> BTreeMap<String, CloudProfile> {
        self.cloud
            .iter()
            .map(|(name, cfg)| (name.clone(), cfg.to_profile(name)))
            .collect()
    }
}

impl CloudProfileConfig {
    fn to_profile(&self, name: &str) -> CloudProfile {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:8080".to_string());
        let mut profile = CloudProfile::new(name, base_url);
        profile.token = match resolve_token(self.token.clone()) {
            Ok(token) => token,
            Err(err) => {
                warn!(profile = name, error = %err, "cloud token unavailable; requests will be unauthenticated");
                None
            }
        };
        profile.poll_interval = self
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        profile.max_attempts = self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        profile.backoff = DEFAULT_BACKOFF;
        profile
    }
}

fn resolve_token(raw: Option<String>) -> Result<Option<String>> {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return Ok(None);
    };
    if let Some(rest) = raw.strip_prefix("env:") {
        let value = std::env::var(rest)
            .with_context(|| format!("failed to resolve env var {rest} for cloud token"))?;
        Ok(Some(value))
    } else {
        Ok(Some(raw))
    }
}

/// Read the file [`config_path`] points at; no file means defaults.
pub fn load() -> Result<StackhutConfig> {
    match config_path() {
        Some(path) => load_file(&path),
        None => Ok(StackhutConfig::default()),
    }
}

pub fn load_file(path: &Path) -> Result<StackhutConfig> {
    if !path.exists() {
        return Ok(StackhutConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: StackhutConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(config)
}

/// `STACKHUT_CONFIG`, then `<config dir>/stackhut/config.toml` if it exists,
/// then `~/.stackhut/config.toml`. `config set` writes to the same file.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let platform = dirs::config_dir().map(|dir| dir.join("stackhut").join("config.toml"));
    if let Some(path) = platform.filter(|path| path.exists()) {
        return Some(path);
    }
    dirs::home_dir().map(|home| home.join(".stackhut").join("config.toml"))
}
