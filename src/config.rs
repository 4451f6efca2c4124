//! Client configuration: TOML file plus environment overrides.
//!
//! Lookup order for the file: explicit path, then
//! `<config_dir>/livrya/narration.toml`. A missing file means defaults.
//! `LIVRYA_API_URL`, `LIVRYA_WS_URL` and `LIVRYA_TOKEN` override the file.

use crate::channel::ReconnectPolicy;
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_API_URL: &str = "LIVRYA_API_URL";
pub const ENV_WS_URL: &str = "LIVRYA_WS_URL";
pub const ENV_TOKEN: &str = "LIVRYA_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    /// REST base URL, usually ending in `/api`.
    pub api_url: String,
    /// Event channel URL. Derived from `api_url` when unset.
    pub ws_url: Option<String>,
    pub auth_token: Option<String>,
    pub log_level: String,
    pub request_timeout_secs: u64,
    pub channel: ChannelConfig,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3001/api".to_string(),
            ws_url: None,
            auth_token: None,
            log_level: "info".to_string(),
            request_timeout_secs: 30,
            channel: ChannelConfig::default(),
        }
    }
}

impl StudioConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "livrya").map(|dirs| dirs.config_dir().join("narration.toml"))
    }

    /// Load from `path` (or the default location) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))
    }

    /// Apply overrides from a variable lookup; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(url) = get(ENV_WS_URL) {
            self.ws_url = Some(url);
        }
        if let Some(token) = get(ENV_TOKEN) {
            self.auth_token = Some(token);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Event channel URL: `ws_url` if set, else `api_url` without its `/api`
    /// suffix and with the scheme switched to `ws`/`wss`.
    pub fn socket_url(&self) -> String {
        if let Some(url) = self.ws_url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        let base = self.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/api").unwrap_or(base);
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }
}
