//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tandem/config.json`) and environment.
//! Kept minimal: cloud endpoint, local model candidates and generation limits,
//! history storage, and attachment limits.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Cloud text-generation endpoint settings.
    #[serde(default)]
    pub cloud: CloudConfig,

    /// Local engine settings (candidate models, load timeout, sampling).
    #[serde(default)]
    pub local: LocalConfig,

    /// Conversation history persistence settings.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Attachment limits.
    #[serde(default)]
    pub attachments: AttachmentsConfig,
}

/// Cloud endpoint URL and request timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Full URL of the text-generation endpoint. Overridden by TANDEM_CLOUD_URL env.
    pub endpoint_url: Option<String>,

    /// Per-request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Resolve the cloud endpoint URL: env TANDEM_CLOUD_URL overrides config.
pub fn resolve_cloud_endpoint(config: &Config) -> Option<String> {
    std::env::var("TANDEM_CLOUD_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .cloud
                .endpoint_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Local engine config: candidate models (tried in order), load timeout, and
/// fixed generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Base URL of the local engine server (default http://127.0.0.1:11434).
    pub base_url: Option<String>,

    /// Candidate model ids, tried in order. The first entry is the preferred model.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Per-candidate load timeout in seconds (default 30).
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// Maximum tokens per local generation (default 256, kept short for speed).
    #[serde(default = "default_max_gen_length")]
    pub max_gen_length: u32,

    /// Sampling temperature (default 0.7).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling cutoff (default 0.9).
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_models() -> Vec<String> {
    vec!["tinyllama".to_string(), "llama3.2:1b".to_string()]
}

fn default_load_timeout_secs() -> u64 {
    30
}

fn default_max_gen_length() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            models: default_models(),
            load_timeout_secs: default_load_timeout_secs(),
            max_gen_length: default_max_gen_length(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

/// History persistence config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Directory for persisted conversation state. Relative paths are resolved
    /// against the config file's parent. Default: the config directory itself.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Attachment limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentsConfig {
    /// Maximum attachment size in bytes (default 5 MiB).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TANDEM_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tandem").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Resolve the directory where conversation state is persisted: uses
/// `history.directory` if set (relative paths resolved against the config
/// file's parent), otherwise the config file's parent itself.
pub fn resolve_history_dir(config: &Config, config_path: &std::path::Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    match &config.history.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.to_path_buf(),
    }
}

/// Load config from the default path (or TANDEM_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
