//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EaselError, Result};

/// Top-level Easel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciler: Option<ReconcilerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Node geometry used by the layout planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_node_width")]
    pub node_width: f64,

    #[serde(default = "default_node_height")]
    pub node_height: f64,

    /// Horizontal space between two neighbouring nodes of a batch.
    #[serde(default = "default_gutter")]
    pub gutter: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            node_width: default_node_width(),
            node_height: default_node_height(),
            gutter: default_gutter(),
        }
    }
}

fn default_node_width() -> f64 {
    300.0
}

fn default_node_height() -> f64 {
    400.0
}

fn default_gutter() -> f64 {
    20.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Mark invocations whose arguments never completed as failed when the
    /// stream ends (default: true). When false they stay in `streaming`.
    #[serde(default = "default_true")]
    pub fail_incomplete_on_drain: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            fail_incomplete_on_drain: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wire format of the agent stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// `<code>:<json>` lines.
    #[default]
    DataStream,
    /// Server-Sent Events carrying JSON chunks.
    Sse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub framing: Framing,

    /// Recognise `<CLIENT_ACTION ... />` tags inside chat text.
    #[serde(default = "default_true")]
    pub client_actions: bool,

    /// Chat endpoint used by `easel chat`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name sent with chat requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            client_actions: true,
            endpoint: None,
            api_key: None,
            api_key_env: None,
            model: None,
        }
    }
}

impl StreamConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "easel_reconciler=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| EaselError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw)?;

        let config: Config =
            json5::from_str(&substituted).map_err(|e| EaselError::Config(e.to_string()))?;

        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file location: `~/.easel/config.json`.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn layout(&self) -> LayoutConfig {
        self.layout.clone().unwrap_or_default()
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        self.reconciler.clone().unwrap_or_default()
    }

    pub fn stream(&self) -> StreamConfig {
        self.stream.clone().unwrap_or_default()
    }

    pub fn framing(&self) -> Framing {
        self.stream.as_ref().map(|s| s.framing).unwrap_or_default()
    }

    pub fn client_actions_enabled(&self) -> bool {
        self.stream.as_ref().is_none_or(|s| s.client_actions)
    }

    /// The chat endpoint, if one is configured and non-empty.
    pub fn endpoint(&self) -> Option<String> {
        self.stream
            .as_ref()
            .and_then(|s| s.endpoint.clone())
            .filter(|e| !e.trim().is_empty())
    }

    /// Get a config value by dotted path (e.g. "layout.gutter").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(layout) = &self.layout {
            if layout.node_width <= 0.0 || layout.node_height <= 0.0 {
                errors.push("Layout node size must be positive".to_string());
            }
            if layout.gutter < 0.0 {
                errors.push("Layout gutter cannot be negative".to_string());
            }
        }

        if let Some(stream) = &self.stream {
            if stream.endpoint.is_some() && stream.resolve_api_key().is_none() {
                warnings.push("Stream endpoint has no API key configured".to_string());
            }
            if let Some(endpoint) = &stream.endpoint {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    errors.push(format!("Stream endpoint is not an HTTP URL: {endpoint}"));
                }
            }
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "Unknown log format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Easel data: `~/.easel/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".easel")
}
