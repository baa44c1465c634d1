use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Deserialize;
use shellexpand::full;
use toml::Value;

use crate::model::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_CYCLES, DEFAULT_MODEL, OVERALL_METRIC, SessionConfig,
    Thresholds,
};

pub const DEFAULT_WEBSOCKET_URL: &str = "ws://localhost:8000/ws/simulate";
pub const DEFAULT_ARCHIVE_URL: &str = "http://localhost:8000";
pub const DEFAULT_API_KEY_ENV: &str = "ODEON_API_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionDefaults,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub websocket_url: String,
    pub archive_url: String,
    /// When set, history is read from this database instead of over HTTP.
    pub archive_db: Option<PathBuf>,
}

/// Values used to build a [`SessionConfig`] when a session starts.
#[derive(Clone)]
pub struct SessionDefaults {
    pub model_name: String,
    pub base_prompt: String,
    pub max_cycles: u32,
    pub batch_size: u32,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub thresholds: Thresholds,
}

impl fmt::Debug for SessionDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDefaults")
            .field("model_name", &self.model_name)
            .field("base_prompt_len", &self.base_prompt.len())
            .field("max_cycles", &self.max_cycles)
            .field("batch_size", &self.batch_size)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl SessionDefaults {
    /// The configured key, falling back to the environment variable named by
    /// `api_key_env`.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            api_key: self.resolve_api_key().unwrap_or_default(),
            model_name: self.model_name.clone(),
            base_prompt: self.base_prompt.clone(),
            max_cycles: self.max_cycles,
            batch_size: self.batch_size,
            thresholds: self.thresholds.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigDiagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

impl ConfigDiagnostic {
    fn error(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
        }
    }
}

impl Config {
    /// Parse a configuration [`Value`] into a [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML contains unknown keys, values of the
    /// wrong type, or paths that cannot be expanded.
    pub fn from_value(value: &Value) -> Result<Self> {
        let raw: RawConfig = value
            .clone()
            .try_into()
            .map_err(|err: toml::de::Error| eyre!("failed to decode configuration: {err}"))?;
        raw.into_config()
    }

    #[must_use]
    pub fn lint(&self) -> Vec<ConfigDiagnostic> {
        let mut diags = Vec::new();
        let session = &self.session;

        if session.max_cycles == 0 {
            diags.push(ConfigDiagnostic::error(
                "session.max_cycles must be at least 1",
            ));
        }
        if session.batch_size == 0 {
            diags.push(ConfigDiagnostic::error(
                "session.batch_size must be at least 1",
            ));
        }
        for (metric, value) in session.thresholds.iter() {
            if !value.is_finite() || !(1.0..=10.0).contains(&value) {
                diags.push(ConfigDiagnostic::error(format!(
                    "session.thresholds.{metric} = {value} is outside 1..=10"
                )));
            }
        }
        if session.thresholds.get(OVERALL_METRIC).is_none() {
            diags.push(ConfigDiagnostic::warning(format!(
                "session.thresholds has no '{OVERALL_METRIC}' target; the server falls back to its default"
            )));
        }
        if session.base_prompt.trim().is_empty() {
            diags.push(ConfigDiagnostic::warning(
                "session.base_prompt is empty; pass --prompt-file or edit it in the dashboard",
            ));
        }
        if session.resolve_api_key().is_none() {
            diags.push(ConfigDiagnostic::warning(format!(
                "no API key configured; set session.api_key or ${}",
                session.api_key_env
            )));
        }

        let ws = &self.server.websocket_url;
        if ws.starts_with("wss://") {
            diags.push(ConfigDiagnostic::warning(format!(
                "server.websocket_url '{ws}' uses TLS, which is not supported; use ws://"
            )));
        } else if !ws.starts_with("ws://") {
            diags.push(ConfigDiagnostic::error(format!(
                "server.websocket_url '{ws}' must start with ws://"
            )));
        }

        match &self.server.archive_db {
            Some(path) if !path.is_file() => {
                diags.push(ConfigDiagnostic::warning(format!(
                    "server.archive_db '{}' does not exist yet",
                    path.display()
                )));
            }
            Some(_) => {}
            None => {
                let url = &self.server.archive_url;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    diags.push(ConfigDiagnostic::error(format!(
                        "server.archive_url '{url}' must be an http(s) URL"
                    )));
                }
            }
        }

        diags
    }
}

/// JSON schema for the configuration files.
#[must_use]
pub fn schema() -> schemars::Schema {
    schemars::schema_for!(RawConfig)
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    session: RawSession,
}

impl RawConfig {
    fn into_config(self) -> Result<Config> {
        Ok(Config {
            server: self.server.into_server()?,
            session: self.session.into_session(),
        })
    }
}

/// Where the simulation server lives.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawServer {
    /// Websocket endpoint that runs simulations.
    websocket_url: Option<String>,
    /// Base URL serving `/history`.
    archive_url: Option<String>,
    /// Path to the server's run database; overrides `archive_url`.
    archive_db: Option<String>,
}

impl RawServer {
    fn into_server(self) -> Result<ServerConfig> {
        let archive_db = match self.archive_db.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(expand_path(raw)?),
            _ => None,
        };
        Ok(ServerConfig {
            websocket_url: self
                .websocket_url
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string()),
            archive_url: self
                .archive_url
                .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
            archive_db,
        })
    }
}

/// Defaults for new simulation sessions.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawSession {
    model_name: Option<String>,
    base_prompt: Option<String>,
    max_cycles: Option<u32>,
    batch_size: Option<u32>,
    /// Prefer `api_key_env` so the key stays out of config files.
    api_key: Option<String>,
    /// Environment variable holding the API key.
    api_key_env: Option<String>,
    /// Score targets per metric, 1 to 10. Unlisted standard metrics default to 8.
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, f64>")]
    thresholds: IndexMap<String, f64>,
}

impl RawSession {
    fn into_session(self) -> SessionDefaults {
        let mut thresholds = Thresholds::default();
        for (metric, value) in self.thresholds {
            thresholds.set(metric, value);
        }
        SessionDefaults {
            model_name: self.model_name.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_prompt: self.base_prompt.unwrap_or_default(),
            max_cycles: self.max_cycles.unwrap_or(DEFAULT_MAX_CYCLES),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            api_key: self.api_key,
            api_key_env: self
                .api_key_env
                .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string()),
            thresholds,
        }
    }
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = full(raw)
        .with_context(|| format!("failed to expand path '{raw}': environment variable missing"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
