//! Engine configuration: model, discovery, loading and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs_next::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::http::TransportSettings;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "SLUICE_CONFIG_PATH";

/// Default marker appended to request URLs.
pub const DEFAULT_IDENTIFIER_SUFFIX: &str = "sluice";

/// Credential policy applied to outgoing requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialsMode {
    /// Always attach credentials.
    #[default]
    Include,
    /// Attach credentials only when the request targets the configured origin.
    SameOrigin,
    /// Never attach credentials.
    Omit,
}

/// Engine configuration as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EngineConfig {
    pub credentials: CredentialsMode,
    /// Marker appended to request URLs so redirects can be detected.
    pub identifier_suffix: String,
    /// Origin used to absolutize relative sources.
    pub origin: Option<Url>,
    pub request_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialsMode::Include,
            identifier_suffix: DEFAULT_IDENTIFIER_SUFFIX.to_string(),
            origin: None,
            request_timeout_secs: None,
            user_agent: None,
        }
    }
}

impl EngineConfig {
    /// Whether a request to `url` should carry credentials.
    pub fn include_credentials(&self, url: &str) -> bool {
        match self.credentials {
            CredentialsMode::Include => true,
            CredentialsMode::Omit => false,
            CredentialsMode::SameOrigin => {
                let Some(origin) = &self.origin else {
                    return false;
                };
                match Url::parse(url) {
                    Ok(target) => target.origin() == origin.origin(),
                    // Relative URLs resolve against the origin.
                    Err(_) => true,
                }
            }
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let mut settings = TransportSettings::default();
        if let Some(user_agent) = &self.user_agent {
            settings.user_agent = user_agent.clone();
        }
        settings.timeout = self.request_timeout_secs.map(Duration::from_secs);
        settings
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid identifier suffix '{suffix}': {reason}")]
    InvalidSuffix { suffix: String, reason: String },

    #[error("request timeout must be greater than zero")]
    ZeroTimeout,

    #[error("origin '{0}' must be an http or https URL")]
    InvalidOrigin(String),
}

/// Returns the default path for the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("sluice").join("config.json")
}

/// Expands a leading `~/` against the home directory. Other paths are only trimmed.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    match trimmed.strip_prefix('~') {
        Some("") => home(),
        Some(rest) if rest.starts_with('/') => home().join(rest.trim_start_matches('/')),
        _ => PathBuf::from(trimmed),
    }
}

/// Loads configuration from the default path.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from a specific path. A missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: EngineConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_identifier_suffix(&config.identifier_suffix)?;

    if config.request_timeout_secs == Some(0) {
        return Err(ConfigError::ZeroTimeout);
    }

    if let Some(origin) = &config.origin
        && !matches!(origin.scheme(), "http" | "https")
    {
        return Err(ConfigError::InvalidOrigin(origin.to_string()));
    }

    Ok(())
}

/// The suffix is appended as a bare query key and must come back unchanged
/// from URL parsing, so only unreserved ASCII characters are accepted.
pub fn validate_identifier_suffix(suffix: &str) -> Result<(), ConfigError> {
    if suffix.is_empty() {
        return Err(ConfigError::InvalidSuffix {
            suffix: suffix.to_string(),
            reason: "suffix cannot be empty".to_string(),
        });
    }

    if let Some(bad) = suffix
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '~' | '-')))
    {
        return Err(ConfigError::InvalidSuffix {
            suffix: suffix.to_string(),
            reason: format!("character '{bad}' is not allowed"),
        });
    }

    Ok(())
}
