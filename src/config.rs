//! File configuration.
//!
//! Every section has defaults, so a partial or empty file is valid.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bulk::BatchConfig;
use crate::metrics::MetricsConfig;
use crate::optimizer::OptimizerConfig;
use crate::retry::RetryConfig;
use crate::transfer::TransferConfig;

const APP_DIR: &str = "civitai-downloader";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },

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
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Aggregate configuration, one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
    pub optimizer: OptimizerConfig,
    pub bulk: BatchConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Reads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|error| match error {
            ParseFailure::Toml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(error) => error,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Loads the file at [`default_path`] if it exists, else defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an existing file is unreadable or invalid.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found across sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.metrics.validate()?;
        self.optimizer.validate()?;
        self.bulk.validate()?;
        self.transfer.validate()
    }

    /// Renders as TOML with the API token redacted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Render`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.transfer.api_token.is_some() {
            shown.transfer.api_token = Some("[redacted]".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    fn parse(raw: &str) -> Result<Self, ParseFailure> {
        let config: Self = toml::from_str(raw).map_err(ParseFailure::Toml)?;
        config.validate().map_err(ParseFailure::Invalid)?;
        Ok(config)
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(ConfigError),
}

/// Default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/civitai-downloader/config.toml`
/// 2. `$HOME/.config/civitai-downloader/config.toml`
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join(CONFIG_FILE));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join(APP_DIR).join(CONFIG_FILE))
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bulk::BatchStrategy;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = Config::parse("").ok().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let raw = r#"
            [bulk]
            batch_size = 4
            strategy = "sequential"

            [optimizer]
            max_connections = 16
        "#;
        let config = Config::parse(raw).ok().unwrap();
        assert_eq!(config.bulk.batch_size, 4);
        assert_eq!(config.bulk.strategy, BatchStrategy::Sequential);
        assert_eq!(config.optimizer.max_connections, 16);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_load_reports_invalid_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bulk]\nbatch_size = 0\n").unwrap();

        let error = Config::load(&path).unwrap_err();
        assert!(error.to_string().contains("bulk.batch_size"), "{error}");
    }

    #[test]
    fn test_load_reports_parse_error_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bulk\n").unwrap();

        let error = Config::load(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
        assert!(error.to_string().contains("config.toml"));
    }

    #[test]
    fn test_to_toml_redacts_token() {
        let mut config = Config::default();
        config.transfer.api_token = Some("secret-token".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[redacted]"));
    }
}
