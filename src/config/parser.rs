//! Configuration parser for loading controller configuration.
//!
//! Configuration comes from an optional YAML file, then `GITOPSSETS_*`
//! environment variables override individual fields.

use crate::api::GeneratorKind;
use crate::error::{ConfigError, Result};
use std::path::Path;
use tracing::{debug, info};

use super::spec::ControllerConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "GITOPSSETS_";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["gitopssets.yaml", "gitopssets.yml"];

/// Configuration parser for the controller.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ControllerConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ControllerConfig> {
        debug!("Parsing YAML configuration");
        if content.trim().is_empty() {
            return Ok(ControllerConfig::default());
        }

        let config: ControllerConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })?;

        debug!(generators = config.enabled_generators.len(), "Parsed controller configuration");
        Ok(config)
    }

    /// Loads configuration from `path` (or defaults when `None`) and applies
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load_with_env(&self, path: Option<&Path>) -> Result<ControllerConfig> {
        let mut config = match path {
            Some(path) => self.load_file(path)?,
            None => ControllerConfig::default(),
        };
        apply_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> std::result::Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::ParseError {
        message: format!("{key} must be a number of seconds, got {value:?}"),
        location: Some(key.to_string()),
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Applies `GITOPSSETS_*` overrides read through `lookup`.
///
/// # Errors
///
/// Returns an error for unknown generator names or non-numeric durations.
pub fn apply_overrides(
    config: &mut ControllerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> std::result::Result<(), ConfigError> {
    let var = |name: &str| {
        let key = format!("{ENV_PREFIX}{name}");
        lookup(&key).map(|value| (key, value))
    };

    if let Some((_, value)) = var("ENABLED_GENERATORS") {
        debug!("Overriding enabled_generators from environment");
        config.enabled_generators = split_list(&value)
            .map(str::parse::<GeneratorKind>)
            .collect::<std::result::Result<_, _>>()?;
    }
    if let Some((_, value)) = var("DEFAULT_SERVICE_ACCOUNT") {
        debug!("Overriding default_service_account from environment");
        config.default_service_account = Some(value).filter(|v| !v.is_empty());
    }
    if let Some((_, value)) = var("WATCH_NAMESPACE") {
        debug!("Overriding watch_namespace from environment");
        config.watch_namespace = Some(value).filter(|v| !v.is_empty());
    }
    if let Some((key, value)) = var("REQUEUE_ON_ERROR_SECS") {
        config.requeue_on_error_secs = parse_secs(&key, &value)?;
    }
    if let Some((_, value)) = var("FIELD_MANAGER") {
        config.field_manager = value;
    }
    if let Some((key, value)) = var("HTTP_TIMEOUT_SECS") {
        config.http_timeout_secs = parse_secs(&key, &value)?;
    }
    if let Some((_, value)) = var("BLOCKED_FUNCTIONS") {
        config.blocked_functions = split_list(&value).map(String::from).collect();
    }
    Ok(())
}

/// Finds the configuration file in the given directory or its parents.
#[must_use]
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Option<std::path::PathBuf> {
    let mut current = start_dir.as_ref().to_path_buf();
    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Some(config_path);
            }
        }
        if !current.pop() {
            return None;
        }
    }
}
