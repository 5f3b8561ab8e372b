//! Configuration validation for the controller.
//!
//! Checks values that deserialize fine but cannot work at runtime, and
//! collects warnings for settings that are legal but probably unintended.

use crate::api::GeneratorKind;
use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::ControllerConfig;

/// Longest Kubernetes object name, namespace or service account.
const MAX_NAME_LEN: usize = 63;

/// Validator for controller configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a controller configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn validate(&self, config: &ControllerConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_generators(config, &mut result);
        Self::validate_identity(config, &mut result);
        Self::validate_timing(config, &mut result);

        if result.errors.is_empty() {
            debug!(warnings = result.warnings.len(), "Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConfigError::validation(first_error.message.clone(), first_error.field.clone()).into())
        }
    }

    fn validate_generators(config: &ControllerConfig, result: &mut ValidationResult) {
        if config.enabled_generators.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("enabled_generators"),
                message: String::from("At least one generator must be enabled"),
            });
            return;
        }

        let mut seen = HashSet::new();
        for kind in &config.enabled_generators {
            if !seen.insert(*kind) {
                result.warnings.push(format!("Generator {kind} is listed more than once"));
            }
        }
        if config.is_enabled(GeneratorKind::PullRequests) {
            result.warnings.push(String::from(
                "PullRequests has no built-in implementation and stays disabled",
            ));
        }
        if config.is_enabled(GeneratorKind::Matrix)
            && config.enabled_generators.iter().all(|k| *k == GeneratorKind::Matrix)
        {
            result.warnings.push(String::from(
                "Matrix is enabled without any generator to nest",
            ));
        }
    }

    fn validate_identity(config: &ControllerConfig, result: &mut ValidationResult) {
        if config.field_manager.trim().is_empty() {
            result.errors.push(ValidationError {
                field: String::from("field_manager"),
                message: String::from("Field manager cannot be empty"),
            });
        }
        if let Some(account) = &config.default_service_account
            && !is_valid_name(account)
        {
            result.errors.push(ValidationError {
                field: String::from("default_service_account"),
                message: format!(
                    "Service account '{account}' is invalid. Must be lowercase alphanumeric with hyphens."
                ),
            });
        }
        if let Some(namespace) = &config.watch_namespace
            && !is_valid_name(namespace)
        {
            result.errors.push(ValidationError {
                field: String::from("watch_namespace"),
                message: format!(
                    "Namespace '{namespace}' is invalid. Must be lowercase alphanumeric with hyphens."
                ),
            });
        }
    }

    fn validate_timing(config: &ControllerConfig, result: &mut ValidationResult) {
        if config.requeue_on_error_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("requeue_on_error_secs"),
                message: String::from("Requeue delay must be at least 1 second"),
            });
        }
        if config.http_timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("http_timeout_secs"),
                message: String::from("HTTP timeout must be at least 1 second"),
            });
        }
    }
}

/// Validates a DNS-1123 label: lowercase alphanumeric with hyphens, starting
/// and ending with an alphanumeric character.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
