//! Configuration module for the GitOpsSet controller.
//!
//! This module handles controller configuration:
//! - Parsing the optional `gitopssets.yaml`
//! - `GITOPSSETS_*` environment overrides and `.env` loading
//! - Validation of configuration values

mod parser;
mod spec;
mod validator;

pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX, apply_overrides, find_config_file};
pub use spec::ControllerConfig;
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
