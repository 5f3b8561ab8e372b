//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ControllerConfig, ValidationResult};
use crate::error::{GitOpsSetError, Result};
use crate::template::RenderedResource;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Rendered resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "API Version")]
    api_version: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats rendered resources as manifests: a YAML stream for text
    /// output or a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource cannot be serialized.
    pub fn format_manifests(&self, resources: &[RenderedResource]) -> Result<String> {
        let serialize_error = |e: &dyn std::fmt::Display| GitOpsSetError::Internal(format!("failed to serialize manifest: {e}"));
        match self.format {
            OutputFormat::Json => {
                let objects: Vec<_> = resources.iter().map(|r| &r.object).collect();
                serde_json::to_string_pretty(&objects).map_err(|e| serialize_error(&e))
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for resource in resources {
                    output.push_str("---\n");
                    output.push_str(&serde_yaml::to_string(&resource.object).map_err(|e| serialize_error(&e))?);
                }
                Ok(output)
            }
        }
    }

    /// Formats a summary of rendered resources.
    #[must_use]
    pub fn format_summary(&self, set: &str, resources: &[RenderedResource]) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "set": set,
                    "count": resources.len(),
                    "resources": resources.iter().map(|r| &r.reference).collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_summary_text(set, resources),
        }
    }

    fn format_summary_text(set: &str, resources: &[RenderedResource]) -> String {
        if resources.is_empty() {
            return format!("{} GitOpsSet {set} renders no resources.\n", "!".yellow());
        }

        let rows: Vec<ResourceRow> = resources
            .iter()
            .enumerate()
            .map(|(i, r)| ResourceRow {
                index: i + 1,
                kind: r.reference.kind().to_string(),
                namespace: Self::or_dash(r.reference.namespace()),
                name: Self::truncate(r.reference.name(), 40),
                api_version: r.reference.v.clone(),
            })
            .collect();

        let mut output = String::new();
        let _ = writeln!(output, "\nGitOpsSet {}\n", set.bold());
        output.push_str(&Table::new(rows).to_string());
        let _ = writeln!(
            output,
            "\n\n{} {} resources rendered",
            "✓".green(),
            resources.len().to_string().green()
        );
        output
    }

    /// Formats the result of validating the controller configuration.
    #[must_use]
    pub fn format_validation(&self, config: &ControllerConfig, result: &ValidationResult, show_warnings: bool) -> String {
        let generators: Vec<&str> = config.enabled_generators.iter().map(|k| k.as_str()).collect();
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "warnings": result.warnings,
                    "enabled_generators": generators,
                    "watch_namespace": config.watch_namespace,
                    "default_service_account": config.default_service_account,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Generators: {}", generators.join(", "));
                let _ = writeln!(
                    output,
                    "   Namespace: {}",
                    config.watch_namespace.as_deref().unwrap_or("(all)")
                );
                let _ = writeln!(
                    output,
                    "   Service account: {}",
                    config.default_service_account.as_deref().unwrap_or("(controller)")
                );
                let _ = writeln!(output, "   Field manager: {}", config.field_manager);
                output
            }
        }
    }

    fn or_dash(s: &str) -> String {
        if s.is_empty() { String::from("-") } else { s.to_string() }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len - 3).collect();
            format!("{kept}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

    fn config_map(name: &str) -> RenderedResource {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let object = DynamicObject::new(name, &resource).within("default");
        RenderedResource::new(object, true).expect("valid object")
    }

    #[test]
    fn test_summary_table() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_summary("default/demo", &[config_map("a-config"), config_map("b-config")]);
        assert!(text.contains("ConfigMap"));
        assert!(text.contains("a-config"));
        assert!(text.contains("2 resources rendered"));
    }

    #[test]
    fn test_manifests_as_yaml_stream() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_manifests(&[config_map("a"), config_map("b")]).expect("serialized");
        assert_eq!(text.matches("---\n").count(), 2);
        assert!(text.contains("kind: ConfigMap"));
    }

    #[test]
    fn test_manifests_as_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let text = formatter.format_manifests(&[config_map("a")]).expect("serialized");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(parsed[0]["metadata"]["name"], "a");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-name", 10), "a-very-...");
    }
}
