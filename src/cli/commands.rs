//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// GitOpsSets - render and apply Kubernetes resources from generated elements.
#[derive(Parser, Debug)]
#[command(name = "gitopssets")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the controller configuration file.
    #[arg(short, long, global = true, env = "GITOPSSETS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format.
    #[arg(long, global = true, default_value = "text", env = "GITOPSSETS_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller against the current cluster.
    Controller,

    /// Render a GitOpsSet offline and print the resulting resources.
    Render {
        /// YAML file holding the GitOpsSet, followed by any objects its
        /// generators read (ConfigMaps, sources, ImagePolicies).
        file: PathBuf,

        /// Print a summary table instead of the manifests.
        #[arg(short, long)]
        summary: bool,
    },

    /// Print the GitOpsSet CustomResourceDefinition.
    Crd,

    /// Validate the controller configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// Format of log lines.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render() {
        let cli = Cli::try_parse_from(["gitopssets", "render", "set.yaml", "--summary", "--output", "json"])
            .expect("valid arguments");
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Render { file, summary } => {
                assert_eq!(file, PathBuf::from("set.yaml"));
                assert!(summary);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["gitopssets", "controller", "-v", "--log-format", "json"])
            .expect("valid arguments");
        assert!(cli.verbose);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Controller));
    }

    #[test]
    fn test_rejects_unknown_output() {
        assert!(Cli::try_parse_from(["gitopssets", "crd", "--output", "xml"]).is_err());
    }
}
