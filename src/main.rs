//! GitOpsSets CLI entrypoint.
//!
//! This is the main entrypoint for the gitopssets command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gitopssets_controller::api::GitOpsSet;
use gitopssets_controller::cli::{Cli, Commands, LogFormat, OutputFormatter, RenderInput, render_offline};
use gitopssets_controller::config::{
    ConfigParser, ConfigValidator, ControllerConfig, ValidationResult, find_config_file,
};
use gitopssets_controller::controller;
use gitopssets_controller::error::{GitOpsSetError, Result};

use clap::Parser;
use kube::CustomResourceExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Controller => cmd_controller(cli.config.as_deref()).await,
        Commands::Render { file, summary } => {
            cmd_render(cli.config.as_deref(), &file, summary, &formatter).await
        }
        Commands::Crd => cmd_crd(),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_deref(), warnings, &formatter),
    }
}

/// Run the controller until a shutdown signal arrives.
async fn cmd_controller(config_path: Option<&Path>) -> Result<()> {
    let (config, result) = load_config(config_path)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    controller::run(config).await
}

/// Render a GitOpsSet file offline.
async fn cmd_render(
    config_path: Option<&Path>,
    file: &Path,
    summary: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    info!("Rendering GitOpsSet from: {}", file.display());

    let content = std::fs::read_to_string(file)?;
    let input = RenderInput::parse(&content)?;
    let resources = render_offline(&input, &config).await?;

    let output = if summary {
        formatter.format_summary(&input.set.namespaced_name(), &resources)
    } else {
        formatter.format_manifests(&resources)?
    };
    write_stdout(&output)
}

/// Print the CustomResourceDefinition.
fn cmd_crd() -> Result<()> {
    let crd = serde_yaml::to_string(&GitOpsSet::crd())
        .map_err(|e| GitOpsSetError::Internal(format!("failed to serialize CRD: {e}")))?;
    write_stdout(&crd)
}

/// Validate the controller configuration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, result) = load_config(config_path)?;
    eprint!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(())
}

/// Loads `.env`, the configuration file and environment overrides, then
/// validates the result.
fn load_config(config_path: Option<&Path>) -> Result<(ControllerConfig, ValidationResult)> {
    let config_file = resolve_config_path(config_path)?;
    let base = config_file
        .as_deref()
        .and_then(Path::parent)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(base);
    parser.load_dotenv()?;
    let config = parser.load_with_env(config_file.as_deref())?;
    let result = ConfigValidator::new().validate(&config)?;
    debug!(?config, "Loaded controller configuration");
    Ok((config, result))
}

/// Resolves the configuration file: the explicit path, or the nearest
/// `gitopssets.yaml` above the working directory. No file is fine.
fn resolve_config_path(config_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = config_path {
        return Ok(Some(path.to_path_buf()));
    }
    let current_dir = std::env::current_dir()?;
    Ok(find_config_file(current_dir))
}

fn write_stdout(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}
