//! CLI module for the GitOpsSet controller.
//!
//! This module provides the command-line interface: running the
//! controller, rendering sets offline and printing the CRD.

mod commands;
mod output;
mod render;

pub use commands::{Cli, Commands, LogFormat, OutputFormat};
pub use output::OutputFormatter;
pub use render::{RenderInput, render_offline};
