//! CLI module for the Trellis reconciler.
//!
//! This module provides the command-line interface for planning and
//! applying declared resource topologies.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
