//! Command line interface for mipack.
//!
//! This module provides argument parsing, command execution, and colored
//! user feedback for the assembly pipeline.

mod args;
mod commands;
mod output;

pub use args::{Args, BuildArgs, Command};
pub use commands::{BUILD_REPORT_FILE, execute_command};
pub use output::Console;

use crate::error::Result;

/// Main CLI entry point
pub async fn run() -> Result<i32> {
    let args = Args::parse_args();
    execute_command(args).await
}
