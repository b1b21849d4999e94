//! CLI module for isorun
//!
//! This module provides the command-line interface.
//!
//! ## Usage
//!
//! - `isorun [-a|-p|-c] [-v]` - Build the allocator, then run the local suites
//! - `isorun --docker [linux|windows|windows-sim|all]` - Run the container matrix
//! - `isorun detect` - Show allocator and preload status
//! - `isorun launch -- <program> [args...]` - Run a program with the allocator preloaded
//!
//! ## Modules
//!
//! - `commands` - Command implementations
//! - `summary` - Final result aggregation
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod summary;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgGroup, Parser, Subcommand};

use crate::config::IsorunConfig;
use crate::coordinator::RunMode;
use crate::version::ISORUN_VERSION;

use commands::{RunOptions, Scope};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
    /// Conventional code for a run stopped by Ctrl-C (128 + SIGINT).
    pub const INTERRUPTED: ExitCode = ExitCode(130);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    /// Create a new CLI error with a message and exit code.
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Allocator build pipeline and crash-isolating test orchestrator
#[derive(Parser, Debug)]
#[command(name = "isorun")]
#[command(version = ISORUN_VERSION)]
#[command(about = "Build the native allocator and run test suites in isolated worker processes", long_about = None)]
#[command(group(ArgGroup::new("scope").args(["all", "python", "c"]).multiple(false)))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Run every local suite (default)
    #[arg(short = 'a', long = "all")]
    pub all: bool,

    /// Run only the higher-level language suite
    #[arg(short = 'p', long = "python")]
    pub python: bool,

    /// Run only the native-extension test executables
    #[arg(short = 'c', long = "c")]
    pub c: bool,

    /// Verbose output (per-test lines, build output, debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run the container matrix instead of local suites
    #[arg(
        long,
        value_name = "PLATFORM",
        num_args = 0..=1,
        default_missing_value = "all",
        conflicts_with = "scope"
    )]
    pub docker: Option<String>,

    /// Configuration file (default: isorun.toml found by walking up from the current directory)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Worker processes and build parallelism (default: available cores)
    #[arg(short = 'n', long = "jobs", value_name = "N")]
    pub jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the allocator artifact and preload status for this host
    Detect,

    /// Run a program with the allocator preloaded
    Launch {
        /// Program and its arguments
        #[arg(value_name = "PROGRAM", required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

impl Cli {
    /// Local run scope selected by the flags.
    pub fn scope(&self) -> Scope {
        if self.python {
            Scope::Python
        } else if self.c {
            Scope::Native
        } else {
            Scope::All
        }
    }

    pub fn mode(&self) -> RunMode {
        if self.verbose { RunMode::Verbose } else { RunMode::Quiet }
    }

    /// Default tracing filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose { "isorun=debug" } else { "isorun=info" }
    }
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
/// `main` parses first so logging can be configured from the parsed flags.
pub fn run(cli: Cli) {
    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Some(Command::Detect) => return commands::detect(&config),
        Some(Command::Launch { argv }) => return commands::launch(&config, argv),
        None => {}
    }

    if let Some(platform) = &cli.docker {
        return commands::run_matrix(&config, platform);
    }

    let options = RunOptions {
        scope: cli.scope(),
        mode: cli.mode(),
        jobs: cli.jobs,
    };
    commands::run_tests(&config, &options)
}

/// Load `--config`, or discover `isorun.toml`, or fall back to defaults.
fn load_config(path: Option<&Path>) -> CliResult<IsorunConfig> {
    let loaded = match path {
        Some(path) => IsorunConfig::load(path),
        None => IsorunConfig::discover(),
    };
    loaded.map_err(|e| CliError::failure(commands::render_diagnostic(&e)))
}

// ============================================================================
// Tests
// ============================================================================
