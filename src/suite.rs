//! Test-suite discovery for the higher-level language scope.
//!
//! The collect command prints one test identifier per line. Blank lines, `#` comments and anything
//! containing whitespace (pytest's `N tests collected in 0.2s` footer, warnings) are ignored.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use miette::Diagnostic;
use thiserror::Error;

use crate::preload::PreloadSpec;
use crate::process::{Termination, tail_lines};

#[derive(Debug, Error, Diagnostic)]
pub enum SuiteError {
    #[error("the {0} command is empty")]
    #[diagnostic(code(isorun::suite::empty_command), help("set it in the [suite] section of isorun.toml"))]
    EmptyCommand(&'static str),

    #[error("failed to launch collect command `{program}`: {source}")]
    #[diagnostic(code(isorun::suite::launch))]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("test collection failed ({status})\n{output}")]
    #[diagnostic(
        code(isorun::suite::collect_failed),
        help("run the collect command by hand to see the import or syntax error")
    )]
    CollectFailed { status: Termination, output: String },
}

/// Test identifiers from collect output, in first-seen order without duplicates.
pub fn parse_collected(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.contains(char::is_whitespace))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

/// Run the collect command and return the suite.
///
/// The preload environment is applied so collection imports the extension the same way the workers will.
pub fn collect(command: &[String], cwd: Option<&Path>, preload: &PreloadSpec) -> Result<Vec<String>, SuiteError> {
    let (program, args) = command.split_first().ok_or(SuiteError::EmptyCommand("collect"))?;
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    preload.apply(&mut cmd);

    tracing::debug!(program = %program, "collecting tests");
    let output = cmd.output().map_err(|source| SuiteError::Launch {
        program: program.clone(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SuiteError::CollectFailed {
            status: Termination::from_status(output.status),
            output: tail_lines(&format!("{stdout}\n{stderr}"), 40),
        });
    }

    let suite = parse_collected(&stdout);
    tracing::info!(tests = suite.len(), "collected tests");
    Ok(suite)
}
