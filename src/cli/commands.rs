//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::process::Command;
use std::time::Instant;

use isorun_core::{PlatformProfile, RunReport, resolve};
use miette::Diagnostic;

use crate::build::{AllocatorBuilder, BuildArtifact, SystemRunner};
use crate::config::IsorunConfig;
use crate::coordinator::{ConsoleReporter, Coordinator, CoordinatorError, CoordinatorOptions, RunMode, WorkerSpec};
use crate::interrupt::{InterruptFlag, install_ctrl_c_watcher};
use crate::matrix::{DockerCompose, MatrixRunner, MatrixSelection};
use crate::native::{NativeError, NativeSuite};
use crate::preload::{self, PreloadSpec};
use crate::process::Termination;
use crate::suite::{self, SuiteError};

use super::summary::Summary;
use super::{CliError, CliResult, ExitCode};

/// Section label for the native-extension executables.
pub const NATIVE_LABEL: &str = "native extension";
/// Section label for the worker-pool suite.
pub const SUITE_LABEL: &str = "python suite";

/// Render a diagnostic with its code and help text.
pub fn render_diagnostic(err: &dyn Diagnostic) -> String {
    let mut out = String::new();
    if miette::GraphicalReportHandler::new().render_report(&mut out, err).is_err() {
        out = err.to_string();
    }
    out
}

// ============================================================================
// Run scope
// ============================================================================

/// Which local suites to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    /// Higher-level language suite only
    Python,
    /// Native-extension executables only
    Native,
}

impl Scope {
    pub fn runs_native(self) -> bool {
        matches!(self, Scope::All | Scope::Native)
    }

    pub fn runs_suite(self) -> bool {
        matches!(self, Scope::All | Scope::Python)
    }
}

/// Options for a local test run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub scope: Scope,
    pub mode: RunMode,
    /// Worker count and build parallelism override.
    pub jobs: Option<usize>,
}

impl RunOptions {
    fn verbose(&self) -> bool {
        self.mode == RunMode::Verbose
    }
}

// ============================================================================
// Allocator preparation (shared between test runs, detect and launch)
// ============================================================================

/// Resolved platform, allocator artifact and preload environment.
struct Prepared {
    profile: PlatformProfile,
    artifact: BuildArtifact,
    preload: PreloadSpec,
}

/// Build the allocator if needed and synthesize the preload environment.
fn prepare_allocator(config: &IsorunConfig, options: &RunOptions) -> CliResult<Prepared> {
    let profile = resolve();
    tracing::info!(%profile, "resolved host platform");

    let mut builder = AllocatorBuilder::system(&config.allocator, options.verbose());
    if let Some(jobs) = options.jobs {
        builder = builder.with_jobs(jobs);
    }
    let artifact = builder
        .ensure_built(&profile)
        .map_err(|e| CliError::failure(render_diagnostic(&e)))?;

    let preload = preload::synthesize(&profile, Some(&artifact), &config.allocator);
    Ok(Prepared {
        profile,
        artifact,
        preload,
    })
}

/// Inspect the allocator without building it.
fn inspect_allocator(config: &IsorunConfig) -> Prepared {
    let profile = resolve();
    let builder = AllocatorBuilder::system(&config.allocator, false);
    let artifact = builder.artifact(&profile);
    let preload = preload::synthesize(&profile, Some(&artifact), &config.allocator);
    Prepared {
        profile,
        artifact,
        preload,
    }
}

fn interrupt_flag() -> InterruptFlag {
    install_ctrl_c_watcher().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not install the Ctrl-C watcher");
        InterruptFlag::new()
    })
}

fn interrupted(message: String) -> CliError {
    CliError::new(message, ExitCode::INTERRUPTED)
}

// ============================================================================
// Local test run
// ============================================================================

/// Build the allocator, then run the requested local suites.
///
/// ## Returns
/// - `ExitCode::SUCCESS` iff every requested sub-run produced a report in which every test passed.
///
/// ## Notes
/// - A failing section (build error, collection error) is recorded and the next section still runs.
/// - An interrupt stops the run immediately with `ExitCode::INTERRUPTED` after all workers are reaped.
pub fn run_tests(config: &IsorunConfig, options: &RunOptions) -> CliResult<ExitCode> {
    let start = Instant::now();
    let prepared = prepare_allocator(config, options)?;
    let flag = interrupt_flag();
    let mut reporter = ConsoleReporter::new(options.mode);
    let mut summary = Summary::new();

    if options.scope.runs_native() {
        let mut native = NativeSuite::new(
            &config.native,
            SystemRunner {
                verbose: options.verbose(),
            },
            &config.suite.crash_signatures,
        )
        .with_interrupt(flag.clone());
        if let Some(jobs) = options.jobs {
            native = native.with_jobs(jobs);
        }

        match native.run(NATIVE_LABEL, &prepared.preload, &mut reporter) {
            Ok(report) => summary.push_report(report),
            Err(e @ NativeError::Interrupted { .. }) => return Err(interrupted(render_diagnostic(&e))),
            Err(e) => {
                eprintln!("{}", render_diagnostic(&e));
                summary.push_error(NATIVE_LABEL, e.to_string());
            }
        }
    }

    if options.scope.runs_suite() {
        match run_suite(config, options, &prepared.preload, flag, &mut reporter) {
            Ok(report) => summary.push_report(report),
            Err(SuiteRunError::Interrupted(e)) => return Err(interrupted(render_diagnostic(&e))),
            Err(SuiteRunError::Setup(message, rendered)) => {
                eprintln!("{rendered}");
                summary.push_error(SUITE_LABEL, message);
            }
        }
    }

    print!("{}", summary.render(start.elapsed()));
    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

enum SuiteRunError {
    Interrupted(CoordinatorError),
    /// Plain message for the summary, rendered diagnostic for stderr.
    Setup(String, String),
}

impl From<SuiteError> for SuiteRunError {
    fn from(e: SuiteError) -> Self {
        SuiteRunError::Setup(e.to_string(), render_diagnostic(&e))
    }
}

fn run_suite(
    config: &IsorunConfig,
    options: &RunOptions,
    preload: &PreloadSpec,
    flag: InterruptFlag,
    reporter: &mut ConsoleReporter,
) -> Result<RunReport, SuiteRunError> {
    let tests = suite::collect(&config.suite.collect_command, config.root.as_deref(), preload)?;
    let mut spec = WorkerSpec::from_command_line(&config.suite.worker_command, preload.clone())
        .ok_or(SuiteError::EmptyCommand("worker"))?;
    spec.cwd = config.root.clone();
    let coordinator_options = CoordinatorOptions::from_config(&config.suite, options.jobs)
        .map_err(|e| SuiteRunError::Setup(e.to_string(), render_diagnostic(&e)))?;

    Coordinator::new(spec, coordinator_options)
        .with_interrupt(flag)
        .run(SUITE_LABEL, &tests, reporter)
        .map_err(SuiteRunError::Interrupted)
}

// ============================================================================
// Container matrix
// ============================================================================

/// Run the container matrix for a `--docker` selection.
pub fn run_matrix(config: &IsorunConfig, platform: &str) -> CliResult<ExitCode> {
    let start = Instant::now();
    let selection = MatrixSelection::parse(platform).map_err(|e| CliError::failure(render_diagnostic(&e)))?;

    let engine = DockerCompose::new(&config.matrix.compose_file);
    let runner = MatrixRunner::new(engine, &config.matrix.services);
    let matrix = runner
        .run_matrix(selection)
        .map_err(|e| CliError::failure(render_diagnostic(&e)))?;

    for run in &matrix.targets {
        if let Err(e) = &run.result {
            eprintln!("{}", render_diagnostic(e));
        }
    }

    let mut summary = Summary::new();
    summary.push_matrix(matrix);
    print!("{}", summary.render(start.elapsed()));
    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ============================================================================
// Allocator helpers
// ============================================================================

/// Print the allocator and preload status for this host.
///
/// ## Returns
/// - `ExitCode::SUCCESS` when a preloadable library was found, `ExitCode::FAILURE` otherwise.
pub fn detect(config: &IsorunConfig) -> CliResult<ExitCode> {
    let Prepared {
        profile,
        artifact,
        preload,
    } = inspect_allocator(config);

    println!("platform:  {profile}");
    println!(
        "allocator: {} ({})",
        artifact.expected_output_path.display(),
        if artifact.exists { "built" } else { "not built" }
    );

    let Some(variable) = preload.variable_name else {
        println!("preload:   not available on {} (the allocator is linked statically)", profile.os_family);
        return Ok(if artifact.exists {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    };

    match (preload.libraries.first(), preload.export_line()) {
        (Some(library), Some(export)) => {
            println!("preload:   {variable}={}", library.display());
            println!();
            println!("To enable it in your shell:");
            println!("  {export}");
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            println!("preload:   no preloadable {} library found", config.allocator.name);
            let instructions = preload::install_instructions(&profile.os_family);
            if !instructions.is_empty() {
                println!();
                println!("Install it with:");
                for line in instructions {
                    println!("  {line}");
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Run a program with the allocator preloaded, propagating its exit status.
pub fn launch(config: &IsorunConfig, argv: &[String]) -> CliResult<ExitCode> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CliError::failure("Error: launch requires a program to run"))?;
    let Prepared { preload, .. } = inspect_allocator(config);

    let mut command = Command::new(program);
    command.args(args);
    preload.apply(&mut command);

    let status = command
        .status()
        .map_err(|e| CliError::failure(format!("Error: failed to launch {program}: {e}")))?;
    Ok(exit_code_for(Termination::from_status(status)))
}

/// Shell-style exit code for a child's termination (`128 + signal` for signals).
pub fn exit_code_for(termination: Termination) -> ExitCode {
    match termination {
        Termination::Success => ExitCode::SUCCESS,
        Termination::ExitCode(code) => ExitCode(code),
        Termination::Signal(signal) => ExitCode(128 + signal),
        Termination::Unknown => ExitCode::FAILURE,
    }
}
