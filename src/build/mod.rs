//! Native allocator build pipeline
//!
//! [`AllocatorBuilder::ensure_built`] produces the platform's static allocator library from the vendored
//! source tree:
//!
//! 1. compute the expected output path for the host toolchain,
//! 2. return immediately when that file already exists (no toolchain is touched),
//! 3. otherwise run the toolchain's [`BuildRecipe`],
//! 4. verify the output exists, distinguishing "build failed" from "build succeeded but the artifact is
//!    missing".
//!
//! Builds are strictly sequential; the recipe mutates the source tree in place. There is no automatic
//! retry: every error is final for the current invocation.
//!
//! ## I/O boundary
//!
//! Toolchain invocations go through the [`CommandRunner`] trait so the pipeline can be exercised without a
//! compiler. [`SystemRunner`] is the real implementation.

pub mod recipe;

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::SystemTime;

use isorun_core::{PlatformProfile, ToolchainKind};
use miette::Diagnostic;
use thiserror::Error;

use crate::config::AllocatorConfig;
use crate::process::{Termination, locate_program, tail_lines};

pub use recipe::{BuildRecipe, BuildStep, expected_output_path};

/// Parallelism used for `make -j` when the core count cannot be determined.
pub const DEFAULT_BUILD_JOBS: usize = 4;

/// Lines of step output kept in a [`BuildError::StepFailed`].
const FAILED_OUTPUT_LINES: usize = 40;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the allocator build pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    #[error("{allocator} source tree not found at {}", path.display())]
    #[diagnostic(
        code(isorun::build::missing_source),
        help("fetch the vendored source first: git submodule update --init --recursive")
    )]
    MissingSource { allocator: String, path: PathBuf },

    #[error("{toolchain} toolchain not found: {detail}")]
    #[diagnostic(
        code(isorun::build::toolchain_missing),
        help("install Visual Studio Build Tools and run from a Developer Command Prompt so MSBuild is on PATH")
    )]
    ToolchainMissing { toolchain: ToolchainKind, detail: String },

    #[error("unsupported platform '{0}': no allocator build recipe")]
    #[diagnostic(
        code(isorun::build::unsupported_platform),
        help("build the allocator by hand and place it at the expected path, or use --docker")
    )]
    UnsupportedPlatform(String),

    #[error("build step '{step}' failed ({status})\n{output}")]
    #[diagnostic(code(isorun::build::step_failed), help("fix the build environment and re-run; no retry is attempted"))]
    StepFailed {
        step: &'static str,
        status: String,
        output: String,
    },

    #[error("build reported success but {} is missing (searched: {searched})", expected.display())]
    #[diagnostic(
        code(isorun::build::artifact_missing),
        help("the toolchain wrote its output under an unexpected name or path")
    )]
    ArtifactMissing { expected: PathBuf, searched: String },

    #[error("failed to launch build step '{step}': {source}")]
    #[diagnostic(code(isorun::build::launch))]
    Launch {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while preparing the allocator: {0}")]
    #[diagnostic(code(isorun::build::io))]
    Io(#[from] io::Error),
}

impl BuildError {
    /// Precondition failures cannot succeed on retry until the environment changes.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BuildError::MissingSource { .. } | BuildError::ToolchainMissing { .. } | BuildError::UnsupportedPlatform(_)
        )
    }
}

// ============================================================================
// Artifact
// ============================================================================

/// Snapshot of the allocator library on disk. Never mutated; re-query instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub source_dir: PathBuf,
    pub expected_output_path: PathBuf,
    pub exists: bool,
    pub size: Option<u64>,
    pub modified_time: Option<SystemTime>,
}

impl BuildArtifact {
    /// Read the current state of `expected_output_path`.
    pub fn query(source_dir: &Path, expected_output_path: &Path) -> Self {
        let metadata = fs::metadata(expected_output_path).ok().filter(|m| m.is_file());
        Self {
            source_dir: source_dir.to_path_buf(),
            expected_output_path: expected_output_path.to_path_buf(),
            exists: metadata.is_some(),
            size: metadata.as_ref().map(|m| m.len()),
            modified_time: metadata.and_then(|m| m.modified().ok()),
        }
    }
}

// ============================================================================
// Command runner boundary
// ============================================================================

/// Captured result of one build step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub success: bool,
    /// Human-readable termination, e.g. `exit code 2`.
    pub status: String,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Executes build steps.
pub trait CommandRunner {
    fn run(&self, step: &BuildStep) -> io::Result<StepOutput>;
}

/// Runs steps as real child processes.
#[derive(Debug, Default)]
pub struct SystemRunner {
    /// Stream step output to the terminal instead of capturing it.
    pub verbose: bool,
}

impl CommandRunner for SystemRunner {
    fn run(&self, step: &BuildStep) -> io::Result<StepOutput> {
        let mut command = Command::new(&step.program);
        command.args(&step.args).current_dir(&step.cwd).stdin(Stdio::null());

        if self.verbose {
            let status = command.stdout(Stdio::inherit()).stderr(Stdio::inherit()).status()?;
            return Ok(StepOutput {
                success: status.success(),
                status: Termination::from_status(status).to_string(),
                output: String::new(),
            });
        }

        let output = command.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(StepOutput {
            success: output.status.success(),
            status: Termination::from_status(output.status).to_string(),
            output: format!("{stdout}\n{stderr}"),
        })
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Drives the allocator build for one host profile.
pub struct AllocatorBuilder<'a, R: CommandRunner> {
    config: &'a AllocatorConfig,
    runner: R,
    search_path: Option<OsString>,
    jobs: usize,
}

impl<'a> AllocatorBuilder<'a, SystemRunner> {
    /// Builder using real child processes, the process `PATH` and the detected core count.
    pub fn system(config: &'a AllocatorConfig, verbose: bool) -> Self {
        AllocatorBuilder::new(config, SystemRunner { verbose })
    }
}

impl<'a, R: CommandRunner> AllocatorBuilder<'a, R> {
    pub fn new(config: &'a AllocatorConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            search_path: std::env::var_os("PATH"),
            jobs: detected_jobs(),
        }
    }

    /// Override the `PATH`-style list used to discover toolchain executables.
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Path the finished library must appear at for `profile`.
    pub fn expected_output_path(&self, profile: &PlatformProfile) -> PathBuf {
        expected_output_path(profile.toolchain_kind, self.config)
    }

    /// Current on-disk state of the artifact, without building.
    pub fn artifact(&self, profile: &PlatformProfile) -> BuildArtifact {
        BuildArtifact::query(&self.config.source_dir, &self.expected_output_path(profile))
    }

    /// Make sure the allocator library exists, building it if needed.
    ///
    /// ## Returns
    /// - (`BuildArtifact`): with `exists == true` on success.
    ///
    /// ## Errors
    /// - [`BuildError::MissingSource`], [`BuildError::ToolchainMissing`], [`BuildError::UnsupportedPlatform`]:
    ///   preconditions; nothing was executed.
    /// - [`BuildError::StepFailed`] / [`BuildError::Launch`]: a recipe step failed.
    /// - [`BuildError::ArtifactMissing`]: every step succeeded but the output is not where it should be.
    pub fn ensure_built(&self, profile: &PlatformProfile) -> Result<BuildArtifact, BuildError> {
        let expected = self.expected_output_path(profile);
        let artifact = BuildArtifact::query(&self.config.source_dir, &expected);
        if artifact.exists {
            tracing::info!(path = %expected.display(), "allocator already built");
            return Ok(artifact);
        }

        if !profile.os_family.is_known() {
            return Err(BuildError::UnsupportedPlatform(profile.os_family.to_string()));
        }

        if !self.config.source_dir.is_dir() {
            return Err(BuildError::MissingSource {
                allocator: self.config.name.clone(),
                path: self.config.source_dir.clone(),
            });
        }

        let recipe = self.select_recipe(profile)?;
        tracing::info!(
            allocator = %self.config.name,
            toolchain = %recipe.toolchain_kind(),
            source = %self.config.source_dir.display(),
            "building allocator"
        );

        for step in recipe.steps() {
            self.run_step(&step)?;
        }

        let candidates = recipe.output_candidates(&self.config.name);
        if !candidates.is_empty() {
            self.collect_output(&candidates, &expected)?;
        }

        let artifact = BuildArtifact::query(&self.config.source_dir, &expected);
        if !artifact.exists {
            return Err(BuildError::ArtifactMissing {
                expected,
                searched: "expected path only".to_string(),
            });
        }

        tracing::info!(path = %expected.display(), size = artifact.size, "allocator built");
        Ok(artifact)
    }

    fn select_recipe(&self, profile: &PlatformProfile) -> Result<BuildRecipe, BuildError> {
        match profile.toolchain_kind {
            ToolchainKind::PosixAutotools => Ok(BuildRecipe::posix(&self.config.source_dir, self.jobs)),
            ToolchainKind::Msvc => {
                let msbuild = locate_program(recipe::MSBUILD_NAMES, self.search_path.as_deref()).ok_or_else(|| {
                    BuildError::ToolchainMissing {
                        toolchain: ToolchainKind::Msvc,
                        detail: "MSBuild was not found on PATH".to_string(),
                    }
                })?;
                tracing::debug!(msbuild = %msbuild.display(), "located MSBuild");
                Ok(BuildRecipe::msvc(profile, self.config, msbuild))
            }
        }
    }

    fn run_step(&self, step: &BuildStep) -> Result<(), BuildError> {
        tracing::info!(step = step.name, "{}", step.display_line());
        let output = self.runner.run(step).map_err(|source| BuildError::Launch {
            step: step.name,
            source,
        })?;

        if output.success {
            tracing::debug!(step = step.name, "step finished");
            return Ok(());
        }
        if !step.required {
            tracing::debug!(step = step.name, status = %output.status, "optional step failed; continuing");
            return Ok(());
        }
        Err(BuildError::StepFailed {
            step: step.name,
            status: output.status,
            output: tail_lines(&output.output, FAILED_OUTPUT_LINES),
        })
    }

    /// Copy the first existing candidate to `expected`.
    fn collect_output(&self, candidates: &[PathBuf], expected: &Path) -> Result<(), BuildError> {
        let Some(found) = candidates.iter().find(|c| c.is_file()) else {
            let searched = candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(BuildError::ArtifactMissing {
                expected: expected.to_path_buf(),
                searched,
            });
        };

        if let Some(parent) = expected.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(found, expected)?;
        tracing::debug!(from = %found.display(), to = %expected.display(), "copied toolchain output");
        Ok(())
    }
}

/// Core count for parallel compiles, falling back to [`DEFAULT_BUILD_JOBS`].
pub fn detected_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_BUILD_JOBS)
}
