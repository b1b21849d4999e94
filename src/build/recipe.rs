//! Toolchain-specific build recipes for the allocator.
//!
//! One variant per [`ToolchainKind`]; adding a platform means adding a variant and its step list here.

use std::path::{Path, PathBuf};

use isorun_core::{Arch, PlatformProfile, ToolchainKind};

use crate::config::AllocatorConfig;

/// Feature flags passed to `configure`: static-only, profiling and stats on, debug off, PIC, and
/// TLS model pinned so the archive can be linked into a preloaded shared object.
pub const CONFIGURE_FLAGS: &[&str] = &[
    "--enable-static",
    "--disable-shared",
    "--enable-prof",
    "--enable-stats",
    "--disable-debug",
    "--with-pic",
    "--disable-initial-exec-tls",
];

/// MSBuild executable names, in preference order.
pub const MSBUILD_NAMES: &[&str] = &["MSBuild.exe", "msbuild.exe", "msbuild"];

/// Platform toolset suffixes seen on the solution's output file, newest first.
const MSVC_TOOLSETS: &[&str] = &["vc143", "vc142", "vc141", "vc140"];

/// One external command in a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Stable step name used in logs and errors (`clean`, `autoconf`, `configure`, `compile`).
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// A failing optional step is logged and skipped.
    pub required: bool,
}

impl BuildStep {
    pub fn new(name: &'static str, program: impl Into<PathBuf>, args: Vec<String>, cwd: &Path) -> Self {
        Self {
            name,
            program: program.into(),
            args,
            cwd: cwd.to_path_buf(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Render as a shell-like line for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Build recipe selected from the host toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRecipe {
    PosixAutotools {
        source_dir: PathBuf,
        jobs: usize,
    },
    Msvc {
        source_dir: PathBuf,
        msbuild: PathBuf,
        solution: PathBuf,
        configuration: String,
        platform: &'static str,
    },
}

impl BuildRecipe {
    /// Recipe for an autotools host.
    pub fn posix(source_dir: &Path, jobs: usize) -> Self {
        BuildRecipe::PosixAutotools {
            source_dir: source_dir.to_path_buf(),
            jobs: jobs.max(1),
        }
    }

    /// Recipe for an MSVC host; `msbuild` must already have been located.
    pub fn msvc(profile: &PlatformProfile, config: &AllocatorConfig, msbuild: PathBuf) -> Self {
        let platform = match profile.arch {
            Arch::Aarch64 => "ARM64",
            _ => "x64",
        };
        BuildRecipe::Msvc {
            source_dir: config.source_dir.clone(),
            msbuild,
            solution: config.msvc_solution.clone(),
            configuration: config.msvc_configuration.clone(),
            platform,
        }
    }

    pub fn toolchain_kind(&self) -> ToolchainKind {
        match self {
            BuildRecipe::PosixAutotools { .. } => ToolchainKind::PosixAutotools,
            BuildRecipe::Msvc { .. } => ToolchainKind::Msvc,
        }
    }

    /// Ordered steps for this recipe, planned against the current state of the source tree.
    ///
    /// ## Notes
    /// - Autotools: stale state from an earlier configure (a generated `Makefile`) is cleaned first, and
    ///   `configure` is regenerated with `autoconf` when the tree is a bare checkout.
    pub fn steps(&self) -> Vec<BuildStep> {
        match self {
            BuildRecipe::PosixAutotools { source_dir, jobs } => {
                let mut steps = Vec::new();
                if source_dir.join("Makefile").is_file() {
                    steps.push(BuildStep::new("clean", "make", vec!["distclean".to_string()], source_dir).optional());
                }
                if !source_dir.join("configure").is_file() {
                    steps.push(BuildStep::new("autoconf", "autoconf", Vec::new(), source_dir));
                }
                let mut configure_args = vec!["./configure".to_string()];
                configure_args.extend(CONFIGURE_FLAGS.iter().map(|f| f.to_string()));
                steps.push(BuildStep::new("configure", "sh", configure_args, source_dir));
                steps.push(BuildStep::new("compile", "make", vec![format!("-j{jobs}")], source_dir));
                steps
            }
            BuildRecipe::Msvc {
                source_dir,
                msbuild,
                solution,
                configuration,
                platform,
            } => vec![BuildStep::new(
                "compile",
                msbuild.clone(),
                vec![
                    solution.display().to_string(),
                    format!("/p:Configuration={configuration}"),
                    format!("/p:Platform={platform}"),
                    "/m".to_string(),
                ],
                source_dir,
            )],
        }
    }

    /// Output files the toolchain may have produced, in search order.
    ///
    /// Empty for recipes that write straight to the expected path.
    pub fn output_candidates(&self, name: &str) -> Vec<PathBuf> {
        match self {
            BuildRecipe::PosixAutotools { .. } => Vec::new(),
            BuildRecipe::Msvc {
                source_dir,
                configuration,
                platform,
                ..
            } => {
                let out_dir = source_dir.join("msvc").join(platform).join(configuration);
                let mut candidates: Vec<PathBuf> = MSVC_TOOLSETS
                    .iter()
                    .map(|toolset| out_dir.join(format!("{name}-{toolset}-{configuration}.lib")))
                    .collect();
                candidates.push(out_dir.join(format!("{name}.lib")));
                candidates
            }
        }
    }
}

/// Where the finished library must end up for a given toolchain.
pub fn expected_output_path(toolchain: ToolchainKind, config: &AllocatorConfig) -> PathBuf {
    let lib_dir = config.source_dir.join("lib");
    match toolchain {
        ToolchainKind::PosixAutotools => lib_dir.join(format!("lib{}.a", config.name)),
        ToolchainKind::Msvc => lib_dir.join(format!("{}.lib", config.name)),
    }
}
