//! Configuration loading from `isorun.toml`
//!
//! The file is optional. It is discovered by walking up from the current directory, and every field has a
//! default so an absent file reproduces the built-in behaviour.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

use crate::coordinator::WORKER_HOST_SOURCE;

/// File name searched for by [`IsorunConfig::discover`].
pub const CONFIG_FILE_NAME: &str = "isorun.toml";

/// Errors while loading configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    #[diagnostic(code(isorun::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    #[diagnostic(code(isorun::config::parse))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration '{0}'")]
    #[diagnostic(code(isorun::config::duration), help("use a number with a unit suffix: ns, us, ms, s or m (e.g. \"90s\")"))]
    InvalidDuration(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IsorunConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub suite: SuiteConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
    /// Directory of the loaded file. Relative paths have been resolved against it and the suite commands
    /// run from it. `None` for built-in defaults.
    #[serde(skip)]
    pub root: Option<PathBuf>,
}

/// Allocator build and preload settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// Library base name; `jemalloc` produces `libjemalloc.a` / `jemalloc.lib`.
    #[serde(default = "default_allocator_name")]
    pub name: String,
    /// Vendored allocator source tree.
    #[serde(default = "default_allocator_source")]
    pub source_dir: PathBuf,
    /// Solution file for the MSVC recipe, relative to `source_dir`.
    #[serde(default = "default_msvc_solution")]
    pub msvc_solution: PathBuf,
    #[serde(default = "default_msvc_configuration")]
    pub msvc_configuration: String,
    /// Additional shared-library locations checked before the built-in install locations.
    #[serde(default)]
    pub extra_preload_paths: Vec<PathBuf>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            name: default_allocator_name(),
            source_dir: default_allocator_source(),
            msvc_solution: default_msvc_solution(),
            msvc_configuration: default_msvc_configuration(),
            extra_preload_paths: Vec::new(),
        }
    }
}

fn default_allocator_name() -> String {
    "jemalloc".to_string()
}
fn default_allocator_source() -> PathBuf {
    PathBuf::from("deps/jemalloc")
}
fn default_msvc_solution() -> PathBuf {
    PathBuf::from("msvc/jemalloc_vc2022.sln")
}
fn default_msvc_configuration() -> String {
    "Release-static".to_string()
}

/// Native-extension build and test executables.
#[derive(Debug, Clone, Deserialize)]
pub struct NativeConfig {
    #[serde(default = "default_native_source")]
    pub source_dir: PathBuf,
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// Extra arguments for the configure step (e.g. `-DCMAKE_BUILD_TYPE=Debug`).
    #[serde(default = "default_configure_args")]
    pub configure_args: Vec<String>,
    /// Test executables located by fixed name under `build_dir`.
    #[serde(default = "default_test_executables")]
    pub test_executables: Vec<String>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            source_dir: default_native_source(),
            build_dir: default_build_dir(),
            configure_args: default_configure_args(),
            test_executables: default_test_executables(),
        }
    }
}

fn default_native_source() -> PathBuf {
    PathBuf::from(".")
}
fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}
fn default_configure_args() -> Vec<String> {
    vec!["-DCMAKE_BUILD_TYPE=Debug".to_string()]
}
fn default_test_executables() -> Vec<String> {
    ["test_router", "test_advanced_router", "test_server_integration", "test_validation_engine"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Higher-level test suite distributed across worker processes.
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteConfig {
    /// Command printing one test identifier per line.
    #[serde(default = "default_collect_command")]
    pub collect_command: Vec<String>,
    /// Worker host launch line; speaks the line protocol on stdin/stdout.
    #[serde(default = "default_worker_command")]
    pub worker_command: Vec<String>,
    /// Worker process count; `None` uses the available cores.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Per-test timeout (e.g. `"120s"`); unset means wait for the worker.
    #[serde(default)]
    pub test_timeout: Option<String>,
    /// Consecutive idle deaths after which a worker slot is retired.
    #[serde(default = "default_max_idle_restarts")]
    pub max_idle_restarts: u32,
    /// Log markers that up-classify a `failed` outcome to `crashed`.
    #[serde(default = "default_crash_signatures")]
    pub crash_signatures: Vec<String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            collect_command: default_collect_command(),
            worker_command: default_worker_command(),
            workers: None,
            test_timeout: None,
            max_idle_restarts: default_max_idle_restarts(),
            crash_signatures: default_crash_signatures(),
        }
    }
}

fn default_collect_command() -> Vec<String> {
    ["python", "-m", "pytest", "--collect-only", "-q", "tests/python"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_worker_command() -> Vec<String> {
    ["python", "-c", WORKER_HOST_SOURCE, "--tb=short"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_idle_restarts() -> u32 {
    3
}
fn default_crash_signatures() -> Vec<String> {
    ["Segmentation fault", "SIGSEGV", "Fatal Python error", "double free or corruption", "SIGABRT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Container matrix settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixConfig {
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    #[serde(default)]
    pub services: ServiceNames,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            services: ServiceNames::default(),
        }
    }
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker/docker-compose.yml")
}

/// Compose service run for each platform target.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceNames {
    #[serde(default = "default_linux_service")]
    pub linux: String,
    #[serde(default = "default_windows_service")]
    pub windows: String,
    #[serde(default = "default_windows_sim_service")]
    pub windows_sim: String,
}

impl Default for ServiceNames {
    fn default() -> Self {
        Self {
            linux: default_linux_service(),
            windows: default_windows_service(),
            windows_sim: default_windows_sim_service(),
        }
    }
}

fn default_linux_service() -> String {
    "tests-linux".to_string()
}
fn default_windows_service() -> String {
    "tests-windows".to_string()
}
fn default_windows_sim_service() -> String {
    "tests-windows-sim".to_string()
}

impl IsorunConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let root = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.rebase(&root);
        Ok(config)
    }

    /// Resolve every relative path against `root` and remember it as the project root.
    ///
    /// `msvc_solution` stays relative to `allocator.source_dir`.
    pub fn rebase(&mut self, root: &Path) {
        rebase_path(root, &mut self.allocator.source_dir);
        for path in &mut self.allocator.extra_preload_paths {
            rebase_path(root, path);
        }
        rebase_path(root, &mut self.native.source_dir);
        rebase_path(root, &mut self.native.build_dir);
        rebase_path(root, &mut self.matrix.compose_file);
        self.root = Some(root.to_path_buf());
    }

    /// Find `isorun.toml` by walking up from `start`.
    pub fn find_from(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Discover and load configuration starting at the current directory.
    ///
    /// Returns the defaults when no file exists; a file that exists but fails to parse is an error.
    pub fn discover() -> Result<Self, ConfigError> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok(Self::default());
        };
        match Self::find_from(&cwd) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading configuration");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parsed `[suite] test_timeout`.
    pub fn test_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.suite.test_timeout.as_deref().map(parse_duration).transpose()
    }
}

fn rebase_path(root: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = root.join(&*path);
    }
}

/// Parse a duration string (`"3s"`, `"500ms"`, `"2m"`); a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidDuration(s.to_string()));
    }

    let (num_part, unit_part) = trimmed
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| trimmed.split_at(i))
        .unwrap_or((trimmed, "s"));

    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidDuration(s.to_string()));
    }

    let nanos_per_unit: f64 = match unit_part.to_lowercase().as_str() {
        "ns" => 1.0,
        "us" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => 1_000_000_000.0,
        "m" | "min" => 60_000_000_000.0,
        _ => return Err(ConfigError::InvalidDuration(s.to_string())),
    };

    Ok(Duration::from_nanos((value * nanos_per_unit) as u64))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IsorunConfig::default();
        assert_eq!(config.allocator.source_dir, PathBuf::from("deps/jemalloc"));
        assert_eq!(config.native.test_executables.len(), 4);
        assert_eq!(config.suite.max_idle_restarts, 3);
        assert!(config.suite.crash_signatures.iter().any(|s| s == "Segmentation fault"));
        assert_eq!(config.matrix.services.windows_sim, "tests-windows-sim");
        assert_eq!(config.test_timeout().unwrap(), None);
    }

    #[test]
    fn test_default_worker_command_runs_bundled_host() {
        let command = IsorunConfig::default().suite.worker_command;
        assert_eq!(&command[..2], ["python", "-c"]);
        assert_eq!(command[2], WORKER_HOST_SOURCE);
        assert!(WORKER_HOST_SOURCE.contains("import pytest"));
        assert!(WORKER_HOST_SOURCE.contains(r#""event": "result""#));
        assert_eq!(command[3], "--tb=short");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3 fortnights").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let toml_str = r#"
            [suite]
            workers = 4
            test_timeout = "90s"
            crash_signatures = ["boom"]

            [matrix.services]
            linux = "ci-linux"
        "#;

        let config: IsorunConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.suite.workers, Some(4));
        assert_eq!(config.test_timeout().unwrap(), Some(Duration::from_secs(90)));
        assert_eq!(config.suite.crash_signatures, vec!["boom".to_string()]);
        assert_eq!(config.matrix.services.linux, "ci-linux");
        assert_eq!(config.matrix.services.windows, "tests-windows");
        assert_eq!(config.allocator.name, "jemalloc");
    }

    #[test]
    fn test_find_from_walks_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "[allocator]\nname = \"mimalloc\"\n").unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = IsorunConfig::find_from(&nested).unwrap();
        assert_eq!(found, root.path().join(CONFIG_FILE_NAME));
        assert_eq!(IsorunConfig::load(found).unwrap().allocator.name, "mimalloc");
    }

    #[test]
    fn test_load_resolves_paths_against_config_dir() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "[native]\nbuild_dir = \"out/cmake\"\nsource_dir = \"/abs/src\"\n",
        )
        .unwrap();
        let nested = root.path().join("tests/python");
        std::fs::create_dir_all(&nested).unwrap();

        let config = IsorunConfig::load(IsorunConfig::find_from(&nested).unwrap()).unwrap();
        assert_eq!(config.root.as_deref(), Some(root.path()));
        assert_eq!(config.allocator.source_dir, root.path().join("deps/jemalloc"));
        assert_eq!(config.native.build_dir, root.path().join("out/cmake"));
        assert_eq!(config.native.source_dir, PathBuf::from("/abs/src"));
        assert_eq!(config.matrix.compose_file, root.path().join("docker/docker-compose.yml"));
        assert_eq!(config.allocator.msvc_solution, PathBuf::from("msvc/jemalloc_vc2022.sln"));
    }

    #[test]
    fn test_defaults_have_no_root() {
        assert!(IsorunConfig::default().root.is_none());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[suite\nworkers = ").unwrap();
        assert!(matches!(IsorunConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
