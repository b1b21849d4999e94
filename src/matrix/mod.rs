//! Containerized platform matrix runner
//!
//! Builds and runs one container service per requested [`PlatformTarget`]; the container executes the
//! whole build-and-test pipeline and its exit status becomes that target's outcome.
//!
//! ## Target policy
//!
//! - An explicitly requested target the engine cannot host fails with
//!   [`MatrixError::CapabilityMismatch`] instead of silently running something else. For `windows` the
//!   error suggests `windows-sim`.
//! - `all` always runs `linux` (whatever the engine reports), then `windows` when the engine reports a Windows daemon, otherwise
//!   `windows-sim`; the substitution is recorded in the [`MatrixReport`].
//! - A failing target never stops the remaining targets. Builds run strictly one at a time.

pub mod engine;

use std::time::Instant;

use isorun_core::{PlatformTarget, RunReport, TestOutcome, TestStatus, target};
use miette::Diagnostic;
use thiserror::Error;

use crate::config::ServiceNames;
use crate::process::Termination;

pub use engine::{ContainerEngine, DockerCompose};

#[derive(Debug, Error, Diagnostic)]
pub enum MatrixError {
    #[error("container engine is not available: {0}")]
    #[diagnostic(
        code(isorun::matrix::engine_unavailable),
        help("start Docker (or Docker Desktop) and make sure `docker info` works")
    )]
    EngineUnavailable(#[source] std::io::Error),

    #[error("unknown platform target '{0}' (expected linux, windows, windows-sim or all)")]
    #[diagnostic(code(isorun::matrix::unknown_target))]
    UnknownTarget(String),

    #[error("target '{requested}' needs a {required} container engine, but the engine reports '{engine_os_type}'")]
    #[diagnostic(code(isorun::matrix::capability_mismatch))]
    CapabilityMismatch {
        requested: PlatformTarget,
        required: &'static str,
        engine_os_type: String,
        #[help]
        suggestion: String,
    },

    #[error("image build for '{service}' failed ({status})")]
    #[diagnostic(code(isorun::matrix::build_failed))]
    BuildFailed { service: String, status: Termination },

    #[error("failed to invoke the container engine for '{service}': {source}")]
    #[diagnostic(code(isorun::matrix::engine_invocation))]
    Invocation {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

fn suggestion_text(requested: PlatformTarget) -> String {
    match requested {
        PlatformTarget::Windows => format!(
            "use `--docker {}` to verify the Windows build through the compatibility layer on this engine",
            PlatformTarget::WindowsSimulated
        ),
        _ => "switch the container engine to Linux containers".to_string(),
    }
}

/// Which targets to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixSelection {
    All,
    Single(PlatformTarget),
}

impl MatrixSelection {
    /// Parse a `--docker` value: `all` or any target name or alias.
    pub fn parse(value: &str) -> Result<Self, MatrixError> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Ok(MatrixSelection::All);
        }
        target::from_str(&value.to_ascii_lowercase())
            .map(MatrixSelection::Single)
            .ok_or_else(|| MatrixError::UnknownTarget(value.to_string()))
    }
}

/// A requested target replaced by another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub requested: PlatformTarget,
    pub used: PlatformTarget,
    pub engine_os_type: String,
}

impl std::fmt::Display for Substitution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} substituted with {} (container engine reports '{}')",
            self.requested, self.used, self.engine_os_type
        )
    }
}

/// Result of one target.
#[derive(Debug)]
pub struct TargetRun {
    pub target: PlatformTarget,
    pub result: Result<RunReport, MatrixError>,
}

impl TargetRun {
    pub fn success(&self) -> bool {
        self.result.as_ref().is_ok_and(RunReport::success)
    }
}

/// Per-target results of a matrix run.
#[derive(Debug, Default)]
pub struct MatrixReport {
    pub targets: Vec<TargetRun>,
    pub substitutions: Vec<Substitution>,
}

impl MatrixReport {
    pub fn success(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(TargetRun::success)
    }
}

/// One entry of a matrix plan.
#[derive(Debug)]
pub struct PlannedTarget {
    pub target: PlatformTarget,
    /// Why the target cannot run on this engine.
    pub blocked: Option<MatrixError>,
}

/// Targets to execute for `selection` on an engine reporting `engine_os_type`.
///
/// Targets the engine cannot host carry their error so they still appear in the report.
pub fn plan(selection: MatrixSelection, engine_os_type: &str) -> (Vec<PlannedTarget>, Vec<Substitution>) {
    let checked = |t: PlatformTarget| {
        let blocked = (!t.supported_by(engine_os_type)).then(|| MatrixError::CapabilityMismatch {
            requested: t,
            required: target::info_for(t).engine_os_type,
            engine_os_type: engine_os_type.to_string(),
            suggestion: suggestion_text(t),
        });
        PlannedTarget { target: t, blocked }
    };

    match selection {
        MatrixSelection::Single(t) => (vec![checked(t)], Vec::new()),
        MatrixSelection::All => {
            let mut substitutions = Vec::new();
            let windows = if PlatformTarget::Windows.supported_by(engine_os_type) {
                PlatformTarget::Windows
            } else {
                substitutions.push(Substitution {
                    requested: PlatformTarget::Windows,
                    used: PlatformTarget::WindowsSimulated,
                    engine_os_type: engine_os_type.to_string(),
                });
                PlatformTarget::WindowsSimulated
            };
            // `all` always attempts linux; the engine reports the failure if it cannot host it.
            let linux = PlannedTarget {
                target: PlatformTarget::Linux,
                blocked: None,
            };
            (vec![linux, checked(windows)], substitutions)
        }
    }
}

/// Status for a container's exit.
///
/// `docker compose run` reports a container killed by signal N as exit code `128 + N`, so those codes
/// count as crashes alongside real signals.
pub fn container_status(termination: Termination) -> TestStatus {
    match termination {
        Termination::Success => TestStatus::Passed,
        Termination::ExitCode(code) if code > 128 => TestStatus::Crashed,
        t if t.is_abnormal() => TestStatus::Crashed,
        _ => TestStatus::Failed,
    }
}

/// Drives a [`ContainerEngine`] over the requested targets.
pub struct MatrixRunner<'a, E: ContainerEngine> {
    engine: E,
    services: &'a ServiceNames,
}

impl<'a, E: ContainerEngine> MatrixRunner<'a, E> {
    pub fn new(engine: E, services: &'a ServiceNames) -> Self {
        Self { engine, services }
    }

    pub fn service_for(&self, target: PlatformTarget) -> &str {
        match target {
            PlatformTarget::Linux => &self.services.linux,
            PlatformTarget::Windows => &self.services.windows,
            PlatformTarget::WindowsSimulated => &self.services.windows_sim,
        }
    }

    /// Run every target in `selection`.
    ///
    /// ## Errors
    /// - [`MatrixError::EngineUnavailable`] when the engine cannot be queried at all. Per-target failures
    ///   are reported inside the [`MatrixReport`] instead.
    pub fn run_matrix(&self, selection: MatrixSelection) -> Result<MatrixReport, MatrixError> {
        let engine_os_type = self.engine.os_type().map_err(MatrixError::EngineUnavailable)?;
        tracing::info!(engine_os_type = %engine_os_type, ?selection, "container engine detected");

        let (planned, substitutions) = plan(selection, &engine_os_type);
        for substitution in &substitutions {
            tracing::warn!("{substitution}");
        }

        let mut report = MatrixReport {
            targets: Vec::with_capacity(planned.len()),
            substitutions,
        };
        for PlannedTarget { target, blocked } in planned {
            let result = match blocked {
                Some(e) => {
                    tracing::error!(%target, "{e}");
                    Err(e)
                }
                None => self.run_target(target),
            };
            report.targets.push(TargetRun { target, result });
        }
        Ok(report)
    }

    fn run_target(&self, target: PlatformTarget) -> Result<RunReport, MatrixError> {
        let service = self.service_for(target).to_string();
        let start = Instant::now();

        let built = self.engine.build(&service).map_err(|source| MatrixError::Invocation {
            service: service.clone(),
            source,
        })?;
        if built != Termination::Success {
            return Err(MatrixError::BuildFailed { service, status: built });
        }

        let ran = self.engine.run(&service).map_err(|source| MatrixError::Invocation {
            service: service.clone(),
            source,
        })?;
        let status = container_status(ran);
        tracing::info!(%target, service = %service, termination = %ran, "container finished");

        let log = if status.is_passed() { String::new() } else { format!("container {ran}\n") };
        let outcome = TestOutcome::new(service, status, start.elapsed(), log);
        Ok(RunReport::new(target.as_str(), vec![outcome], start.elapsed()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Engine answering from fixed values and recording calls.
    struct MockEngine {
        os_type: &'static str,
        fail_run: Option<&'static str>,
        calls: RefCell<Vec<String>>,
    }

    impl MockEngine {
        fn new(os_type: &'static str) -> Self {
            Self {
                os_type,
                fail_run: None,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ContainerEngine for MockEngine {
        fn os_type(&self) -> std::io::Result<String> {
            Ok(self.os_type.to_string())
        }

        fn build(&self, service: &str) -> std::io::Result<Termination> {
            self.calls.borrow_mut().push(format!("build {service}"));
            Ok(Termination::Success)
        }

        fn run(&self, service: &str) -> std::io::Result<Termination> {
            self.calls.borrow_mut().push(format!("run {service}"));
            if self.fail_run == Some(service) {
                return Ok(Termination::ExitCode(1));
            }
            Ok(Termination::Success)
        }
    }

    #[test]
    fn test_selection_parse() {
        assert_eq!(MatrixSelection::parse("all").unwrap(), MatrixSelection::All);
        assert_eq!(
            MatrixSelection::parse("windows_sim").unwrap(),
            MatrixSelection::Single(PlatformTarget::WindowsSimulated)
        );
        assert!(matches!(
            MatrixSelection::parse("solaris"),
            Err(MatrixError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_windows_on_linux_engine_is_capability_mismatch() {
        let services = ServiceNames::default();
        let runner = MatrixRunner::new(MockEngine::new("linux"), &services);

        let report = runner
            .run_matrix(MatrixSelection::Single(PlatformTarget::Windows))
            .unwrap();
        assert!(!report.success());
        assert_eq!(report.targets.len(), 1);
        match report.targets[0].result.as_ref().unwrap_err() {
            MatrixError::CapabilityMismatch {
                requested, suggestion, ..
            } => {
                assert_eq!(*requested, PlatformTarget::Windows);
                assert!(suggestion.contains("--docker windows-sim"));
            }
            other => panic!("expected CapabilityMismatch, got {other:?}"),
        }
        assert!(runner.engine.calls.borrow().is_empty());
    }

    #[test]
    fn test_all_on_linux_engine_substitutes_windows_sim() {
        let services = ServiceNames::default();
        let runner = MatrixRunner::new(MockEngine::new("linux"), &services);

        let report = runner.run_matrix(MatrixSelection::All).unwrap();
        assert!(report.success());
        let targets: Vec<PlatformTarget> = report.targets.iter().map(|t| t.target).collect();
        assert_eq!(targets, vec![PlatformTarget::Linux, PlatformTarget::WindowsSimulated]);
        assert_eq!(report.substitutions.len(), 1);
        assert_eq!(
            report.substitutions[0].to_string(),
            "windows substituted with windows-sim (container engine reports 'linux')"
        );
        assert_eq!(
            *runner.engine.calls.borrow(),
            vec![
                "build tests-linux",
                "run tests-linux",
                "build tests-windows-sim",
                "run tests-windows-sim"
            ]
        );
    }

    #[test]
    fn test_all_on_windows_engine_runs_native_windows() {
        let (planned, substitutions) = plan(MatrixSelection::All, "windows");
        assert!(substitutions.is_empty());
        assert_eq!(planned[0].target, PlatformTarget::Linux);
        assert!(planned[0].blocked.is_none());
        assert_eq!(planned[1].target, PlatformTarget::Windows);
        assert!(planned[1].blocked.is_none());
    }

    #[test]
    fn test_all_on_windows_engine_still_runs_linux() {
        let services = ServiceNames::default();
        let runner = MatrixRunner::new(MockEngine::new("windows"), &services);

        let report = runner.run_matrix(MatrixSelection::All).unwrap();
        assert!(report.success());
        let targets: Vec<PlatformTarget> = report.targets.iter().map(|t| t.target).collect();
        assert_eq!(targets, vec![PlatformTarget::Linux, PlatformTarget::Windows]);
        assert_eq!(runner.engine.calls.borrow()[0], "build tests-linux");
    }

    #[test]
    fn test_explicit_linux_on_windows_engine_is_refused() {
        let (planned, _) = plan(MatrixSelection::Single(PlatformTarget::Linux), "windows");
        assert!(matches!(planned[0].blocked, Some(MatrixError::CapabilityMismatch { .. })));
    }

    #[test]
    fn test_container_status_mapping() {
        assert_eq!(container_status(Termination::Success), TestStatus::Passed);
        assert_eq!(container_status(Termination::ExitCode(1)), TestStatus::Failed);
        assert_eq!(container_status(Termination::ExitCode(128)), TestStatus::Failed);
        assert_eq!(container_status(Termination::ExitCode(139)), TestStatus::Crashed);
        assert_eq!(container_status(Termination::ExitCode(137)), TestStatus::Crashed);
        assert_eq!(container_status(Termination::Signal(9)), TestStatus::Crashed);
    }

    #[test]
    fn test_failing_target_does_not_stop_others() {
        let services = ServiceNames::default();
        let mut engine = MockEngine::new("linux");
        engine.fail_run = Some("tests-linux");
        let runner = MatrixRunner::new(engine, &services);

        let report = runner.run_matrix(MatrixSelection::All).unwrap();
        assert!(!report.success());
        assert!(!report.targets[0].success());
        assert!(report.targets[1].success());
        let linux = report.targets[0].result.as_ref().unwrap();
        assert_eq!(linux.outcomes[0].status, TestStatus::Failed);
    }
}
