//! Native-extension suite
//!
//! Builds the project's own C sources with CMake and runs the resulting test executables one after the
//! other. The executables are opaque: exit status is the only signal.
//!
//! ## Status mapping
//!
//! | termination            | status    |
//! |------------------------|-----------|
//! | exit code 0            | `passed`  |
//! | signal / abnormal exit | `crashed` |
//! | other exit code        | `failed`  |
//! | executable not found   | `failed`  |

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use isorun_core::{RunReport, TestOutcome, TestStatus};
use miette::Diagnostic;
use thiserror::Error;

use crate::build::{BuildStep, CommandRunner, detected_jobs};
use crate::config::NativeConfig;
use crate::coordinator::{RunReporter, apply_crash_signatures};
use crate::interrupt::InterruptFlag;
use crate::preload::PreloadSpec;
use crate::process::{Termination, tail_lines};

#[derive(Debug, Error, Diagnostic)]
pub enum NativeError {
    #[error("native build step '{step}' failed ({status})\n{output}")]
    #[diagnostic(code(isorun::native::build_failed), help("re-run with --verbose to see the full build output"))]
    BuildFailed {
        step: &'static str,
        status: String,
        output: String,
    },

    #[error("failed to launch native build step '{step}': {source}")]
    #[diagnostic(code(isorun::native::launch), help("install CMake and make sure it is on PATH"))]
    Launch {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted after {completed} of {total} test executables")]
    #[diagnostic(code(isorun::native::interrupted))]
    Interrupted { completed: usize, total: usize },
}

/// Candidate locations of a test executable under `build_dir`, in search order.
pub fn executable_candidates(build_dir: &Path, name: &str) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for dir in [build_dir.to_path_buf(), build_dir.join("Debug"), build_dir.join("Release")] {
        candidates.push(dir.join(name));
        candidates.push(dir.join(format!("{name}.exe")));
    }
    candidates
}

/// First existing candidate for `name`.
pub fn locate_executable(build_dir: &Path, name: &str) -> Option<PathBuf> {
    executable_candidates(build_dir, name).into_iter().find(|c| c.is_file())
}

/// Status for an executable's termination.
pub fn status_for(termination: Termination) -> TestStatus {
    match termination {
        Termination::Success => TestStatus::Passed,
        t if t.is_abnormal() => TestStatus::Crashed,
        _ => TestStatus::Failed,
    }
}

pub struct NativeSuite<'a, R: CommandRunner> {
    config: &'a NativeConfig,
    runner: R,
    jobs: usize,
    crash_signatures: &'a [String],
    interrupt: Option<InterruptFlag>,
}

impl<'a, R: CommandRunner> NativeSuite<'a, R> {
    pub fn new(config: &'a NativeConfig, runner: R, crash_signatures: &'a [String]) -> Self {
        Self {
            config,
            runner,
            jobs: detected_jobs(),
            crash_signatures,
            interrupt: None,
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Configure and compile steps for the build collaborator.
    pub fn build_steps(&self) -> Vec<BuildStep> {
        let cwd = Path::new(".");
        let mut configure = vec![
            "-S".to_string(),
            self.config.source_dir.display().to_string(),
            "-B".to_string(),
            self.config.build_dir.display().to_string(),
        ];
        configure.extend(self.config.configure_args.iter().cloned());
        let compile = vec![
            "--build".to_string(),
            self.config.build_dir.display().to_string(),
            "--parallel".to_string(),
            self.jobs.to_string(),
        ];
        vec![
            BuildStep::new("configure", "cmake", configure, cwd),
            BuildStep::new("compile", "cmake", compile, cwd),
        ]
    }

    /// Build the extension and its test executables.
    pub fn build(&self) -> Result<(), NativeError> {
        for step in self.build_steps() {
            tracing::info!(step = step.name, "{}", step.display_line());
            let output = self.runner.run(&step).map_err(|source| NativeError::Launch {
                step: step.name,
                source,
            })?;
            if !output.success {
                return Err(NativeError::BuildFailed {
                    step: step.name,
                    status: output.status,
                    output: tail_lines(&output.output, 40),
                });
            }
        }
        Ok(())
    }

    /// Run every configured test executable with `preload` applied.
    pub fn run_tests(
        &self,
        label: &str,
        preload: &PreloadSpec,
        reporter: &mut dyn RunReporter,
    ) -> Result<RunReport, NativeError> {
        let start = Instant::now();
        let total = self.config.test_executables.len();
        reporter.on_collection_complete(label, total, 0);

        let mut outcomes = Vec::with_capacity(total);
        for name in &self.config.test_executables {
            if self.interrupt.as_ref().is_some_and(InterruptFlag::is_raised) {
                return Err(NativeError::Interrupted {
                    completed: outcomes.len(),
                    total,
                });
            }
            reporter.on_test_start(name, 0);
            let outcome = self.run_one(name, preload);
            reporter.on_test_complete(&outcome);
            outcomes.push(outcome);
        }

        apply_crash_signatures(&mut outcomes, self.crash_signatures);
        let report = RunReport::new(label, outcomes, start.elapsed());
        reporter.on_run_complete(&report);
        Ok(report)
    }

    /// Build, then run the executables.
    pub fn run(
        &self,
        label: &str,
        preload: &PreloadSpec,
        reporter: &mut dyn RunReporter,
    ) -> Result<RunReport, NativeError> {
        self.build()?;
        self.run_tests(label, preload, reporter)
    }

    fn run_one(&self, name: &str, preload: &PreloadSpec) -> TestOutcome {
        let Some(path) = locate_executable(&self.config.build_dir, name) else {
            tracing::warn!(executable = name, build_dir = %self.config.build_dir.display(), "test executable not found");
            return TestOutcome::new(
                name,
                TestStatus::Failed,
                Duration::ZERO,
                format!("test executable not found under {}\n", self.config.build_dir.display()),
            );
        };

        let started = Instant::now();
        let mut command = Command::new(&path);
        command.stdin(Stdio::null());
        preload.apply(&mut command);

        match command.output() {
            Ok(output) => {
                let termination = Termination::from_status(output.status);
                let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
                log.push_str(&String::from_utf8_lossy(&output.stderr));
                let status = status_for(termination);
                if status != TestStatus::Passed {
                    log.push_str(&format!("\n{name}: {termination}\n"));
                }
                tracing::debug!(executable = name, %termination, "test executable finished");
                TestOutcome::new(name, status, started.elapsed(), log)
            }
            Err(e) => TestOutcome::new(
                name,
                TestStatus::Failed,
                started.elapsed(),
                format!("failed to launch {}: {e}\n", path.display()),
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::build::StepOutput;
    use crate::coordinator::RecordingReporter;
    use std::cell::RefCell;

    struct FakeCmake {
        calls: RefCell<Vec<Vec<String>>>,
        fail_step: Option<&'static str>,
    }

    impl CommandRunner for FakeCmake {
        fn run(&self, step: &BuildStep) -> std::io::Result<StepOutput> {
            self.calls.borrow_mut().push(step.args.clone());
            let success = self.fail_step != Some(step.name);
            Ok(StepOutput {
                success,
                status: if success { "exit code 0" } else { "exit code 1" }.to_string(),
                output: "CMake Error: could not find compiler".to_string(),
            })
        }
    }

    fn fake(fail_step: Option<&'static str>) -> FakeCmake {
        FakeCmake {
            calls: RefCell::new(Vec::new()),
            fail_step,
        }
    }

    #[test]
    fn test_build_steps_use_configured_dirs() {
        let config = NativeConfig::default();
        let suite = NativeSuite::new(&config, fake(None), &[]).with_jobs(6);
        suite.build().unwrap();
        let calls = suite.runner().calls.borrow().clone();
        assert_eq!(calls[0], vec!["-S", ".", "-B", "build", "-DCMAKE_BUILD_TYPE=Debug"]);
        assert_eq!(calls[1], vec!["--build", "build", "--parallel", "6"]);
    }

    #[test]
    fn test_build_failure_names_step() {
        let config = NativeConfig::default();
        let suite = NativeSuite::new(&config, fake(Some("configure")), &[]);
        match suite.build().unwrap_err() {
            NativeError::BuildFailed { step, output, .. } => {
                assert_eq!(step, "configure");
                assert!(output.contains("could not find compiler"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert_eq!(suite.runner().calls.borrow().len(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(Termination::Success), TestStatus::Passed);
        assert_eq!(status_for(Termination::Signal(11)), TestStatus::Crashed);
        #[cfg(unix)]
        assert_eq!(status_for(Termination::ExitCode(1)), TestStatus::Failed);
    }

    #[test]
    fn test_executable_candidates_cover_msvc_layout() {
        let candidates = executable_candidates(Path::new("build"), "test_router");
        assert_eq!(candidates[0], PathBuf::from("build/test_router"));
        assert!(candidates.contains(&PathBuf::from("build/Release/test_router.exe")));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tests_classifies_each_executable() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "test_ok", "echo all good");
        script(dir.path(), "test_assert", "echo 'assertion failed: route != NULL'; exit 1");
        script(dir.path(), "test_segv", "kill -SEGV $$");
        script(dir.path(), "test_abort_msg", "echo 'double free or corruption (out)' >&2; exit 134");

        let config = NativeConfig {
            build_dir: dir.path().to_path_buf(),
            test_executables: ["test_ok", "test_assert", "test_segv", "test_abort_msg", "test_missing"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..NativeConfig::default()
        };
        let signatures = vec!["double free or corruption".to_string()];
        let suite = NativeSuite::new(&config, fake(None), &signatures);
        let mut reporter = RecordingReporter::default();

        let report = suite
            .run_tests("native extension", &PreloadSpec::inactive(None, None), &mut reporter)
            .unwrap();
        let statuses: Vec<TestStatus> = report.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                TestStatus::Passed,
                TestStatus::Failed,
                TestStatus::Crashed,
                TestStatus::Crashed,
                TestStatus::Failed,
            ]
        );
        assert!(report.outcomes[4].captured_log.contains("not found"));
        assert!(report.outcomes[2].captured_log.contains("SIGSEGV"));
        assert_eq!(reporter.completed.len(), 5);
        assert!(!report.success());
    }
}
