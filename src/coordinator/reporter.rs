//! Progress reporting (pytest-style)
//!
//! The coordinator and the native suite report through the [`RunReporter`] trait so the console format
//! can be swapped (JSON, TAP, silent in tests) without touching execution.

use isorun_core::{RunReport, TestOutcome, TestStatus};

use crate::process::tail_lines;

/// Log lines printed under a non-passing test.
const FAILURE_LOG_LINES: usize = 30;

/// Console verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    Verbose,
    #[default]
    Quiet,
}

/// Receives progress events from a sub-run.
pub trait RunReporter {
    /// Called once the suite is known
    fn on_collection_complete(&mut self, label: &str, test_count: usize, workers: usize);

    /// Called when an item is handed to a worker
    fn on_test_start(&mut self, _test_id: &str, _slot: usize) {}

    /// Called when an outcome is recorded
    fn on_test_complete(&mut self, outcome: &TestOutcome);

    /// Called when a worker dies and is replaced
    fn on_worker_restart(&mut self, _slot: usize, _reason: &str) {}

    /// Called when the sub-run finishes
    fn on_run_complete(&mut self, report: &RunReport);
}

/// Default console reporter
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    pub mode: RunMode,
}

impl ConsoleReporter {
    pub fn new(mode: RunMode) -> Self {
        Self { mode }
    }

    fn verbose(&self) -> bool {
        self.mode == RunMode::Verbose
    }
}

fn colored_status(status: TestStatus) -> String {
    let color = match status {
        TestStatus::Passed => "\x1b[32m",
        TestStatus::Failed | TestStatus::Crashed => "\x1b[31m",
        TestStatus::TimedOut => "\x1b[33m",
    };
    format!("{color}{status}\x1b[0m")
}

fn progress_char(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Passed => "\x1b[32m.\x1b[0m",
        TestStatus::Failed => "\x1b[31mF\x1b[0m",
        TestStatus::Crashed => "\x1b[31mC\x1b[0m",
        TestStatus::TimedOut => "\x1b[33mT\x1b[0m",
    }
}

impl RunReporter for ConsoleReporter {
    fn on_collection_complete(&mut self, label: &str, test_count: usize, workers: usize) {
        if test_count == 0 {
            eprintln!("{label}: no tests collected");
        } else if workers > 0 {
            eprintln!("{label}: {test_count} tests across {workers} workers");
        } else {
            eprintln!("{label}: {test_count} tests");
        }
    }

    fn on_test_complete(&mut self, outcome: &TestOutcome) {
        if self.verbose() {
            eprintln!(
                "{} {} ({}ms)",
                outcome.test_id,
                colored_status(outcome.status),
                outcome.duration.as_millis()
            );
        } else {
            eprint!("{}", progress_char(outcome.status));
        }

        if !outcome.status.is_passed() && self.verbose() && !outcome.captured_log.is_empty() {
            eprintln!("\x1b[31m{}\x1b[0m", outcome.test_id);
            eprintln!("{}", tail_lines(&outcome.captured_log, FAILURE_LOG_LINES));
        }
    }

    fn on_worker_restart(&mut self, slot: usize, reason: &str) {
        if self.verbose() {
            eprintln!("\x1b[33mworker {slot} {reason}; restarting\x1b[0m");
        }
    }

    fn on_run_complete(&mut self, report: &RunReport) {
        if !self.verbose() && !report.outcomes.is_empty() {
            eprintln!();
        }
        if self.verbose() {
            return;
        }
        for outcome in report.outcomes.iter().filter(|o| !o.status.is_passed()) {
            eprintln!("{} {}", colored_status(outcome.status), outcome.test_id);
        }
    }
}

/// Reporter that records events; used where no console output is wanted.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub started: Vec<String>,
    pub completed: Vec<TestOutcome>,
    pub restarts: Vec<(usize, String)>,
    pub finished: bool,
}

impl RunReporter for RecordingReporter {
    fn on_collection_complete(&mut self, _label: &str, _test_count: usize, _workers: usize) {}

    fn on_test_start(&mut self, test_id: &str, _slot: usize) {
        self.started.push(test_id.to_string());
    }

    fn on_test_complete(&mut self, outcome: &TestOutcome) {
        self.completed.push(outcome.clone());
    }

    fn on_worker_restart(&mut self, slot: usize, reason: &str) {
        self.restarts.push((slot, reason.to_string()));
    }

    fn on_run_complete(&mut self, _report: &RunReport) {
        self.finished = true;
    }
}
