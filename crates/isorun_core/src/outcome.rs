//! Per-test outcomes and the aggregated run report.

use std::fmt;
use std::time::Duration;

/// Final classification of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    Passed,
    /// Assertion-level failure reported by the test itself.
    Failed,
    /// The hosting process terminated abnormally (signal, abort, non-standard exit) while the test was
    /// in flight, or its log carries a crash signature.
    Crashed,
    TimedOut,
}

impl TestStatus {
    pub fn is_passed(self) -> bool {
        self == TestStatus::Passed
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
            TestStatus::Crashed => "CRASHED",
            TestStatus::TimedOut => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

/// Result of one test identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub duration: Duration,
    /// Everything the hosting process wrote while the test was in flight (stdout and stderr interleaved in
    /// arrival order), plus any note the orchestrator appended (exit signal, timeout).
    pub captured_log: String,
}

impl TestOutcome {
    pub fn new(test_id: impl Into<String>, status: TestStatus, duration: Duration, captured_log: String) -> Self {
        Self {
            test_id: test_id.into(),
            status,
            duration,
            captured_log,
        }
    }
}

/// Aggregated result of one sub-run (one suite, or one container target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Human-readable section name, e.g. `native extension` or `linux`.
    pub label: String,
    pub outcomes: Vec<TestOutcome>,
    pub duration: Duration,
}

impl RunReport {
    pub fn new(label: impl Into<String>, outcomes: Vec<TestOutcome>, duration: Duration) -> Self {
        Self {
            label: label.into(),
            outcomes,
            duration,
        }
    }

    /// `true` iff every outcome passed.
    ///
    /// ## Notes
    /// - An empty report is successful: nothing was collected, so nothing failed.
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_passed())
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    /// Number of outcomes that are not `passed` (failed, crashed and timed out).
    pub fn not_passed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn has_crashes(&self) -> bool {
        self.count(TestStatus::Crashed) > 0
    }
}
