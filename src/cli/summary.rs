//! Aggregation of sub-run results into the final console summary.

use std::fmt::Write as _;
use std::time::Duration;

use isorun_core::{RunReport, TestStatus};

use crate::coordinator::CRASH_HINT;
use crate::matrix::MatrixReport;

/// One labelled sub-run.
#[derive(Debug)]
pub struct Section {
    pub label: String,
    /// A report, or the rendered error that prevented the sub-run from producing one.
    pub result: Result<RunReport, String>,
}

impl Section {
    fn success(&self) -> bool {
        self.result.as_ref().is_ok_and(RunReport::success)
    }
}

/// Every sub-run requested on the command line.
#[derive(Debug, Default)]
pub struct Summary {
    pub sections: Vec<Section>,
    pub notes: Vec<String>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_report(&mut self, report: RunReport) {
        self.sections.push(Section {
            label: report.label.clone(),
            result: Ok(report),
        });
    }

    pub fn push_error(&mut self, label: impl Into<String>, message: impl Into<String>) {
        self.sections.push(Section {
            label: label.into(),
            result: Err(message.into()),
        });
    }

    /// Add one section per matrix target, plus a note per substitution.
    pub fn push_matrix(&mut self, matrix: MatrixReport) {
        for substitution in &matrix.substitutions {
            self.notes.push(substitution.to_string());
        }
        for run in matrix.targets {
            let label = run.target.as_str().to_string();
            match run.result {
                Ok(report) => self.sections.push(Section { label, result: Ok(report) }),
                Err(e) => self.push_error(label, e.to_string()),
            }
        }
    }

    /// `true` iff every section produced a report and every outcome passed.
    pub fn success(&self) -> bool {
        self.sections.iter().all(Section::success)
    }

    pub fn passed(&self) -> usize {
        self.reports().map(RunReport::passed).sum()
    }

    /// Non-passing outcomes, plus one per section that could not run.
    pub fn failed(&self) -> usize {
        self.sections
            .iter()
            .map(|s| match &s.result {
                Ok(report) => report.not_passed(),
                Err(_) => 1,
            })
            .sum()
    }

    pub fn has_crashes(&self) -> bool {
        self.reports().any(RunReport::has_crashes)
    }

    fn reports(&self) -> impl Iterator<Item = &RunReport> {
        self.sections.iter().filter_map(|s| s.result.as_ref().ok())
    }

    /// The closing line: `N passed, M failed in X.XXs`.
    pub fn final_line(&self, elapsed: Duration) -> String {
        format!(
            "====== {} passed, {} failed in {:.2}s ======",
            self.passed(),
            self.failed(),
            elapsed.as_secs_f64()
        )
    }

    /// Full plain-text summary.
    pub fn render(&self, elapsed: Duration) -> String {
        let mut out = String::new();
        for section in &self.sections {
            match &section.result {
                Ok(report) => {
                    let _ = write!(out, "{}: {} passed, {} failed", section.label, report.passed(), report.not_passed());
                    let crashed = report.count(TestStatus::Crashed);
                    let timed_out = report.count(TestStatus::TimedOut);
                    let mut details = Vec::new();
                    if crashed > 0 {
                        details.push(format!("{crashed} crashed"));
                    }
                    if timed_out > 0 {
                        details.push(format!("{timed_out} timed out"));
                    }
                    if !details.is_empty() {
                        let _ = write!(out, " ({})", details.join(", "));
                    }
                    out.push('\n');
                }
                Err(message) => {
                    let first = message.lines().next().unwrap_or_default();
                    let _ = writeln!(out, "{}: error: {first}", section.label);
                }
            }
        }
        for note in &self.notes {
            let _ = writeln!(out, "note: {note}");
        }
        if self.has_crashes() {
            out.push('\n');
            out.push_str(CRASH_HINT);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.final_line(elapsed));
        out.push('\n');
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use isorun_core::{PlatformTarget, TestOutcome};

    use crate::matrix::{Substitution, TargetRun};

    fn report(label: &str, statuses: &[TestStatus]) -> RunReport {
        let outcomes = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| TestOutcome::new(format!("t{i}"), *s, Duration::ZERO, String::new()))
            .collect();
        RunReport::new(label, outcomes, Duration::ZERO)
    }

    #[test]
    fn test_all_passed_summary() {
        let mut summary = Summary::new();
        summary.push_report(report("native extension", &[TestStatus::Passed; 4]));
        summary.push_report(report("python suite", &[TestStatus::Passed; 10]));
        assert!(summary.success());
        insta::assert_snapshot!(summary.render(Duration::from_millis(1500)), @r"
        native extension: 4 passed, 0 failed
        python suite: 10 passed, 0 failed

        ====== 14 passed, 0 failed in 1.50s ======
        ");
    }

    #[test]
    fn test_crash_and_error_sections() {
        let mut summary = Summary::new();
        summary.push_report(report(
            "python suite",
            &[TestStatus::Passed, TestStatus::Crashed, TestStatus::TimedOut, TestStatus::Failed],
        ));
        summary.push_error("native extension", "native build step 'configure' failed (exit code 1)\nCMake Error");
        assert!(!summary.success());
        assert!(summary.has_crashes());
        assert_eq!(summary.passed(), 1);
        assert_eq!(summary.failed(), 4);
        insta::assert_snapshot!(summary.final_line(Duration::from_secs(2)), @"====== 1 passed, 4 failed in 2.00s ======");

        let rendered = summary.render(Duration::ZERO);
        assert!(rendered.contains("python suite: 1 passed, 3 failed (1 crashed, 1 timed out)"));
        assert!(rendered.contains("native extension: error: native build step 'configure' failed (exit code 1)\n"));
        assert!(rendered.contains(CRASH_HINT));
    }

    #[test]
    fn test_matrix_substitution_is_named() {
        let matrix = MatrixReport {
            targets: vec![
                TargetRun {
                    target: PlatformTarget::Linux,
                    result: Ok(report("linux", &[TestStatus::Passed])),
                },
                TargetRun {
                    target: PlatformTarget::WindowsSimulated,
                    result: Ok(report("windows-sim", &[TestStatus::Passed])),
                },
            ],
            substitutions: vec![Substitution {
                requested: PlatformTarget::Windows,
                used: PlatformTarget::WindowsSimulated,
                engine_os_type: "linux".to_string(),
            }],
        };
        let mut summary = Summary::new();
        summary.push_matrix(matrix);
        assert!(summary.success());
        insta::assert_snapshot!(summary.render(Duration::from_millis(250)), @r"
        linux: 1 passed, 0 failed
        windows-sim: 1 passed, 0 failed
        note: windows substituted with windows-sim (container engine reports 'linux')

        ====== 2 passed, 0 failed in 0.25s ======
        ");
    }

    #[test]
    fn test_empty_summary_is_success() {
        let summary = Summary::new();
        assert!(summary.success());
        assert_eq!(summary.final_line(Duration::ZERO), "====== 0 passed, 0 failed in 0.00s ======");
    }
}
