//! Distributed test execution coordinator
//!
//! Runs a suite of test identifiers across a pool of isolated worker processes and aggregates one
//! [`TestOutcome`] per identifier into a [`RunReport`].
//!
//! ## Model
//!
//! - The control loop is single-threaded. Reader threads only forward worker output lines over a channel;
//!   all scheduling state (the [`WorkQueue`], in-flight items, outcomes) is owned by the loop.
//! - Each worker slot runs one test at a time. When it is idle it takes the next item from its own lane
//!   or steals from the longest other lane.
//! - A worker that exits while a test is in flight produces a `crashed` outcome for that test and is
//!   replaced; outcomes already recorded are never touched.
//! - A worker that dies while idle is restarted up to `max_idle_restarts` times before its slot is retired.
//!   Items that end up with no live slot to run them are recorded as `crashed`, so the report always
//!   holds exactly one outcome per suite item.
//! - After the pool drains, `failed` outcomes whose log carries a crash signature are re-classified as
//!   `crashed` (see [`classify`]).

pub mod classify;
pub mod queue;
pub mod reporter;
pub mod worker;

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use isorun_core::{RunReport, TestOutcome, TestStatus};
use miette::Diagnostic;
use thiserror::Error;

use crate::config::{ConfigError, SuiteConfig};
use crate::interrupt::InterruptFlag;

pub use classify::{CRASH_HINT, apply_crash_signatures};
pub use queue::{Assignment, WorkQueue};
pub use reporter::{ConsoleReporter, RecordingReporter, RunMode, RunReporter};
pub use worker::{WORKER_HOST_SOURCE, WorkerProcess, WorkerSpec};

use worker::{ReportedResult, Stream, WorkerEvent, WorkerMessage, parse_result_line};

/// How long the loop blocks waiting for worker output before re-checking exits and timeouts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to keep reading a dead worker's pipes before concluding its exit.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error, Diagnostic)]
pub enum CoordinatorError {
    #[error("interrupted after {completed} of {total} tests; all workers were stopped")]
    #[diagnostic(code(isorun::coordinator::interrupted))]
    Interrupted { completed: usize, total: usize },
}

/// Tunables for one coordinator run.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub workers: usize,
    pub test_timeout: Option<Duration>,
    pub max_idle_restarts: u32,
    pub crash_signatures: Vec<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&SuiteConfig::default(), None).unwrap_or(Self {
            workers: default_workers(),
            test_timeout: None,
            max_idle_restarts: 3,
            crash_signatures: Vec::new(),
        })
    }
}

impl CoordinatorOptions {
    /// Options from `[suite]`, with an optional worker-count override from the command line.
    pub fn from_config(suite: &SuiteConfig, workers: Option<usize>) -> Result<Self, ConfigError> {
        let test_timeout = suite
            .test_timeout
            .as_deref()
            .map(crate::config::parse_duration)
            .transpose()?;
        Ok(Self {
            workers: workers.or(suite.workers).unwrap_or_else(default_workers).max(1),
            test_timeout,
            max_idle_restarts: suite.max_idle_restarts,
            crash_signatures: suite.crash_signatures.clone(),
        })
    }
}

/// Worker count matching the available cores.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Runs suites on a worker pool.
pub struct Coordinator {
    spec: WorkerSpec,
    options: CoordinatorOptions,
    interrupt: Option<InterruptFlag>,
}

impl Coordinator {
    pub fn new(spec: WorkerSpec, options: CoordinatorOptions) -> Self {
        Self {
            spec,
            options,
            interrupt: None,
        }
    }

    /// Observe `flag` and stop the pool when it is raised.
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Run `suite` and return its report.
    ///
    /// ## Parameters
    /// - `label`: section name used in the report.
    /// - `suite`: test identifiers; duplicates should already be removed.
    /// - `reporter`: receives progress events.
    ///
    /// ## Errors
    /// - [`CoordinatorError::Interrupted`] when the interrupt flag was raised. Every worker has been
    ///   terminated and reaped by the time this returns.
    pub fn run(
        &self,
        label: &str,
        suite: &[String],
        reporter: &mut dyn RunReporter,
    ) -> Result<RunReport, CoordinatorError> {
        let start = Instant::now();
        if suite.is_empty() {
            reporter.on_collection_complete(label, 0, 0);
            let report = RunReport::new(label, Vec::new(), start.elapsed());
            reporter.on_run_complete(&report);
            return Ok(report);
        }

        let workers = self.options.workers.clamp(1, suite.len());
        reporter.on_collection_complete(label, suite.len(), workers);
        tracing::info!(label, tests = suite.len(), workers, "starting worker pool");

        let (tx, rx) = mpsc::channel();
        let mut pool = Pool::new(&self.spec, &self.options, suite, workers, tx);
        for slot in 0..workers {
            pool.respawn(slot);
        }

        loop {
            if self.interrupt.as_ref().is_some_and(InterruptFlag::is_raised) {
                pool.shutdown();
                return Err(CoordinatorError::Interrupted {
                    completed: pool.completed(),
                    total: suite.len(),
                });
            }

            pool.dispatch_idle(reporter);
            if pool.all_stopped() {
                break;
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(message) => {
                    pool.handle_message(message, reporter);
                    while let Ok(message) = rx.try_recv() {
                        pool.handle_message(message, reporter);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            pool.check_timeouts(reporter);
            pool.reap_exited(reporter);
        }

        let mut outcomes = pool.into_outcomes(reporter);
        let reclassified = apply_crash_signatures(&mut outcomes, &self.options.crash_signatures);
        if reclassified > 0 {
            tracing::warn!(count = reclassified, "failures carry crash signatures");
        }

        let report = RunReport::new(label, outcomes, start.elapsed());
        tracing::info!(
            label,
            passed = report.passed(),
            not_passed = report.not_passed(),
            "worker pool finished"
        );
        reporter.on_run_complete(&report);
        Ok(report)
    }
}

// ============================================================================
// Pool state
// ============================================================================

struct InFlight {
    item: usize,
    started: Instant,
    log: String,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    process: Option<WorkerProcess>,
    in_flight: Option<InFlight>,
    /// Stdin was closed because no work is left; the next exit is expected.
    closing: bool,
    idle_deaths: u32,
    retired: bool,
    last_error: Option<String>,
}

struct Pool<'a> {
    spec: &'a WorkerSpec,
    options: &'a CoordinatorOptions,
    suite: &'a [String],
    queue: WorkQueue,
    outcomes: Vec<Option<TestOutcome>>,
    slots: Vec<Slot>,
    tx: Sender<WorkerMessage>,
}

impl<'a> Pool<'a> {
    fn new(
        spec: &'a WorkerSpec,
        options: &'a CoordinatorOptions,
        suite: &'a [String],
        workers: usize,
        tx: Sender<WorkerMessage>,
    ) -> Self {
        Self {
            spec,
            options,
            suite,
            queue: WorkQueue::partition(suite.len(), workers),
            outcomes: vec![None; suite.len()],
            slots: (0..workers).map(|_| Slot::default()).collect(),
            tx,
        }
    }

    fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_some()).count()
    }

    fn all_stopped(&self) -> bool {
        self.slots.iter().all(|s| s.process.is_none())
    }

    /// Start a fresh process in `slot`, retrying spawn failures against the idle-death budget.
    fn respawn(&mut self, slot: usize) {
        let max_restarts = self.options.max_idle_restarts;
        let state = &mut self.slots[slot];
        if state.retired {
            return;
        }
        loop {
            state.generation += 1;
            match WorkerProcess::spawn(self.spec, slot, state.generation, &self.tx) {
                Ok(process) => {
                    state.process = Some(process);
                    state.closing = false;
                    return;
                }
                Err(e) => {
                    tracing::warn!(slot, program = %self.spec.program, error = %e, "failed to start worker");
                    state.last_error = Some(format!("failed to start worker `{}`: {e}", self.spec.program));
                    state.idle_deaths += 1;
                    if state.idle_deaths > max_restarts {
                        tracing::error!(slot, "worker slot retired after repeated start failures");
                        state.retired = true;
                        return;
                    }
                }
            }
        }
    }

    /// Replace a worker that died, unless there is nothing left for it to do.
    fn replace(&mut self, slot: usize) {
        if self.queue.is_empty() {
            return;
        }
        self.respawn(slot);
    }

    fn dispatch_idle(&mut self, reporter: &mut dyn RunReporter) {
        for slot in 0..self.slots.len() {
            let state = &mut self.slots[slot];
            let Some(process) = state.process.as_mut() else {
                continue;
            };
            if state.in_flight.is_some() || state.closing || process.is_closing() {
                continue;
            }

            let Some(assignment) = self.queue.next_for(slot) else {
                tracing::debug!(slot, "no work left; closing worker stdin");
                process.close_stdin();
                state.closing = true;
                continue;
            };

            let item = assignment.item();
            let test_id = &self.suite[item];
            if let Assignment::Stolen { from, .. } = assignment {
                tracing::debug!(slot, from, test = %test_id, "stole test");
            }

            match process.dispatch(test_id) {
                Ok(()) => {
                    state.in_flight = Some(InFlight {
                        item,
                        started: Instant::now(),
                        log: String::new(),
                    });
                    reporter.on_test_start(test_id, slot);
                }
                Err(e) => {
                    // Never started: hand it back and let the exit be handled as an idle death.
                    tracing::debug!(slot, error = %e, "dispatch failed");
                    self.queue.requeue(slot, item);
                    process.kill();
                }
            }
        }
    }

    fn handle_message(&mut self, message: WorkerMessage, reporter: &mut dyn RunReporter) {
        let Some(state) = self.slots.get_mut(message.slot) else {
            return;
        };
        if message.generation != state.generation {
            return;
        }

        match message.event {
            WorkerEvent::Closed(_) => {
                if let Some(process) = state.process.as_mut() {
                    process.stream_closed();
                }
            }
            WorkerEvent::Line { stream, line } => {
                if stream == Stream::Stdout {
                    if let Some(result) = parse_result_line(&line) {
                        self.record_reported(message.slot, result, &line, reporter);
                        return;
                    }
                }
                match state.in_flight.as_mut() {
                    Some(in_flight) => {
                        in_flight.log.push_str(&line);
                        in_flight.log.push('\n');
                    }
                    None => tracing::trace!(slot = message.slot, "{line}"),
                }
            }
        }
    }

    fn record_reported(&mut self, slot: usize, result: ReportedResult, raw: &str, reporter: &mut dyn RunReporter) {
        let suite = self.suite;
        let state = &mut self.slots[slot];
        let Some(in_flight) = state.in_flight.take_if(|f| suite[f.item] == result.test_id) else {
            tracing::warn!(slot, test = %result.test_id, "result for a test that is not in flight");
            if let Some(in_flight) = state.in_flight.as_mut() {
                in_flight.log.push_str(raw);
                in_flight.log.push('\n');
            }
            return;
        };
        state.idle_deaths = 0;

        let status = if result.passed { TestStatus::Passed } else { TestStatus::Failed };
        let outcome = TestOutcome::new(result.test_id, status, in_flight.started.elapsed(), in_flight.log);
        self.record(in_flight.item, outcome, reporter);
    }

    fn record(&mut self, item: usize, outcome: TestOutcome, reporter: &mut dyn RunReporter) {
        let Some(entry) = self.outcomes.get_mut(item) else {
            return;
        };
        if entry.is_some() {
            tracing::warn!(test = %outcome.test_id, "duplicate outcome ignored");
            return;
        }
        reporter.on_test_complete(&outcome);
        *entry = Some(outcome);
    }

    fn check_timeouts(&mut self, reporter: &mut dyn RunReporter) {
        let Some(limit) = self.options.test_timeout else {
            return;
        };
        for slot in 0..self.slots.len() {
            let state = &mut self.slots[slot];
            let expired = state.in_flight.as_ref().is_some_and(|f| f.started.elapsed() >= limit);
            if !expired {
                continue;
            }
            let Some(mut in_flight) = state.in_flight.take() else {
                continue;
            };
            if let Some(mut process) = state.process.take() {
                process.kill();
            }

            let test_id = self.suite[in_flight.item].clone();
            tracing::warn!(slot, test = %test_id, limit = ?limit, "test timed out; killing worker");
            in_flight
                .log
                .push_str(&format!("test exceeded the {:.1}s timeout; worker killed\n", limit.as_secs_f64()));
            let outcome = TestOutcome::new(test_id, TestStatus::TimedOut, in_flight.started.elapsed(), in_flight.log);
            self.record(in_flight.item, outcome, reporter);
            reporter.on_worker_restart(slot, "timed out");
            self.replace(slot);
        }
    }

    fn reap_exited(&mut self, reporter: &mut dyn RunReporter) {
        for slot in 0..self.slots.len() {
            let state = &mut self.slots[slot];
            let Some(process) = state.process.as_mut() else {
                continue;
            };
            let Some(termination) = process.finished(DRAIN_GRACE) else {
                continue;
            };
            state.process = None;

            if let Some(mut in_flight) = state.in_flight.take() {
                state.idle_deaths = 0;
                let test_id = self.suite[in_flight.item].clone();
                tracing::warn!(slot, test = %test_id, %termination, "worker crashed");
                in_flight
                    .log
                    .push_str(&format!("worker process exited while the test was running: {termination}\n"));
                let outcome =
                    TestOutcome::new(test_id, TestStatus::Crashed, in_flight.started.elapsed(), in_flight.log);
                self.record(in_flight.item, outcome, reporter);
                reporter.on_worker_restart(slot, &format!("crashed ({termination})"));
                self.replace(slot);
                continue;
            }

            if state.closing {
                tracing::debug!(slot, %termination, "worker finished");
                continue;
            }

            state.idle_deaths += 1;
            state.last_error = Some(format!("worker exited while idle ({termination})"));
            if state.idle_deaths > self.options.max_idle_restarts {
                tracing::error!(slot, %termination, deaths = state.idle_deaths, "worker slot retired");
                state.retired = true;
                continue;
            }
            tracing::warn!(slot, %termination, "worker exited while idle");
            reporter.on_worker_restart(slot, &format!("exited while idle ({termination})"));
            self.replace(slot);
        }
    }

    /// Terminate every live worker.
    fn shutdown(&mut self) {
        for state in &mut self.slots {
            if let Some(mut process) = state.process.take() {
                tracing::debug!(pid = process.pid(), "terminating worker");
                process.terminate();
            }
        }
    }

    /// One outcome per suite item, in suite order. Items nothing could run are recorded as crashed.
    fn into_outcomes(mut self, reporter: &mut dyn RunReporter) -> Vec<TestOutcome> {
        let unserved = self.queue.drain();
        if !unserved.is_empty() {
            let reason = self
                .slots
                .iter()
                .find_map(|s| s.last_error.clone())
                .unwrap_or_else(|| "no worker available".to_string());
            tracing::error!(count = unserved.len(), %reason, "tests left without a live worker");
            for item in unserved {
                let outcome = TestOutcome::new(
                    self.suite[item].clone(),
                    TestStatus::Crashed,
                    Duration::ZERO,
                    format!("not run: {reason}\n"),
                );
                self.record(item, outcome, reporter);
            }
        }

        let suite = self.suite;
        self.outcomes
            .into_iter()
            .enumerate()
            .map(|(item, outcome)| {
                outcome.unwrap_or_else(|| {
                    TestOutcome::new(
                        suite[item].clone(),
                        TestStatus::Crashed,
                        Duration::ZERO,
                        "no outcome recorded\n".to_string(),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let suite = SuiteConfig {
            workers: Some(6),
            test_timeout: Some("250ms".to_string()),
            max_idle_restarts: 1,
            ..SuiteConfig::default()
        };
        let options = CoordinatorOptions::from_config(&suite, None).unwrap();
        assert_eq!(options.workers, 6);
        assert_eq!(options.test_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.max_idle_restarts, 1);

        let options = CoordinatorOptions::from_config(&suite, Some(2)).unwrap();
        assert_eq!(options.workers, 2);

        let bad = SuiteConfig {
            test_timeout: Some("soon".to_string()),
            ..SuiteConfig::default()
        };
        assert!(CoordinatorOptions::from_config(&bad, None).is_err());
    }

    #[test]
    fn test_empty_suite_is_successful_without_spawning() {
        let spec = WorkerSpec::from_command_line(
            &["/nonexistent/worker".to_string()],
            crate::preload::PreloadSpec::inactive(None, None),
        )
        .unwrap();
        let coordinator = Coordinator::new(spec, CoordinatorOptions::default());
        let mut reporter = RecordingReporter::default();

        let report = coordinator.run("empty", &[], &mut reporter).unwrap();
        assert!(report.success());
        assert!(report.outcomes.is_empty());
        assert!(reporter.finished);
    }

    #[test]
    fn test_unstartable_worker_marks_every_test_crashed() {
        let spec = WorkerSpec::from_command_line(
            &["/nonexistent/isorun-worker".to_string()],
            crate::preload::PreloadSpec::inactive(None, None),
        )
        .unwrap();
        let options = CoordinatorOptions {
            workers: 2,
            max_idle_restarts: 1,
            ..CoordinatorOptions::default()
        };
        let suite: Vec<String> = (0..3).map(|i| format!("t{i}")).collect();
        let mut reporter = RecordingReporter::default();

        let report = Coordinator::new(spec, options).run("broken", &suite, &mut reporter).unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.count(TestStatus::Crashed), 3);
        assert!(report.outcomes[0].captured_log.contains("failed to start worker"));
        assert!(!report.success());
    }

    #[test]
    fn test_interrupt_before_start_returns_interrupted() {
        let spec = WorkerSpec::from_command_line(
            &["/nonexistent/isorun-worker".to_string()],
            crate::preload::PreloadSpec::inactive(None, None),
        )
        .unwrap();
        let flag = InterruptFlag::new();
        flag.raise();
        let coordinator = Coordinator::new(spec, CoordinatorOptions::default()).with_interrupt(flag);
        let mut reporter = RecordingReporter::default();

        let err = coordinator
            .run("interrupted", &["t".to_string()], &mut reporter)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Interrupted { completed: 0, total: 1 }));
    }
}
