//! Crash-signature scan over captured logs.
//!
//! A test can fail "cleanly" from the worker's point of view while the log shows the real cause was a
//! fault inside native code (an allocator or TLS interaction reported by a signal handler, for example).
//! Those outcomes are re-classified as crashed so the summary can point at the likely cause.

use isorun_core::{TestOutcome, TestStatus};

/// Troubleshooting text shown when a run contains crashed outcomes.
pub const CRASH_HINT: &str = "\
One or more tests crashed the hosting process. This usually points at native code rather than the test's
assertions: a memory-allocator interaction (for example a preloaded allocator linked with an incompatible
thread-local-storage model) or memory corruption in an extension. Re-run with --verbose to see the
captured output, or run without the allocator preload to confirm.";

/// First configured signature contained in `log`, if any.
pub fn find_signature<'a>(log: &str, signatures: &'a [String]) -> Option<&'a str> {
    signatures
        .iter()
        .map(String::as_str)
        .find(|sig| !sig.is_empty() && log.contains(sig))
}

/// Up-classify `failed` outcomes whose log contains a crash signature.
///
/// ## Returns
/// - (`usize`): the number of outcomes changed.
///
/// ## Notes
/// - Only `failed` is touched; `passed` and `timed_out` keep their status.
pub fn apply_crash_signatures(outcomes: &mut [TestOutcome], signatures: &[String]) -> usize {
    let mut changed = 0;
    for outcome in outcomes.iter_mut().filter(|o| o.status == TestStatus::Failed) {
        if let Some(sig) = find_signature(&outcome.captured_log, signatures) {
            tracing::debug!(test = %outcome.test_id, signature = sig, "failure re-classified as crash");
            outcome.status = TestStatus::Crashed;
            changed += 1;
        }
    }
    changed
}
