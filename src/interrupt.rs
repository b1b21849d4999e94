//! Ctrl-C handling
//!
//! The coordinator loop is synchronous, so the interrupt is observed through a shared flag rather than a
//! future. [`install_ctrl_c_watcher`] runs a small tokio runtime on a helper thread that waits for the
//! signal and raises the flag; the loop polls [`InterruptFlag::is_raised`] between events, terminates its
//! workers and returns.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Shared "the user asked us to stop" flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Start a background thread that raises the returned flag on Ctrl-C.
///
/// ## Errors
/// - The helper runtime could not be created.
pub fn install_ctrl_c_watcher() -> io::Result<InterruptFlag> {
    let flag = InterruptFlag::new();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    let watcher = flag.clone();
    thread::Builder::new().name("isorun-ctrl-c".to_string()).spawn(move || {
        runtime.block_on(async move {
            loop {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::warn!("interrupt received; stopping workers");
                        watcher.raise();
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "ctrl-c listener unavailable");
                        return;
                    }
                }
            }
        });
    })?;

    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!other.is_raised());
        flag.raise();
        assert!(other.is_raised());
    }
}
