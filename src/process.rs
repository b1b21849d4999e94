//! Child-process helpers shared by the build pipeline, the worker pool and the native suite.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::ExitStatus;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with code 0.
    Success,
    /// Normal exit with a non-zero code.
    ExitCode(i32),
    /// Killed by a signal (unix only).
    Signal(i32),
    /// Neither a code nor a signal was reported.
    Unknown,
}

impl Termination {
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return Termination::Success;
        }
        if let Some(code) = status.code() {
            return Termination::ExitCode(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Termination::Signal(signal);
            }
        }
        Termination::Unknown
    }

    /// Whether this ending counts as an abnormal termination rather than a test-reported failure.
    ///
    /// Signals are always abnormal. On Windows an access violation or abort surfaces as an NTSTATUS-style
    /// exit code with the high bit set, which is treated the same way.
    pub fn is_abnormal(self) -> bool {
        match self {
            Termination::Signal(_) | Termination::Unknown => true,
            Termination::ExitCode(code) => cfg!(windows) && (code as u32) >= 0xC000_0000,
            Termination::Success => false,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Success => write!(f, "exit code 0"),
            Termination::ExitCode(code) => write!(f, "exit code {code}"),
            Termination::Signal(signal) => write!(f, "terminated by signal {signal} ({})", signal_name(*signal)),
            Termination::Unknown => write!(f, "terminated abnormally"),
        }
    }
}

/// Conventional name of a POSIX signal number.
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        4 => "SIGILL",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => "unknown signal",
    }
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn send_sigterm(pid: u32) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// No graceful signal exists off unix; callers fall back to `Child::kill`.
#[cfg(not(unix))]
pub fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

/// Find the first of `names` in the directories of a `PATH`-style list.
///
/// ## Parameters
/// - `names`: executable file names to look for, in preference order.
/// - `search_path`: a `PATH`-formatted value; `None` means nothing is discoverable.
pub fn locate_program(names: &[&str], search_path: Option<&OsStr>) -> Option<PathBuf> {
    let search_path = search_path?;
    for dir in std::env::split_paths(search_path) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Keep the last `max_lines` lines of a (possibly long) build or test log.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_display() {
        assert_eq!(Termination::ExitCode(2).to_string(), "exit code 2");
        assert_eq!(Termination::Signal(11).to_string(), "terminated by signal 11 (SIGSEGV)");
    }

    #[test]
    fn test_abnormal_classification() {
        assert!(Termination::Signal(6).is_abnormal());
        assert!(!Termination::Success.is_abnormal());
        #[cfg(unix)]
        assert!(!Termination::ExitCode(1).is_abnormal());
    }

    #[cfg(unix)]
    #[test]
    fn test_from_status_reports_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(Termination::from_status(ExitStatus::from_raw(11)), Termination::Signal(11));
        assert_eq!(Termination::from_status(ExitStatus::from_raw(1 << 8)), Termination::ExitCode(1));
        assert_eq!(Termination::from_status(ExitStatus::from_raw(0)), Termination::Success);
    }

    #[test]
    fn test_locate_program() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MSBuild.exe"), b"").unwrap();
        let path = std::env::join_paths([dir.path()]).unwrap();

        assert_eq!(
            locate_program(&["MSBuild.exe", "msbuild.exe"], Some(&path)),
            Some(dir.path().join("MSBuild.exe"))
        );
        assert_eq!(locate_program(&["cl.exe"], Some(&path)), None);
        assert_eq!(locate_program(&["MSBuild.exe"], None), None);
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
