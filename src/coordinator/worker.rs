//! One worker process and its line protocol.
//!
//! A worker reads one test identifier per stdin line and reports each finished test as a JSON line on
//! stdout (`{"event":"result","test":"<id>","status":"passed"}`). Everything else it prints, on either
//! stream, is log. Closing stdin asks it to exit.
//!
//! Both output streams are drained by dedicated reader threads that forward lines to the coordinator's
//! channel, tagged with the slot and spawn generation so lines from a replaced process can be ignored.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::preload::PreloadSpec;
use crate::process::{Termination, send_sigterm};

/// Default worker host: a pytest driver speaking the line protocol, run with `python -c`.
pub const WORKER_HOST_SOURCE: &str = include_str!("worker_host.py");

/// Time allowed between SIGTERM and a forced kill.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// How to launch a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub preload: PreloadSpec,
}

impl WorkerSpec {
    /// Build from a `worker_command` line (program followed by arguments).
    pub fn from_command_line(command: &[String], preload: PreloadSpec) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
            preload,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        self.preload.apply(&mut command);
        command
    }
}

// ============================================================================
// Protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Something a reader thread observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Line { stream: Stream, line: String },
    Closed(Stream),
}

/// Envelope sent over the coordinator channel.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub slot: usize,
    pub generation: u64,
    pub event: WorkerEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ProtocolLine {
    Result { test: String, status: String },
}

/// A parsed `result` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedResult {
    pub test_id: String,
    pub passed: bool,
}

/// Parse a stdout line as a result report; anything else is log.
///
/// Any status other than `passed` is reported as a failure.
pub fn parse_result_line(line: &str) -> Option<ReportedResult> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<ProtocolLine>(trimmed).ok()? {
        ProtocolLine::Result { test, status } => Some(ReportedResult {
            test_id: test,
            passed: status == "passed",
        }),
    }
}

// ============================================================================
// Process handle
// ============================================================================

/// A live worker process.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    open_streams: u8,
    exit: Option<(Termination, Instant)>,
}

impl WorkerProcess {
    /// Spawn a worker and start its reader threads.
    pub fn spawn(spec: &WorkerSpec, slot: usize, generation: u64, tx: &Sender<WorkerMessage>) -> io::Result<Self> {
        let mut child = spec.command().spawn()?;
        let stdin = child.stdin.take();
        let mut open_streams = 0;
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout, slot, generation, tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr, slot, generation, tx.clone());
            open_streams += 1;
        }
        tracing::debug!(slot, generation, pid = child.id(), "worker spawned");
        Ok(Self {
            child,
            stdin,
            open_streams,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send one test identifier.
    pub fn dispatch(&mut self, test_id: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin already closed"))?;
        writeln!(stdin, "{test_id}")?;
        stdin.flush()
    }

    /// Ask the worker to exit once it is idle.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    pub fn is_closing(&self) -> bool {
        self.stdin.is_none()
    }

    /// Record that a reader thread hit end of stream.
    pub fn stream_closed(&mut self) {
        self.open_streams = self.open_streams.saturating_sub(1);
    }

    /// The process's termination, once it has exited and its output has been fully forwarded.
    ///
    /// Output is considered fully forwarded when both streams reported EOF, or `drain_grace` elapsed after
    /// the exit was first observed (a grandchild may still hold a stream open).
    pub fn finished(&mut self, drain_grace: Duration) -> Option<Termination> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some((Termination::from_status(status), Instant::now())),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(pid = self.child.id(), error = %e, "failed to poll worker");
                    self.exit = Some((Termination::Unknown, Instant::now()));
                }
            }
        }
        let (termination, seen_at) = self.exit?;
        if self.open_streams == 0 || seen_at.elapsed() >= drain_grace {
            Some(termination)
        } else {
            None
        }
    }

    /// Kill immediately and reap.
    pub fn kill(&mut self) {
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// SIGTERM, wait briefly, then kill.
    pub fn terminate(&mut self) {
        self.stdin = None;
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = send_sigterm(self.child.id());
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.terminate();
        }
    }
}

fn forward_lines<R: Read + Send + 'static>(
    reader: R,
    stream: Stream,
    slot: usize,
    generation: u64,
    tx: Sender<WorkerMessage>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
            // Native output is not guaranteed to be UTF-8; keep draining whatever arrives.
            let line = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
            let message = WorkerMessage {
                slot,
                generation,
                event: WorkerEvent::Line { stream, line },
            };
            if tx.send(message).is_err() {
                return;
            }
        }
        let _ = tx.send(WorkerMessage {
            slot,
            generation,
            event: WorkerEvent::Closed(stream),
        });
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_line() {
        assert_eq!(
            parse_result_line(r#"{"event":"result","test":"tests/a.py::t1","status":"passed"}"#),
            Some(ReportedResult {
                test_id: "tests/a.py::t1".to_string(),
                passed: true,
            })
        );
        let failed = parse_result_line(r#" {"event":"result","test":"t2","status":"error"} "#).unwrap();
        assert!(!failed.passed);
    }

    #[test]
    fn test_non_protocol_lines_are_log() {
        assert_eq!(parse_result_line("Segmentation fault (core dumped)"), None);
        assert_eq!(parse_result_line(r#"{"event":"progress","pct":50}"#), None);
        assert_eq!(parse_result_line("{not json"), None);
        assert_eq!(parse_result_line(r#"{"event":"result","test":"t"}"#), None);
    }

    #[test]
    fn test_forward_lines_survives_invalid_utf8() {
        let (tx, rx) = std::sync::mpsc::channel();
        let bytes = b"caf\xe9 output\r\n{\"event\":\"result\",\"test\":\"t\",\"status\":\"passed\"}\ntail".to_vec();
        forward_lines(io::Cursor::new(bytes), Stream::Stdout, 2, 7, tx);

        let events: Vec<WorkerEvent> = rx.iter().map(|m| m.event).collect();
        assert_eq!(
            events,
            vec![
                WorkerEvent::Line {
                    stream: Stream::Stdout,
                    line: "caf\u{fffd} output".to_string(),
                },
                WorkerEvent::Line {
                    stream: Stream::Stdout,
                    line: r#"{"event":"result","test":"t","status":"passed"}"#.to_string(),
                },
                WorkerEvent::Line {
                    stream: Stream::Stdout,
                    line: "tail".to_string(),
                },
                WorkerEvent::Closed(Stream::Stdout),
            ]
        );
    }

    #[test]
    fn test_spec_from_command_line() {
        let line = vec!["python".to_string(), "-m".to_string(), "worker".to_string()];
        let spec = WorkerSpec::from_command_line(&line, PreloadSpec::inactive(None, None)).unwrap();
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["-m".to_string(), "worker".to_string()]);
        assert!(WorkerSpec::from_command_line(&[], PreloadSpec::inactive(None, None)).is_none());
    }
}
