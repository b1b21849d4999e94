#![deny(unsafe_code)]
//! isorun: allocator build pipeline and crash-isolating test orchestrator
//!
//! isorun builds a native memory allocator from source for the host platform, injects it into test processes
//! through the platform's preload mechanism, and runs test suites across a pool of worker processes so that a
//! segfault or abort in one test is recorded as a crash instead of taking the whole run down. A container
//! matrix runs the same suites on Linux and (real or simulated) Windows images.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module enforces
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Unsafe code**: Denied crate-wide. The single exception is SIGTERM delivery in [`process::send_sigterm`].

pub mod build;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod interrupt;
pub mod matrix;
pub mod native;
pub mod preload;
pub mod process;
pub mod suite;
pub mod version;

pub use isorun_core::{PlatformProfile, PlatformTarget, RunReport, TestOutcome, TestStatus};

pub use build::{AllocatorBuilder, BuildArtifact, BuildError};
pub use config::IsorunConfig;
pub use coordinator::{Coordinator, CoordinatorOptions, RunMode, RunReporter, WorkerSpec};
pub use matrix::{MatrixReport, MatrixRunner, MatrixSelection};
pub use preload::PreloadSpec;
pub use process::Termination;
