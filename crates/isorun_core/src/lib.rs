//! Provide the shared, IO-free vocabulary of the isorun orchestrator.
//!
//! Everything in this crate is plain data plus pure helpers. Process spawning, filesystem lookups and
//! toolchain invocation live in the `isorun` crate; this crate only describes *what* those layers talk about:
//!
//! - [`platform`]: the host [`PlatformProfile`] (OS family, architecture, toolchain kind) and its resolver.
//! - [`outcome`]: per-test [`TestOutcome`]s and the aggregated [`RunReport`].
//! - [`target`]: the container platform-target registry (`linux`, `windows`, `windows-sim`).
//!
//! ## Notes
//!
//! - [`platform::resolve`] is the only function here that reads host state, and it only reads compile-time
//!   constants (`std::env::consts`).

pub mod outcome;
pub mod platform;
pub mod target;

pub use outcome::{RunReport, TestOutcome, TestStatus};
pub use platform::{Arch, OsFamily, PlatformProfile, ToolchainKind, resolve};
pub use target::{PlatformTarget, TargetInfo};
