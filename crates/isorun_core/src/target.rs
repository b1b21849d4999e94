//! Container platform-target registry.
//!
//! This module centralizes the recognized target spellings so the CLI, the matrix runner and the config
//! loader agree on one vocabulary.

use std::fmt;

/// Stable identifier for a container platform target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlatformTarget {
    Linux,
    /// Native Windows containers; requires an engine whose daemon OS type is `windows`.
    Windows,
    /// Windows compatibility layer running on the same engine as `linux`.
    WindowsSimulated,
}

/// Metadata entry for a platform target.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub id: PlatformTarget,
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    /// Daemon OS type the container engine must report for this target to run.
    pub engine_os_type: &'static str,
}

/// Registry of supported targets, in matrix execution order.
pub const TARGETS: &[TargetInfo] = &[
    TargetInfo {
        id: PlatformTarget::Linux,
        canonical: "linux",
        aliases: &[],
        description: "Linux container image.",
        engine_os_type: "linux",
    },
    TargetInfo {
        id: PlatformTarget::Windows,
        canonical: "windows",
        aliases: &[],
        description: "Native Windows container image.",
        engine_os_type: "windows",
    },
    TargetInfo {
        id: PlatformTarget::WindowsSimulated,
        canonical: "windows-sim",
        aliases: &["windows_sim", "windows-simulated", "windows_simulated"],
        description: "Windows compatibility-layer image on a Linux engine.",
        engine_os_type: "linux",
    },
];

/// Resolve a target name (canonical or alias) to its stable id.
pub fn from_str(name: &str) -> Option<PlatformTarget> {
    if let Some(info) = TARGETS.iter().find(|t| t.canonical == name) {
        return Some(info.id);
    }
    TARGETS.iter().find(|t| t.aliases.contains(&name)).map(|t| t.id)
}

/// Return the canonical spelling for a target.
pub fn as_str(id: PlatformTarget) -> &'static str {
    info_for(id).canonical
}

/// Return the metadata entry for a target.
pub fn info_for(id: PlatformTarget) -> &'static TargetInfo {
    // Every variant has exactly one registry row (guarded by tests/target_registry_guardrails.rs).
    match id {
        PlatformTarget::Linux => &TARGETS[0],
        PlatformTarget::Windows => &TARGETS[1],
        PlatformTarget::WindowsSimulated => &TARGETS[2],
    }
}

impl PlatformTarget {
    pub fn as_str(self) -> &'static str {
        as_str(self)
    }

    /// Whether the engine's reported OS type can host this target.
    pub fn supported_by(self, engine_os_type: &str) -> bool {
        info_for(self).engine_os_type.eq_ignore_ascii_case(engine_os_type.trim())
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
