//! Host platform and toolchain resolution.
//!
//! A [`PlatformProfile`] is derived once at startup and never changes for the lifetime of the process.
//! Resolution never fails: an unrecognized OS degrades to [`OsFamily::Unknown`] with the
//! [`ToolchainKind::PosixAutotools`] toolchain, and the build step is responsible for rejecting it.

use std::fmt;

/// Operating-system family of the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
    /// Anything else; carries the raw `std::env::consts::OS` value for diagnostics.
    Unknown(String),
}

impl OsFamily {
    /// Map a `std::env::consts::OS`-style name to a family.
    pub fn from_os_name(name: &str) -> Self {
        match name {
            "linux" => OsFamily::Linux,
            "macos" => OsFamily::MacOs,
            "windows" => OsFamily::Windows,
            other => OsFamily::Unknown(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, OsFamily::Unknown(_))
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Windows => write!(f, "windows"),
            OsFamily::Unknown(name) => write!(f, "unknown ({name})"),
        }
    }
}

/// CPU architecture of the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Other(String),
}

impl Arch {
    /// Map a `std::env::consts::ARCH`-style name to an architecture.
    pub fn from_arch_name(name: &str) -> Self {
        match name {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            other => Arch::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Native toolchain family used to build the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolchainKind {
    /// `configure` + `make`, producing a static archive (`lib<name>.a`).
    PosixAutotools,
    /// MSBuild solution build, producing a static/import library (`<name>.lib`).
    Msvc,
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolchainKind::PosixAutotools => write!(f, "posix-autotools"),
            ToolchainKind::Msvc => write!(f, "msvc"),
        }
    }
}

/// Immutable description of the host the orchestrator runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub os_family: OsFamily,
    pub arch: Arch,
    pub toolchain_kind: ToolchainKind,
}

impl PlatformProfile {
    /// Build a profile from raw OS/arch names.
    ///
    /// ## Parameters
    /// - `os`: an OS name as reported by `std::env::consts::OS`.
    /// - `arch`: an architecture name as reported by `std::env::consts::ARCH`.
    ///
    /// ## Notes
    /// - Windows maps to [`ToolchainKind::Msvc`]; every other family, including unknown ones, maps to
    ///   [`ToolchainKind::PosixAutotools`].
    pub fn from_names(os: &str, arch: &str) -> Self {
        let os_family = OsFamily::from_os_name(os);
        let toolchain_kind = match os_family {
            OsFamily::Windows => ToolchainKind::Msvc,
            _ => ToolchainKind::PosixAutotools,
        };
        Self {
            os_family,
            arch: Arch::from_arch_name(arch),
            toolchain_kind,
        }
    }

    /// Whether this is an Apple Silicon host (`macos` + `aarch64`).
    pub fn is_apple_silicon(&self) -> bool {
        self.os_family == OsFamily::MacOs && self.arch == Arch::Aarch64
    }
}

impl fmt::Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.os_family, self.arch, self.toolchain_kind)
    }
}

/// Resolve the profile of the current host.
///
/// ## Returns
/// - (`PlatformProfile`): always succeeds; unknown hosts are logged and degrade to the POSIX toolchain.
pub fn resolve() -> PlatformProfile {
    let profile = PlatformProfile::from_names(std::env::consts::OS, std::env::consts::ARCH);
    if !profile.os_family.is_known() {
        tracing::warn!(
            os = std::env::consts::OS,
            "unrecognized operating system; assuming a POSIX autotools toolchain"
        );
    }
    if let Arch::Other(name) = &profile.arch {
        tracing::warn!(arch = %name, "unrecognized architecture");
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_maps_to_msvc() {
        let profile = PlatformProfile::from_names("windows", "x86_64");
        assert_eq!(profile.os_family, OsFamily::Windows);
        assert_eq!(profile.toolchain_kind, ToolchainKind::Msvc);
    }

    #[test]
    fn test_unknown_os_degrades_to_autotools() {
        let profile = PlatformProfile::from_names("plan9", "mips");
        assert_eq!(profile.os_family, OsFamily::Unknown("plan9".to_string()));
        assert_eq!(profile.arch, Arch::Other("mips".to_string()));
        assert_eq!(profile.toolchain_kind, ToolchainKind::PosixAutotools);
        assert!(!profile.os_family.is_known());
    }

    #[test]
    fn test_apple_silicon_detection() {
        assert!(PlatformProfile::from_names("macos", "aarch64").is_apple_silicon());
        assert!(!PlatformProfile::from_names("macos", "x86_64").is_apple_silicon());
        assert!(!PlatformProfile::from_names("linux", "aarch64").is_apple_silicon());
    }

    #[test]
    fn test_resolve_matches_host_constants() {
        let profile = resolve();
        assert_eq!(profile, PlatformProfile::from_names(std::env::consts::OS, std::env::consts::ARCH));
    }
}
