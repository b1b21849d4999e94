//! Preload environment synthesis
//!
//! Computes the dynamic-loader preload variable that injects the allocator into child processes.
//!
//! ## Merge contract
//!
//! A value of the variable inherited from the caller's environment is never overwritten: the injected
//! library paths come first, then the inherited value verbatim (`new + ":" + inherited`). See
//! [`merge_preload`].
//!
//! ## Notes
//!
//! - Preloading is an optimization. When no preloadable library exists the preload is inactive, a warning is
//!   logged, and children inherit the caller's environment unchanged.
//! - The static archive produced by the build pipeline cannot be preloaded itself; the synthesizer looks
//!   for a shared library next to it first, then in the platform's usual install locations.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;

use isorun_core::{Arch, OsFamily, PlatformProfile};

use crate::build::BuildArtifact;
use crate::config::AllocatorConfig;

/// Separator between entries of the preload variable.
pub const PRELOAD_SEPARATOR: &str = ":";

/// Preload variable for an OS family, if the platform has one.
pub fn preload_variable(os: &OsFamily) -> Option<&'static str> {
    match os {
        OsFamily::Linux => Some("LD_PRELOAD"),
        OsFamily::MacOs => Some("DYLD_INSERT_LIBRARIES"),
        OsFamily::Windows | OsFamily::Unknown(_) => None,
    }
}

/// Merge injected libraries in front of an inherited preload value.
///
/// ## Parameters
/// - `injected`: library paths to load first, in order.
/// - `inherited`: the caller's existing value of the variable, if any.
///
/// ## Returns
/// - (`OsString`): `injected` joined by [`PRELOAD_SEPARATOR`], followed by the separator and `inherited`
///   when `inherited` is non-empty. `inherited` is appended byte-for-byte.
pub fn merge_preload(injected: &[PathBuf], inherited: Option<&OsStr>) -> OsString {
    let mut merged = OsString::new();
    for (i, path) in injected.iter().enumerate() {
        if i > 0 {
            merged.push(PRELOAD_SEPARATOR);
        }
        merged.push(path.as_os_str());
    }
    if let Some(inherited) = inherited.filter(|v| !v.is_empty()) {
        if !merged.is_empty() {
            merged.push(PRELOAD_SEPARATOR);
        }
        merged.push(inherited);
    }
    merged
}

/// Preload variable plus the libraries to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadSpec {
    /// `None` on platforms without a loader preload mechanism.
    pub variable_name: Option<&'static str>,
    /// Libraries to inject, first entry loads first. Empty means "no preload".
    pub libraries: Vec<PathBuf>,
    /// Caller-provided value of the variable at synthesis time.
    pub inherited: Option<OsString>,
}

impl PreloadSpec {
    /// A preload that changes nothing.
    pub fn inactive(variable_name: Option<&'static str>, inherited: Option<OsString>) -> Self {
        Self {
            variable_name,
            libraries: Vec::new(),
            inherited,
        }
    }

    pub fn is_active(&self) -> bool {
        self.variable_name.is_some() && !self.libraries.is_empty()
    }

    /// The value children should see, or `None` when the environment is left untouched.
    pub fn value(&self) -> Option<OsString> {
        if !self.is_active() {
            return None;
        }
        Some(merge_preload(&self.libraries, self.inherited.as_deref()))
    }

    /// Set the variable on a command about to be spawned.
    pub fn apply(&self, command: &mut Command) {
        if let (Some(name), Some(value)) = (self.variable_name, self.value()) {
            command.env(name, value);
        }
    }

    /// Shell `export` line equivalent to [`PreloadSpec::apply`].
    pub fn export_line(&self) -> Option<String> {
        let name = self.variable_name?;
        let first = self.libraries.first()?;
        Some(format!("export {name}={}:${name}", first.display()))
    }
}

/// Package-manager commands that install a preloadable allocator on `os`.
pub fn install_instructions(os: &OsFamily) -> &'static [&'static str] {
    match os {
        OsFamily::Linux => &[
            "Ubuntu/Debian: sudo apt-get install libjemalloc-dev libjemalloc2",
            "CentOS/RHEL/Fedora: sudo yum install jemalloc-devel",
        ],
        OsFamily::MacOs => &["brew install jemalloc"],
        OsFamily::Windows | OsFamily::Unknown(_) => &[],
    }
}

/// Shared-library file names for the allocator on `os`.
fn shared_names(os: &OsFamily, name: &str) -> Vec<String> {
    match os {
        OsFamily::MacOs => vec![format!("lib{name}.2.dylib"), format!("lib{name}.dylib")],
        _ => vec![format!("lib{name}.so.2"), format!("lib{name}.so")],
    }
}

/// Well-known system install directories, most likely first.
fn install_dirs(profile: &PlatformProfile) -> Vec<PathBuf> {
    match profile.os_family {
        OsFamily::Linux => {
            let triple = match profile.arch {
                Arch::Aarch64 => "aarch64-linux-gnu",
                _ => "x86_64-linux-gnu",
            };
            vec![
                PathBuf::from(format!("/lib/{triple}")),
                PathBuf::from(format!("/usr/lib/{triple}")),
                PathBuf::from("/usr/lib64"),
                PathBuf::from("/usr/local/lib"),
            ]
        }
        OsFamily::MacOs if profile.is_apple_silicon() => {
            vec![PathBuf::from("/opt/homebrew/lib"), PathBuf::from("/usr/local/lib")]
        }
        OsFamily::MacOs => vec![PathBuf::from("/usr/local/lib"), PathBuf::from("/opt/homebrew/lib")],
        OsFamily::Windows | OsFamily::Unknown(_) => Vec::new(),
    }
}

/// Every location searched for a preloadable library, in preference order.
///
/// Build location (next to the artifact) first, then configured extra paths, then system install
/// locations.
pub fn candidate_libraries(
    profile: &PlatformProfile,
    artifact: Option<&BuildArtifact>,
    config: &AllocatorConfig,
) -> Vec<PathBuf> {
    let names = shared_names(&profile.os_family, &config.name);
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = artifact.and_then(|a| a.expected_output_path.parent()) {
        candidates.extend(names.iter().map(|n| dir.join(n)));
    }
    candidates.extend(config.extra_preload_paths.iter().cloned());
    for dir in install_dirs(profile) {
        candidates.extend(names.iter().map(|n| dir.join(n)));
    }
    candidates
}

/// Build a preload from an explicit candidate list and inherited value.
///
/// The first candidate that exists on disk is injected.
pub fn synthesize_from(profile: &PlatformProfile, candidates: &[PathBuf], inherited: Option<OsString>) -> PreloadSpec {
    let Some(variable) = preload_variable(&profile.os_family) else {
        tracing::info!(os = %profile.os_family, "no loader preload mechanism on this platform");
        return PreloadSpec::inactive(None, inherited);
    };

    match candidates.iter().find(|c| c.is_file()) {
        Some(library) => {
            tracing::info!(variable, library = %library.display(), "allocator will be preloaded");
            PreloadSpec {
                variable_name: Some(variable),
                libraries: vec![library.clone()],
                inherited,
            }
        }
        None => {
            tracing::warn!(
                variable,
                searched = candidates.len(),
                "no preloadable allocator library found; running without preload"
            );
            PreloadSpec::inactive(Some(variable), inherited)
        }
    }
}

/// Compute the preload environment for child processes of this run.
///
/// Reads the caller's current value of the platform variable so it can be preserved.
pub fn synthesize(profile: &PlatformProfile, artifact: Option<&BuildArtifact>, config: &AllocatorConfig) -> PreloadSpec {
    let inherited = preload_variable(&profile.os_family).and_then(std::env::var_os);
    let candidates = candidate_libraries(profile, artifact, config);
    synthesize_from(profile, &candidates, inherited)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::Path;

    fn linux() -> PlatformProfile {
        PlatformProfile::from_names("linux", "x86_64")
    }

    #[test]
    fn test_preload_variable_per_os() {
        assert_eq!(preload_variable(&OsFamily::Linux), Some("LD_PRELOAD"));
        assert_eq!(preload_variable(&OsFamily::MacOs), Some("DYLD_INSERT_LIBRARIES"));
        assert_eq!(preload_variable(&OsFamily::Windows), None);
    }

    #[test]
    fn test_merge_without_inherited() {
        let merged = merge_preload(&[PathBuf::from("/a/libjemalloc.so.2")], None);
        assert_eq!(merged, OsString::from("/a/libjemalloc.so.2"));
        let merged = merge_preload(&[PathBuf::from("/a/x.so")], Some(OsStr::new("")));
        assert_eq!(merged, OsString::from("/a/x.so"));
    }

    #[test]
    fn test_merge_puts_new_library_first() {
        let merged = merge_preload(&[PathBuf::from("/new.so")], Some(OsStr::new("/old1.so:/old2.so")));
        assert_eq!(merged, OsString::from("/new.so:/old1.so:/old2.so"));
    }

    #[test]
    fn test_synthesize_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("lib/libjemalloc.so.2");
        let present = dir.path().join("usr/libjemalloc.so.2");
        std::fs::create_dir_all(present.parent().unwrap()).unwrap();
        std::fs::write(&present, b"").unwrap();

        let spec = synthesize_from(&linux(), &[missing, present.clone()], Some(OsString::from("/caller.so")));
        assert!(spec.is_active());
        assert_eq!(spec.libraries, vec![present.clone()]);
        let expected = format!("{}:/caller.so", present.display());
        assert_eq!(spec.value(), Some(OsString::from(expected)));
    }

    #[test]
    fn test_absent_library_degrades_and_keeps_inherited() {
        let spec = synthesize_from(
            &linux(),
            &[PathBuf::from("/definitely/not/here/libjemalloc.so.2")],
            Some(OsString::from("/caller.so")),
        );
        assert!(!spec.is_active());
        assert_eq!(spec.value(), None);
        assert_eq!(spec.inherited, Some(OsString::from("/caller.so")));
        assert_eq!(spec.export_line(), None);
    }

    #[test]
    fn test_windows_never_preloads() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("jemalloc.dll");
        std::fs::write(&lib, b"").unwrap();
        let spec = synthesize_from(&PlatformProfile::from_names("windows", "x86_64"), &[lib], None);
        assert_eq!(spec.variable_name, None);
        assert!(!spec.is_active());
    }

    #[test]
    fn test_apple_silicon_prefers_homebrew_prefix() {
        let config = AllocatorConfig::default();
        let arm = candidate_libraries(&PlatformProfile::from_names("macos", "aarch64"), None, &config);
        let intel = candidate_libraries(&PlatformProfile::from_names("macos", "x86_64"), None, &config);
        assert!(arm[0].starts_with("/opt/homebrew/lib"));
        assert!(intel[0].starts_with("/usr/local/lib"));
        assert!(arm.iter().all(|p| p.extension().is_some_and(|e| e == "dylib")));
    }

    #[test]
    fn test_build_location_searched_before_system() {
        let config = AllocatorConfig {
            extra_preload_paths: vec![PathBuf::from("/opt/custom/libjemalloc.so.2")],
            ..AllocatorConfig::default()
        };
        let artifact = BuildArtifact::query(Path::new("deps/jemalloc"), Path::new("deps/jemalloc/lib/libjemalloc.a"));
        let candidates = candidate_libraries(&linux(), Some(&artifact), &config);
        assert_eq!(candidates[0], PathBuf::from("deps/jemalloc/lib/libjemalloc.so.2"));
        assert_eq!(candidates[2], PathBuf::from("/opt/custom/libjemalloc.so.2"));
        assert_eq!(candidates[3], PathBuf::from("/lib/x86_64-linux-gnu/libjemalloc.so.2"));
    }

    #[test]
    fn test_install_instructions() {
        assert!(install_instructions(&OsFamily::MacOs)[0].contains("brew"));
        assert_eq!(install_instructions(&OsFamily::Linux).len(), 2);
        assert!(install_instructions(&OsFamily::Windows).is_empty());
    }

    #[test]
    fn test_export_line() {
        let spec = PreloadSpec {
            variable_name: Some("LD_PRELOAD"),
            libraries: vec![PathBuf::from("/usr/lib64/libjemalloc.so.2")],
            inherited: None,
        };
        assert_eq!(
            spec.export_line().unwrap(),
            "export LD_PRELOAD=/usr/lib64/libjemalloc.so.2:$LD_PRELOAD"
        );
    }

    proptest! {
        /// Merging never loses or reorders the inherited value.
        #[test]
        fn merge_law_holds(
            new_path in "/[a-z]{1,12}/lib[a-z]{1,8}\\.so",
            inherited in "[a-z/:.]{1,40}",
        ) {
            let merged = merge_preload(&[PathBuf::from(&new_path)], Some(OsStr::new(&inherited)));
            prop_assert_eq!(merged, OsString::from(format!("{new_path}:{inherited}")));
        }
    }
}
