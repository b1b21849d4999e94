//! Container engine boundary.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::process::Termination;

/// Operations the matrix runner needs from a container engine.
pub trait ContainerEngine {
    /// The daemon's OS type (`linux`, `windows`).
    fn os_type(&self) -> io::Result<String>;

    /// Build the image for a service definition.
    fn build(&self, service: &str) -> io::Result<Termination>;

    /// Run a service to completion; its exit status is the target's outcome.
    fn run(&self, service: &str) -> io::Result<Termination>;
}

/// `docker compose` against a compose file.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    pub program: String,
    pub compose_file: PathBuf,
}

impl DockerCompose {
    pub fn new(compose_file: &Path) -> Self {
        Self {
            program: "docker".to_string(),
            compose_file: compose_file.to_path_buf(),
        }
    }

    fn compose(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("compose").arg("-f").arg(&self.compose_file).args(args);
        command
    }
}

impl ContainerEngine for DockerCompose {
    fn os_type(&self) -> io::Result<String> {
        let output = Command::new(&self.program)
            .args(["info", "--format", "{{.OSType}}"])
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "`{} info` failed ({}): {}",
                self.program,
                Termination::from_status(output.status),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_lowercase())
    }

    fn build(&self, service: &str) -> io::Result<Termination> {
        tracing::info!(service, compose = %self.compose_file.display(), "building container image");
        let status = self.compose(&["build", service]).stdin(Stdio::null()).status()?;
        Ok(Termination::from_status(status))
    }

    fn run(&self, service: &str) -> io::Result<Termination> {
        tracing::info!(service, "running container");
        let status = self.compose(&["run", "--rm", service]).stdin(Stdio::null()).status()?;
        Ok(Termination::from_status(status))
    }
}
