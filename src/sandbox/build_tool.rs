//! Argument vectors for the external container build binary.

use anyhow::{Result, bail};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cmd::Cmd;

/// Binaries tried, in order, when none is configured.
const CANDIDATES: [&str; 2] = ["apptainer", "singularity"];

/// The build binary that materializes sandboxes and images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTool {
    binary: PathBuf,
}

impl BuildTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Use `configured` if given, otherwise the first candidate on `PATH`.
    pub fn discover(configured: Option<&Path>) -> Result<Self> {
        if let Some(path) = configured {
            debug!(binary = %path.display(), "build_tool:configured");
            return Ok(Self::new(path));
        }
        for name in CANDIDATES {
            if let Ok(path) = which::which(name) {
                debug!(binary = %path.display(), "build_tool:discovered");
                return Ok(Self::new(path));
            }
        }
        bail!(
            "No container build binary found. Install one of: {} (or set build_binary in the config)",
            CANDIDATES.join(", ")
        )
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `build --sandbox --force --fix-perms <dir> <base_image>`
    pub fn create_sandbox(&self, dir: &Path, base_image: &str) -> Cmd {
        Cmd::new(&self.binary)
            .args(["build", "--sandbox", "--force", "--fix-perms"])
            .arg(dir)
            .arg(base_image)
    }

    /// `build --force <image> <dir>`
    pub fn build_image(&self, image: &Path, dir: &Path) -> Cmd {
        Cmd::new(&self.binary)
            .args(["build", "--force"])
            .arg(image)
            .arg(dir)
    }

    /// `exec --writable <dir> <command...>`
    pub fn exec<I, S>(&self, dir: &Path, command: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Cmd::new(&self.binary)
            .args(["exec", "--writable"])
            .arg(dir)
            .args(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_vectors() {
        let tool = BuildTool::new("/usr/bin/apptainer");
        let dir = Path::new("/tmp/stage");

        assert_eq!(
            tool.create_sandbox(dir, "alpine:latest").argv(),
            [
                "/usr/bin/apptainer",
                "build",
                "--sandbox",
                "--force",
                "--fix-perms",
                "/tmp/stage",
                "alpine:latest"
            ]
        );
        assert_eq!(
            tool.build_image(Path::new("/out/app.sif"), dir).argv(),
            ["/usr/bin/apptainer", "build", "--force", "/out/app.sif", "/tmp/stage"]
        );
        assert_eq!(
            tool.exec(dir, ["sh", "-c", "true"]).argv(),
            ["/usr/bin/apptainer", "exec", "--writable", "/tmp/stage", "sh", "-c", "true"]
        );
    }

    #[test]
    fn configured_binary_wins() {
        let tool = BuildTool::discover(Some(Path::new("/opt/custom/apptainer"))).unwrap();
        assert_eq!(tool.binary(), Path::new("/opt/custom/apptainer"));
    }
}
