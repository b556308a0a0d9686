//! Miniforge-based conda bootstrap.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::InputSource;
use crate::dispatch::{
    Classifier, ConsoleWriters, LogDispatcher, LogSettings, all_of, cursor_escapes, progress_bars,
};
use crate::error::SandboxIntegrityViolation;
use crate::fetch::RetryingFetcher;
use crate::sandbox::Sandbox;

pub const DEFAULT_INSTALLER_URL: &str =
    "https://github.com/conda-forge/miniforge/releases/latest/download/Miniforge3-Linux-x86_64.sh";
const LICENSE_URL: &str = "https://github.com/conda-forge/miniforge/blob/main/LICENSE";
pub const CONDA_PREFIX: &str = "/opt/conda";

/// Paths inside the sandbox, relative to its root.
const INSTALLER_FILE: &str = "sandwright-miniforge.sh";
const ENV_FILE: &str = "sandwright-environment.yml";

/// Dispatcher for conda output: conda's own severity words, with download
/// progress and cursor juggling dropped.
pub fn conda_dispatcher(settings: &LogSettings, console: ConsoleWriters) -> Result<LogDispatcher> {
    Ok(
        LogDispatcher::new("conda", settings, Classifier::conda(), console)?
            .with_filter(all_of(vec![progress_bars(), cursor_escapes()])),
    )
}

/// Installs conda into the sandbox and registers it in the image environment.
#[derive(Debug, Clone)]
pub struct CondaInstall {
    installer_url: String,
    env_file: Option<PathBuf>,
    accept_licenses: bool,
}

impl Default for CondaInstall {
    fn default() -> Self {
        Self {
            installer_url: DEFAULT_INSTALLER_URL.to_string(),
            env_file: None,
            accept_licenses: false,
        }
    }
}

impl CondaInstall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installer_url(mut self, url: impl Into<String>) -> Self {
        self.installer_url = url.into();
        self
    }

    /// Environment file applied to the base environment after install.
    pub fn env_file(mut self, path: Option<PathBuf>) -> Self {
        self.env_file = path;
        self
    }

    pub fn accept_licenses(mut self, accept: bool) -> Self {
        self.accept_licenses = accept;
        self
    }

    pub fn install(
        &self,
        sandbox: &Sandbox,
        dispatcher: &LogDispatcher,
        fetcher: &RetryingFetcher,
        input: &dyn InputSource,
    ) -> Result<()> {
        let staging = sandbox.staging_dir()?.to_path_buf();
        let host_prefix = staging.join(CONDA_PREFIX.trim_start_matches('/'));
        if host_prefix.exists() {
            return Err(SandboxIntegrityViolation(format!(
                "{CONDA_PREFIX} already exists in the sandbox; refusing to install conda over it"
            ))
            .into());
        }
        let env_file = match &self.env_file {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("Failed to read environment file {}", path.display()))?,
            ),
            None => None,
        };

        let installer = staging.join(INSTALLER_FILE);
        info!(url = %self.installer_url, "conda:download");
        fetcher
            .fetch_to_file(&self.installer_url, &installer)
            .context("Failed to download the Miniforge installer")?;

        let result = self.run_installer(sandbox, dispatcher, input, env_file.as_deref());
        remove_if_present(&installer)?;
        result
    }

    fn run_installer(
        &self,
        sandbox: &Sandbox,
        dispatcher: &LogDispatcher,
        input: &dyn InputSource,
        env_file: Option<&str>,
    ) -> Result<()> {
        if !self.accept_licenses {
            let answer = input.read_input(&format!(
                "Miniforge is distributed under the terms at {LICENSE_URL}\n\
                 Do you accept the license terms? [yes|no] "
            ))?;
            if !answer.trim().eq_ignore_ascii_case("yes") {
                bail!("The Miniforge license was not accepted; pass --accept-licenses to accept it");
            }
        }

        let installer = format!("/{INSTALLER_FILE}");
        sandbox
            .run_command_with(
                ["bash", installer.as_str(), "-b", "-s", "-p", CONDA_PREFIX],
                dispatcher,
            )
            .context("Miniforge installer failed")?;
        sandbox.add_to_env(&format!(". {CONDA_PREFIX}/etc/profile.d/conda.sh"))?;
        sandbox.add_to_env("conda activate base")?;
        debug!("conda:registered");

        let conda = format!("{CONDA_PREFIX}/bin/conda");
        if let Some(content) = env_file {
            let staged = sandbox.staging_dir()?.join(ENV_FILE);
            fs::write(&staged, content)
                .with_context(|| format!("Failed to stage environment file at {}", staged.display()))?;
            let inside = format!("/{ENV_FILE}");
            let updated = sandbox
                .run_command_with(
                    [conda.as_str(), "env", "update", "-n", "base", "--file", inside.as_str()],
                    dispatcher,
                )
                .context("Failed to install the conda environment");
            remove_if_present(&staged)?;
            updated?;
        }

        sandbox
            .run_command_with([conda.as_str(), "clean", "-y", "-a"], dispatcher)
            .context("Failed to clean the conda package cache")?;
        info!("conda:installed");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
