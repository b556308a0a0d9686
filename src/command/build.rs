use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use tracing::info;

use super::args::{LogArgs, SourceArgs};
use crate::config::Config;
use crate::dispatch::{Classifier, LogDispatcher};
use crate::fetch::RetryingFetcher;
use crate::install::CondaInstall;
use crate::install::conda::conda_dispatcher;
use crate::sandbox::{BuildTool, Sandbox};
use crate::term::ConsoleSpinner;

pub struct BuildOptions {
    pub image: PathBuf,
    pub source: SourceArgs,
    pub conda_env: Option<PathBuf>,
    pub accept_licenses: bool,
    pub log: LogArgs,
}

pub fn run(options: BuildOptions) -> Result<()> {
    let config = Config::load()?;
    let base_image = options.source.resolve(&config)?;
    let settings = options.log.settings(&config);
    let tool = BuildTool::discover(config.build_binary.as_deref())?;

    // Paths are resolved before the sandbox changes the working directory.
    let image = std::path::absolute(&options.image)
        .with_context(|| format!("Invalid image path {}", options.image.display()))?;
    let conda_env = options
        .conda_env
        .as_deref()
        .map(|path| {
            path.canonicalize()
                .with_context(|| format!("Environment file {} not found", path.display()))
        })
        .transpose()?;

    info!(
        base_image = %base_image,
        image = %image.display(),
        binary = %tool.binary().display(),
        "build:start"
    );

    let console = ConsoleSpinner::new();
    let sandbox_log =
        LogDispatcher::new("sandbox", &settings, Classifier::build_tool(), console.writers())?;
    let mut sandbox = Sandbox::new(base_image, tool).with_log_dispatcher(sandbox_log);

    sandbox.session(|sb| {
        if let Some(env_file) = &conda_env {
            let conda_log = conda_dispatcher(&settings, console.writers())?;
            let fetcher = RetryingFetcher::new()?;
            CondaInstall::new()
                .env_file(Some(env_file.clone()))
                .accept_licenses(options.accept_licenses)
                .install(sb, &conda_log, &fetcher, &console)?;
        }
        sb.add_metadata()?;
        sb.build_image(&image)?;
        Ok(())
    })?;
    console.finish();

    info!(image = %image.display(), "build:done");
    println!("{} Built {}", style("✓").green(), image.display());
    Ok(())
}
