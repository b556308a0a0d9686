use std::path::PathBuf;

use clap::ArgAction;

use crate::config::Config;
use crate::dispatch::LogSettings;

#[derive(clap::Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Show more build output (repeatable)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Show less build output (repeatable)
    #[arg(short = 'q', long, action = ArgAction::Count)]
    pub quiet: u8,

    /// Also write build output to PATH.out and PATH.err
    #[arg(long, value_name = "PATH", value_hint = clap::ValueHint::FilePath)]
    pub log_to_file: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl LogArgs {
    /// Count of `-v` minus count of `-q`.
    pub fn verbosity(&self) -> i8 {
        let level = i16::from(self.verbose) - i16::from(self.quiet);
        level.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8
    }

    /// Flags win over the config file.
    pub fn settings(&self, config: &Config) -> LogSettings {
        LogSettings::new(
            self.verbosity(),
            self.log_to_file.clone().or_else(|| config.log_file.clone()),
            self.no_color || config.no_color(),
        )
    }
}

#[derive(clap::Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SourceArgs {
    /// Image the sandbox is created from (e.g. docker://alpine:latest)
    #[arg(long, value_name = "REF")]
    pub base_image: Option<String>,

    /// Named system from the config file
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,
}

impl SourceArgs {
    /// The base image reference, looking `--system` up in `config`.
    pub fn resolve(&self, config: &Config) -> anyhow::Result<String> {
        match (&self.base_image, &self.system) {
            (Some(image), _) => Ok(image.clone()),
            (None, Some(name)) => Ok(config.system(name)?.base_image.clone()),
            (None, None) => Err(anyhow::anyhow!("Either --base-image or --system is required")),
        }
    }
}
