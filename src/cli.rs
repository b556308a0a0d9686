use crate::command;
use crate::command::args::{LogArgs, SourceArgs};
use crate::command::build::BuildOptions;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "sandwright")]
#[command(
    about = "Build container images by populating a sandbox from a base image and installing packages into it"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a base image or a configured system
    Build {
        /// Path of the image to produce (overwritten if it exists)
        #[arg(value_hint = clap::ValueHint::FilePath)]
        image: PathBuf,

        #[command(flatten)]
        source: SourceArgs,

        /// Install conda into the image and apply this environment file
        #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        conda_env: Option<PathBuf>,

        /// Accept third-party licence terms without asking
        #[arg(long)]
        accept_licenses: bool,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Show the configuration and known systems
    Info,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            image,
            source,
            conda_env,
            accept_licenses,
            log,
        } => command::build::run(BuildOptions {
            image,
            source,
            conda_env,
            accept_licenses,
            log,
        }),
        Commands::Info => command::info::run(),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("sandwright").chain(args.iter().copied()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_counts_verbosity_flags() {
        let cli = parse(&["build", "out.sif", "--base-image", "alpine:latest", "-vv", "-q"]).unwrap();
        let Commands::Build { image, source, log, .. } = cli.command else {
            panic!("expected build");
        };
        assert_eq!(image, PathBuf::from("out.sif"));
        assert_eq!(source.base_image.as_deref(), Some("alpine:latest"));
        assert_eq!(log.verbosity(), 1);
    }

    #[test]
    fn build_needs_exactly_one_source() {
        assert!(parse(&["build", "out.sif"]).is_err());
        assert!(
            parse(&["build", "out.sif", "--base-image", "a", "--system", "b"]).is_err()
        );
        assert!(parse(&["build", "out.sif", "--system", "hpc"]).is_ok());
    }

    #[test]
    fn build_options() {
        let cli = parse(&[
            "build",
            "out.sif",
            "--system",
            "hpc",
            "--conda-env",
            "env.yml",
            "--accept-licenses",
            "--log-to-file",
            "/tmp/build",
            "--no-color",
        ])
        .unwrap();
        let Commands::Build {
            conda_env,
            accept_licenses,
            log,
            ..
        } = cli.command
        else {
            panic!("expected build");
        };
        assert_eq!(conda_env, Some(PathBuf::from("env.yml")));
        assert!(accept_licenses);
        assert!(log.no_color);
        assert_eq!(log.log_to_file, Some(PathBuf::from("/tmp/build")));
    }
}
