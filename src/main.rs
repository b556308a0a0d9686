mod cli;
mod cmd;
mod command;
mod config;
mod dispatch;
mod error;
mod fetch;
mod install;
mod logger;
mod sandbox;
mod term;

use std::process::ExitCode;

use console::style;
use tracing::{error, info};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "sandwright start");

    match cli::run() {
        Ok(()) => {
            info!("sandwright finished successfully");
            Ok(())
        }
        Err(err) => {
            error!(error = ?err, "sandwright failed");
            Err(err)
        }
    }
}
