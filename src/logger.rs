//! Application diagnostics log, separate from the build output dispatchers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP_DIR: &str = "sandwright";
const LOG_FILE: &str = "sandwright.log";

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber writing to [`log_path`]. Safe to call twice.
pub fn init() -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let log_path = log_path()?;
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(&log_path)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(rolling::never(directory, file_name));
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    let _ = INIT.set(());
    Ok(())
}

/// `$XDG_STATE_HOME/sandwright/sandwright.log`, else under
/// `~/.local/state`, else the current directory.
pub fn log_path() -> Result<PathBuf> {
    let state_home = std::env::var("XDG_STATE_HOME").ok();
    match resolve_log_path(state_home.as_deref(), home::home_dir()) {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()?.join(LOG_FILE)),
    }
}

fn resolve_log_path(state_home: Option<&str>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(state_home) = state_home
        && !state_home.is_empty()
    {
        return Some(PathBuf::from(state_home).join(APP_DIR).join(LOG_FILE));
    }
    home_dir.map(|home| {
        home.join(".local")
            .join("state")
            .join(APP_DIR)
            .join(LOG_FILE)
    })
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
