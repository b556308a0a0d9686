//! Scoped staging directory that becomes a container image.
//!
//! A [`Sandbox`] moves through `Unbuilt -> Active -> Closed`. While Active it
//! owns a temporary directory populated from the base image, the process
//! working directory points into it, and a process-wide lock keeps any other
//! sandbox out. Leaving the Active state (explicitly, on drop, or on Ctrl-C)
//! restores the working directory and removes the staging tree.

mod build_tool;

pub use build_tool::BuildTool;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cmd::{CapturedProcess, Cmd, ConsoleSink, OutputSink};
use crate::dispatch::LogDispatcher;
use crate::error::NotInSandbox;

/// Environment script sourced by the image at container start.
pub const ENV_SCRIPT: &str = ".singularity.d/env/92-sandwright-env.sh";
/// JSON label store of the image.
pub const LABELS_FILE: &str = ".singularity.d/labels.json";

const LABEL_COMMAND: &str = "sandwright.command";
const LABEL_VERSION: &str = "sandwright.version";
const LABEL_URL: &str = "sandwright.url";

/// Held for the whole Active period of a sandbox.
static ACTIVE_LOCK: Mutex<()> = Mutex::new(());
/// Staging directory of the active sandbox, for the interrupt handler.
static ACTIVE_STAGING: Mutex<Option<PathBuf>> = Mutex::new(None);
static INTERRUPT_HANDLER: Once = Once::new();

thread_local! {
    // Same-thread re-entry would deadlock on ACTIVE_LOCK.
    static ENTERED: Cell<bool> = const { Cell::new(false) };
}

struct Active {
    staging: TempDir,
    origin: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

pub struct Sandbox {
    base_image: String,
    tool: BuildTool,
    dispatcher: Option<LogDispatcher>,
    active: Option<Active>,
    closed: bool,
}

impl Sandbox {
    pub fn new(base_image: impl Into<String>, tool: BuildTool) -> Self {
        Self {
            base_image: base_image.into(),
            tool,
            dispatcher: None,
            active: None,
            closed: false,
        }
    }

    /// Route build binary output through `dispatcher` instead of the console.
    pub fn with_log_dispatcher(mut self, dispatcher: LogDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Create the staging directory from the base image and move into it.
    ///
    /// Blocks while a sandbox on another thread is active and fails if one is
    /// active on this thread.
    pub fn enter(&mut self) -> Result<()> {
        if self.closed {
            bail!("Sandbox for {} has already been closed", self.base_image);
        }
        if self.active.is_some() {
            bail!("Sandbox for {} is already active", self.base_image);
        }
        if ENTERED.with(Cell::get) {
            bail!("Another sandbox is already active on this thread");
        }

        let lock = ACTIVE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        install_interrupt_handler();

        let origin = std::env::current_dir().context("Failed to read current directory")?;
        let staging = tempfile::Builder::new()
            .prefix("sandwright-sandbox-")
            .tempdir()
            .context("Failed to create sandbox staging directory")?;
        info!(
            base_image = %self.base_image,
            staging = %staging.path().display(),
            "sandbox:create"
        );

        let create = self.tool.create_sandbox(staging.path(), &self.base_image);
        self.run(&create, self.sink())
            .with_context(|| format!("Failed to build sandbox from {}", self.base_image))?;

        std::env::set_current_dir(staging.path()).with_context(|| {
            format!("Failed to enter sandbox at {}", staging.path().display())
        })?;
        *lock_staging() = Some(staging.path().to_path_buf());
        ENTERED.with(|e| e.set(true));
        self.active = Some(Active {
            staging,
            origin,
            _lock: lock,
        });
        debug!("sandbox:enter");

        if let Err(err) = self.ensure_metadata_files() {
            if let Err(exit_err) = self.exit() {
                warn!(error = %exit_err, "sandbox:teardown after failed enter");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Restore the working directory and delete the staging tree.
    ///
    /// Does nothing if the sandbox is not active, so it is safe to call twice.
    pub fn exit(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        self.closed = true;
        ENTERED.with(|e| e.set(false));
        lock_staging().take();

        let path = active.staging.path().to_path_buf();
        let restored = std::env::set_current_dir(&active.origin);
        let removed = active.staging.close();
        debug!(staging = %path.display(), "sandbox:exit");

        restored.with_context(|| {
            format!(
                "Failed to restore working directory {}",
                active.origin.display()
            )
        })?;
        removed.with_context(|| format!("Failed to remove sandbox at {}", path.display()))?;
        Ok(())
    }

    /// Run `f` inside an active sandbox, tearing it down whatever `f` returns.
    pub fn session<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let result = f(self);
        let exited = self.exit();
        let value = result?;
        exited?;
        Ok(value)
    }

    pub fn staging_dir(&self) -> Result<&Path> {
        Ok(self.require("staging_dir")?.staging.path())
    }

    /// Append `script` as a line to the environment script.
    pub fn add_to_env(&self, script: &str) -> Result<()> {
        let path = self.require("add_to_env")?.staging.path().join(ENV_SCRIPT);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{script}")
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(script, "sandbox:add_to_env");
        Ok(())
    }

    /// Run `command` inside the sandbox, forwarding output to the sandbox's
    /// dispatcher (or the console).
    pub fn run_command<I, S>(&self, command: I) -> Result<CapturedProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run_command_with(command, self.sink())
    }

    /// Run `command` inside the sandbox, forwarding output to `sink`.
    pub fn run_command_with<I, S>(&self, command: I, sink: &dyn OutputSink) -> Result<CapturedProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let staging = self.require("run_command")?.staging.path();
        let cmd = self.tool.exec(staging, command);
        self.run(&cmd, sink)
    }

    /// Record which tool built the image in the label store.
    pub fn add_metadata(&self) -> Result<()> {
        let path = self.require("add_metadata")?.staging.path().join(LABELS_FILE);
        let command = std::env::args().collect::<Vec<_>>().join(" ");
        write_labels(
            &path,
            [
                (LABEL_COMMAND, command.as_str()),
                (LABEL_VERSION, env!("CARGO_PKG_VERSION")),
                (LABEL_URL, env!("CARGO_PKG_REPOSITORY")),
            ],
        )?;
        debug!(path = %path.display(), "sandbox:add_metadata");
        Ok(())
    }

    /// Materialize the staging tree as an image at `image`, replacing any
    /// existing file. Relative paths are taken from the directory the
    /// sandbox was entered from.
    pub fn build_image(&self, image: &Path) -> Result<CapturedProcess> {
        let active = self.require("build_image")?;
        let target = if image.is_absolute() {
            image.to_path_buf()
        } else {
            active.origin.join(image)
        };
        info!(image = %target.display(), "sandbox:build image");
        let cmd = self.tool.build_image(&target, active.staging.path());
        self.run(&cmd, self.sink())
            .with_context(|| format!("Failed to build image {}", target.display()))
    }

    fn require(&self, operation: &'static str) -> Result<&Active> {
        self.active
            .as_ref()
            .ok_or_else(|| anyhow!(NotInSandbox { operation }))
    }

    fn sink(&self) -> &dyn OutputSink {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher as &dyn OutputSink,
            None => &ConsoleSink,
        }
    }

    fn run(&self, cmd: &Cmd, sink: &dyn OutputSink) -> Result<CapturedProcess> {
        debug!(args = ?cmd.argv(), "sandbox:run");
        cmd.run_streaming(sink)
    }

    /// Create the environment script and label store inside the sandbox when
    /// the base image did not provide them.
    fn ensure_metadata_files(&self) -> Result<()> {
        let staging = self.staging_dir()?;
        if staging.join(ENV_SCRIPT).is_file() && staging.join(LABELS_FILE).is_file() {
            return Ok(());
        }
        debug!("sandbox:creating metadata files");
        let script = format!(
            "mkdir -p /.singularity.d/env && touch /{ENV_SCRIPT} && \
             {{ test -f /{LABELS_FILE} || echo '{{}}' > /{LABELS_FILE}; }}"
        );
        self.run_command(["sh", "-c", script.as_str()])
            .context("Failed to create sandbox metadata files")?;
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(err) = self.exit() {
            warn!(error = %err, "sandbox:teardown on drop failed");
        }
    }
}

fn lock_staging() -> MutexGuard<'static, Option<PathBuf>> {
    ACTIVE_STAGING.lock().unwrap_or_else(|e| e.into_inner())
}

/// On Ctrl-C, remove the active staging tree and exit with status 130.
fn install_interrupt_handler() {
    INTERRUPT_HANDLER.call_once(|| {
        let installed = ctrlc::set_handler(|| {
            if let Some(path) = lock_staging().take() {
                let _ = fs::remove_dir_all(&path);
            }
            std::process::exit(130);
        });
        if let Err(err) = installed {
            debug!(error = %err, "sandbox:interrupt handler not installed");
        }
    });
}

/// Merge `labels` into the JSON object at `path`, rewriting it in place.
fn write_labels<'a>(path: &Path, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut store: Map<String, Value> = if content.trim().is_empty() {
        Map::new()
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse labels in {}", path.display()))?
    };
    for (key, value) in labels {
        store.insert(key.to_string(), Value::String(value.to_string()));
    }
    let json = serde_json::to_string_pretty(&store)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
