//! Child process execution with live, line-by-line forwarding of both output
//! streams.
//!
//! Lines within one stream reach the sink in the order the child wrote them.
//! Nothing is guaranteed about the interleaving of stdout and stderr lines:
//! each stream is drained on its own thread and forwarded as soon as a line
//! is complete.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, trace};

use crate::error::ProcessFailed;

/// Receives output lines from a running child process.
///
/// Lines keep their original terminator; the final line of a stream may lack
/// one. Both methods may be called concurrently from different threads.
pub trait OutputSink: Sync {
    fn primary(&self, line: &str);
    fn diagnostic(&self, line: &str);
}

/// Forwards child output straight to this process's stdout/stderr.
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn primary(&self, line: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }

    fn diagnostic(&self, line: &str) {
        let mut err = io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// The result of a child process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedProcess {
    pub args: Vec<String>,
    pub exit_code: i32,
    pub primary_text: String,
    pub diagnostic_text: String,
}

/// A builder for executing commands with streamed, captured output
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    workdir: Option<PathBuf>,
    env: Option<BTreeMap<OsString, OsString>>,
}

impl Cmd {
    /// Create a new command builder
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            workdir: None,
            env: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set the working directory for the command
    pub fn current_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.workdir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Replace the child's entire environment with `vars`
    pub fn env_override<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string()))
                .collect(),
        );
        self
    }

    /// The full argument vector, program first, for display and error reports.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Run the command to completion, forwarding each line to `sink` as soon
    /// as it is read and accumulating both streams.
    ///
    /// Returns `ProcessFailed` (inside the `anyhow::Error`) when the child
    /// exits nonzero. Read errors on either pipe are propagated.
    pub fn run_streaming(&self, sink: &dyn OutputSink) -> Result<CapturedProcess> {
        let argv = self.argv();
        trace!(args = ?argv, workdir = ?self.workdir, "cmd:stream start");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        if let Some(env) = &self.env {
            cmd.env_clear().envs(env);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", argv.join(" ")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Child stderr was not captured"))?;

        let (primary, diagnostic) = std::thread::scope(|s| {
            let out = s.spawn(|| drain_lines(stdout, |line| sink.primary(line)));
            let err = s.spawn(|| drain_lines(stderr, |line| sink.diagnostic(line)));
            (join_drain(out), join_drain(err))
        });

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for command: {}", argv.join(" ")))?;
        let primary_text = primary.context("Failed to read command stdout")?;
        let diagnostic_text = diagnostic.context("Failed to read command stderr")?;
        let exit_code = status.code().unwrap_or(-1);

        if !status.success() {
            debug!(args = ?argv, exit_code, "cmd:stream failure");
            return Err(ProcessFailed {
                args: argv,
                exit_code,
                primary_text,
                diagnostic_text,
            }
            .into());
        }

        trace!(exit_code, "cmd:stream success");
        Ok(CapturedProcess {
            args: argv,
            exit_code,
            primary_text,
            diagnostic_text,
        })
    }
}

/// Read `reader` to end-of-stream, handing each line (terminator included)
/// to `forward` before appending it to the returned text.
fn drain_lines<R: Read>(reader: R, mut forward: impl FnMut(&str)) -> io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        forward(&line);
        text.push_str(&line);
    }
    Ok(text)
}

fn join_drain(handle: std::thread::ScopedJoinHandle<'_, io::Result<String>>) -> io::Result<String> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader thread panicked")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        primary: Mutex<Vec<String>>,
        diagnostic: Mutex<Vec<String>>,
    }

    impl OutputSink for Recorder {
        fn primary(&self, line: &str) {
            self.primary.lock().unwrap().push(line.to_string());
        }

        fn diagnostic(&self, line: &str) {
            self.diagnostic.lock().unwrap().push(line.to_string());
        }
    }

    fn sh(script: &str) -> Cmd {
        Cmd::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn captures_both_streams_with_line_endings() {
        let sink = Recorder::default();
        let result = sh("printf 'one\\ntwo\\n'; printf 'warn\\r\\n' >&2; printf 'tail'")
            .run_streaming(&sink)
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.primary_text, "one\ntwo\ntail");
        assert_eq!(result.diagnostic_text, "warn\r\n");
        assert_eq!(
            *sink.primary.lock().unwrap(),
            vec!["one\n", "two\n", "tail"]
        );
        assert_eq!(*sink.diagnostic.lock().unwrap(), vec!["warn\r\n"]);
    }

    #[test]
    fn forwarded_lines_concatenate_to_captured_text() {
        let sink = Recorder::default();
        let result = sh("for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done")
            .run_streaming(&sink)
            .unwrap();

        assert_eq!(sink.primary.lock().unwrap().concat(), result.primary_text);
        assert_eq!(
            sink.diagnostic.lock().unwrap().concat(),
            result.diagnostic_text
        );
        assert_eq!(result.primary_text, "out1\nout2\nout3\nout4\nout5\n");
    }

    #[test]
    fn large_stderr_before_stdout_does_not_block() {
        let sink = Recorder::default();
        let result = sh("head -c 300000 /dev/zero | tr '\\0' e >&2; echo done")
            .run_streaming(&sink)
            .unwrap();

        assert_eq!(result.primary_text, "done\n");
        assert_eq!(result.diagnostic_text.len(), 300000);
        assert!(result.diagnostic_text.bytes().all(|b| b == b'e'));
        assert_eq!(sink.diagnostic.lock().unwrap().concat().len(), 300000);
    }

    #[test]
    fn nonzero_exit_carries_captured_output() {
        let sink = Recorder::default();
        let err = sh("echo partial; echo broken >&2; exit 7")
            .run_streaming(&sink)
            .unwrap_err();

        let failed = err.downcast_ref::<ProcessFailed>().expect("ProcessFailed");
        assert_eq!(failed.exit_code, 7);
        assert_eq!(failed.primary_text, "partial\n");
        assert_eq!(failed.diagnostic_text, "broken\n");
        assert_eq!(failed.args, vec!["sh", "-c", "echo partial; echo broken >&2; exit 7"]);
    }

    #[test]
    fn honours_workdir_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Recorder::default();
        let result = sh("pwd; echo \"$ONLY_VAR:${HOME:-unset}\"")
            .current_dir(dir.path())
            .env_override([("ONLY_VAR", "set"), ("PATH", "/usr/bin:/bin")])
            .run_streaming(&sink)
            .unwrap();

        let mut lines = result.primary_text.lines();
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(lines.next(), Some("set:unset"));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = Cmd::new("/nonexistent/sandwright-binary")
            .run_streaming(&ConsoleSink)
            .unwrap_err();
        assert!(err.to_string().contains("Failed to execute command"));
    }
}
