use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use super::proxy::{ProxyHandle, StreamWriteProxy};
use super::spinner::MessageSpinner;
use crate::dispatch::ConsoleWriters;

/// Turns stdout into a single animated status line for the duration of a
/// long operation.
///
/// Every complete line written through [`ConsoleSpinner::stdout`] becomes
/// the new spinner message; the previous one is left on screen as a plain
/// line. Lines written through [`ConsoleSpinner::stderr`] interrupt the
/// animation, print, and the current message resumes spinning below them.
/// When stdout is not a terminal, lines pass through unchanged.
pub struct ConsoleSpinner {
    shared: Arc<ConsoleShared>,
}

struct ConsoleShared {
    stdout: Arc<StreamWriteProxy>,
    animate: bool,
    width: Option<usize>,
    state: Mutex<ConsoleState>,
}

struct ConsoleState {
    out: ProxyHandle,
    err: ProxyHandle,
    input: Box<dyn BufRead + Send>,
    spinner: Option<MessageSpinner>,
    message: Option<String>,
    pending_out: Vec<u8>,
    pending_err: Vec<u8>,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

impl ConsoleSpinner {
    pub fn new() -> Self {
        let term = console::Term::stdout();
        let width = term.size_checked().map(|(_, cols)| usize::from(cols));
        Self::with_streams(
            io::stdout(),
            io::stderr(),
            BufReader::new(io::stdin()),
            term.is_term(),
            width,
        )
    }

    pub fn with_streams(
        stdout: impl Write + Send + 'static,
        stderr: impl Write + Send + 'static,
        input: impl BufRead + Send + 'static,
        animate: bool,
        width: Option<usize>,
    ) -> Self {
        let stdout = StreamWriteProxy::new(stdout);
        let stderr = StreamWriteProxy::new(stderr);
        let state = ConsoleState {
            out: stdout.handle(),
            err: stderr.handle(),
            input: Box::new(input),
            spinner: None,
            message: None,
            pending_out: Vec::new(),
            pending_err: Vec::new(),
            closed: false,
        };
        Self {
            shared: Arc::new(ConsoleShared {
                stdout,
                animate,
                width,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn stdout(&self) -> ConsoleStream {
        ConsoleStream {
            shared: Arc::clone(&self.shared),
            stream: Stream::Out,
        }
    }

    pub fn stderr(&self) -> ConsoleStream {
        ConsoleStream {
            shared: Arc::clone(&self.shared),
            stream: Stream::Err,
        }
    }

    /// Console writers for a [`crate::dispatch::LogDispatcher`].
    pub fn writers(&self) -> ConsoleWriters {
        ConsoleWriters {
            primary: BoxMakeWriter::new(self.stdout()),
            diagnostic: BoxMakeWriter::new(self.stderr()),
        }
    }

    /// Finalize the current message, show `prompt` and read one line of
    /// input. Spinning resumes with the next message set afterwards.
    ///
    /// The trailing newline is removed. End of input yields an empty string.
    pub fn read_input(&self, prompt: &str) -> Result<String> {
        let mut state = self.shared.lock();
        if let Some(mut spinner) = state.spinner.take() {
            spinner.stop()?;
        }
        state.message = None;
        state.out.write_all(prompt.as_bytes())?;
        state.out.flush()?;

        let mut line = String::new();
        state
            .input
            .read_line(&mut line)
            .context("Failed to read from standard input")?;
        // The typed newline is echoed by the terminal, not by us.
        if line.ends_with('\n') {
            state.out.assume_line_start();
        } else {
            state.out.write_all(b"\n")?;
        }
        tracing::debug!(prompt, "console:read input");
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Stop the animation, leaving the last message on screen, and flush
    /// any partial lines.
    pub fn finish(self) {}
}

impl Default for ConsoleSpinner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConsoleSpinner {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.close();
    }
}

impl ConsoleShared {
    fn lock(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConsoleState {
    fn on_stdout_line(&mut self, shared: &ConsoleShared, line: &str) -> io::Result<()> {
        let message = line.trim_end_matches(['\r', '\n']);
        if self.closed || !shared.animate {
            return writeln!(self.out, "{message}");
        }
        if message.trim().is_empty() {
            return Ok(());
        }
        self.message = Some(message.to_string());
        if let Some(mut previous) = self.spinner.take() {
            previous.stop()?;
        }
        self.spin(shared, message);
        Ok(())
    }

    fn on_stderr_line(&mut self, shared: &ConsoleShared, line: &str) -> io::Result<()> {
        let paused = match self.spinner.take() {
            Some(mut spinner) => {
                spinner.clear()?;
                true
            }
            None => false,
        };
        writeln!(self.err, "{}", line.trim_end_matches(['\r', '\n']))?;
        if paused && let Some(message) = self.message.clone() {
            self.spin(shared, &message);
        }
        Ok(())
    }

    fn spin(&mut self, shared: &ConsoleShared, message: &str) {
        let mut spinner =
            MessageSpinner::new(message, shared.stdout.handle()).with_width(shared.width);
        spinner.start();
        self.spinner = Some(spinner);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut spinner) = self.spinner.take() {
            let _ = spinner.stop();
        }
        let out = std::mem::take(&mut self.pending_out);
        let err = std::mem::take(&mut self.pending_err);
        let _ = self.out.write_all(&out);
        let _ = self.out.flush();
        let _ = self.err.write_all(&err);
        let _ = self.err.flush();
    }
}

/// Line-buffered writer feeding one side of a [`ConsoleSpinner`].
#[derive(Clone)]
pub struct ConsoleStream {
    shared: Arc<ConsoleShared>,
    stream: Stream,
}

impl Write for ConsoleStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.closed {
            match self.stream {
                Stream::Out => state.out.write_all(buf)?,
                Stream::Err => state.err.write_all(buf)?,
            }
            return Ok(buf.len());
        }

        let pending = match self.stream {
            Stream::Out => &mut state.pending_out,
            Stream::Err => &mut state.pending_err,
        };
        pending.extend_from_slice(buf);
        let mut lines = Vec::new();
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        for line in lines {
            match self.stream {
                Stream::Out => state.on_stdout_line(&self.shared, &line)?,
                Stream::Err => state.on_stderr_line(&self.shared, &line)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ConsoleStream {
    type Writer = ConsoleStream;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::Captured;
    use crate::term::proxy::CLEAR_LINE;
    use std::io::Cursor;

    fn console(animate: bool, input: &str) -> (ConsoleSpinner, Captured, Captured) {
        let out = Captured::default();
        let err = Captured::default();
        let console = ConsoleSpinner::with_streams(
            out.clone(),
            err.clone(),
            Cursor::new(input.to_string()),
            animate,
            None,
        );
        (console, out, err)
    }

    #[test]
    fn passes_lines_through_without_terminal() {
        let (console, out, err) = console(false, "");
        let mut stdout = console.stdout();
        let mut stderr = console.stderr();
        stdout.write_all(b"one\ntw").unwrap();
        stdout.write_all(b"o\n").unwrap();
        stderr.write_all(b"oops\n").unwrap();
        drop(console);
        assert_eq!(out.text(), "one\ntwo\n");
        assert_eq!(err.text(), "oops\n");
    }

    #[test]
    fn each_stdout_line_replaces_the_message() {
        let (console, out, _err) = console(true, "");
        let mut stdout = console.stdout();
        stdout.write_all(b"first\n").unwrap();
        stdout.write_all(b"second\n").unwrap();
        console.finish();

        let text = out.text();
        assert!(text.contains(&format!("{CLEAR_LINE}first\n")));
        assert!(text.ends_with(&format!("{CLEAR_LINE}second\n")));
        let first = text.find("first\n").unwrap();
        let second = text.find("second\n").unwrap();
        assert!(first < second);
    }

    #[test]
    fn stderr_interrupts_without_finalizing_message() {
        let (console, out, err) = console(true, "");
        let mut stdout = console.stdout();
        let mut stderr = console.stderr();
        stdout.write_all(b"working\n").unwrap();
        stderr.write_all(b"warning: disk\n").unwrap();
        drop(console);

        assert_eq!(err.text(), "warning: disk\n");
        let text = out.text();
        assert_eq!(text.matches("working\n").count(), 1);
        assert!(text.ends_with(&format!("{CLEAR_LINE}working\n")));
    }

    #[test]
    fn partial_lines_flushed_on_drop() {
        let (console, out, err) = console(false, "");
        console.stdout().write_all(b"no newline").unwrap();
        console.stderr().write_all(b"half").unwrap();
        assert_eq!(out.text(), "");
        drop(console);
        assert_eq!(out.text(), "no newline");
        assert_eq!(err.text(), "half");
    }

    #[test]
    fn read_input_shows_prompt_and_trims_newline() {
        let (console, out, _err) = console(false, "yes\n");
        let answer = console.read_input("Accept? ").unwrap();
        assert_eq!(answer, "yes");
        assert_eq!(out.text(), "Accept? ");
    }

    #[test]
    fn read_input_at_eof_is_empty() {
        let (console, out, _err) = console(false, "");
        assert_eq!(console.read_input("Continue? ").unwrap(), "");
        assert_eq!(out.text(), "Continue? \n");
    }

    #[test]
    fn read_input_finalizes_message_before_prompt() {
        let (console, out, _err) = console(true, "no\n");
        let mut stdout = console.stdout();
        stdout.write_all(b"installing\n").unwrap();
        let answer = console.read_input("Proceed? ").unwrap();
        stdout.write_all(b"next\n").unwrap();
        drop(console);

        assert_eq!(answer, "no");
        let text = out.text();
        assert!(text.contains(&format!("{CLEAR_LINE}installing\nProceed? ")));
        assert_eq!(text.matches("installing\n").count(), 1);
        assert!(text.ends_with(&format!("{CLEAR_LINE}next\n")));
    }

    #[test]
    fn serves_as_dispatcher_console() {
        use crate::dispatch::{Classifier, LogDispatcher, LogSettings};

        let (console, out, err) = console(false, "");
        let settings = LogSettings::new(0, None, true);
        let dispatcher =
            LogDispatcher::new("sandbox", &settings, Classifier::build_tool(), console.writers())
                .unwrap();
        dispatcher.dispatch_primary("INFO    Starting build...");
        dispatcher.dispatch_diagnostic("WARNING no cache");
        drop(dispatcher);
        drop(console);

        assert_eq!(out.text(), "sandbox:-: INFO    Starting build...\n");
        assert_eq!(err.text(), "sandbox:-:WARNING: WARNING no cache\n");
    }

    /// A stdout that rejects every write.
    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn spinner_write_failures_reach_the_writer() {
        let console = ConsoleSpinner::with_streams(
            Broken,
            Captured::default(),
            Cursor::new(String::new()),
            true,
            None,
        );
        let mut stdout = console.stdout();
        stdout.write_all(b"first\n").unwrap();
        let err = stdout.write_all(b"second\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn verbose_dispatch_survives_broken_console() {
        use crate::dispatch::{Classifier, LogDispatcher, LogSettings};

        let console = ConsoleSpinner::with_streams(
            Broken,
            Captured::default(),
            Cursor::new(String::new()),
            true,
            None,
        );
        let settings = LogSettings::new(2, None, true);
        let dispatcher =
            LogDispatcher::new("conda", &settings, Classifier::conda(), console.writers()).unwrap();
        dispatcher.dispatch_primary("Collecting package metadata");
        dispatcher.dispatch_primary("Solving environment: done");
        dispatcher.dispatch_diagnostic("warning  libmamba cache miss");
        drop(dispatcher);
        drop(console);
    }
}
