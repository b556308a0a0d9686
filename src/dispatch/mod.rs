//! Severity classification and routing of streamed subprocess text.
//!
//! A [`LogDispatcher`] owns two channels, primary and diagnostic. Each channel
//! is an independent `tracing` dispatch with a console layer gated by the
//! verbosity threshold and, when a log file is configured, a file layer that
//! records everything.

mod filters;
mod format;

pub use filters::{LineFilter, all_of, cursor_escapes, progress_bars};
pub use format::{colorize, render_line};

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{Dispatch, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

use crate::cmd::OutputSink;
use format::ChannelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    fn from_level(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warning,
            Level::ERROR => Self::Error,
        }
    }
}

/// Ordered prefix rules mapping a line to a severity. First match wins;
/// matching is case-sensitive and lines matching nothing are INFO.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<(String, Severity)>,
}

impl Classifier {
    pub fn new<I, P>(rules: I) -> Self
    where
        I: IntoIterator<Item = (P, Severity)>,
        P: Into<String>,
    {
        Self {
            rules: rules.into_iter().map(|(p, s)| (p.into(), s)).collect(),
        }
    }

    pub fn classify(&self, text: &str) -> Severity {
        self.rules
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix.as_str()))
            .map_or(Severity::Info, |(_, severity)| *severity)
    }

    /// Rules for the sandbox build binary's `LEVEL:   message` output.
    pub fn build_tool() -> Self {
        Self::new([
            ("DEBUG", Severity::Debug),
            ("VERBOSE", Severity::Debug),
            ("INFO", Severity::Info),
            ("WARNING", Severity::Warning),
            ("ERROR", Severity::Error),
            ("FATAL", Severity::Critical),
        ])
    }

    /// Rules for conda/mamba output, which mixes upper- and lowercase
    /// level words.
    pub fn conda() -> Self {
        Self::new([
            ("DEBUG", Severity::Debug),
            ("TRACE", Severity::Debug),
            ("INFO", Severity::Info),
            ("WARNING", Severity::Warning),
            ("warning", Severity::Warning),
            ("ERROR", Severity::Error),
            ("error", Severity::Error),
            ("CRITICAL", Severity::Critical),
            ("critical", Severity::Critical),
        ])
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Vec::<(String, Severity)>::new())
    }
}

/// Console/file logging options shared by every dispatcher of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    verbosity: i8,
    log_file_path: Option<PathBuf>,
    no_color: bool,
}

impl LogSettings {
    pub fn new(verbosity: i8, log_file_path: Option<PathBuf>, no_color: bool) -> Self {
        Self {
            verbosity,
            log_file_path,
            no_color,
        }
    }

    pub fn verbosity(&self) -> i8 {
        self.verbosity
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file_path.as_deref()
    }

    pub fn no_color(&self) -> bool {
        self.no_color
    }

    /// Minimum level shown on the console. Higher verbosity lets more through.
    pub fn console_threshold(&self) -> LevelFilter {
        match self.verbosity {
            i8::MIN..=-2 => LevelFilter::ERROR,
            -1 => LevelFilter::WARN,
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Console destinations for the two channels.
pub struct ConsoleWriters {
    pub primary: BoxMakeWriter,
    pub diagnostic: BoxMakeWriter,
}

impl ConsoleWriters {
    pub fn stdio() -> Self {
        Self {
            primary: BoxMakeWriter::new(std::io::stdout),
            diagnostic: BoxMakeWriter::new(std::io::stderr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Primary,
    Diagnostic,
}

/// Routes subprocess text to the console and, optionally, log files.
pub struct LogDispatcher {
    classifier: Classifier,
    filters: Vec<LineFilter>,
    primary: Dispatch,
    diagnostic: Dispatch,
    // Dropping these flushes the file writers.
    _file_guards: Vec<WorkerGuard>,
}

impl LogDispatcher {
    pub fn new(
        name: &str,
        settings: &LogSettings,
        classifier: Classifier,
        console: ConsoleWriters,
    ) -> Result<Self> {
        let mut guards = Vec::new();
        let primary = channel_dispatch(
            name,
            settings,
            console.primary,
            file_sink_path(settings, "out"),
            &mut guards,
        )?;
        let diagnostic = channel_dispatch(
            name,
            settings,
            console.diagnostic,
            file_sink_path(settings, "err"),
            &mut guards,
        )?;
        tracing::debug!(
            name,
            verbosity = settings.verbosity(),
            log_file = ?settings.log_file_path(),
            "dispatch:created"
        );
        Ok(Self {
            classifier,
            filters: Vec::new(),
            primary,
            diagnostic,
            _file_guards: guards,
        })
    }

    /// Add a line filter. With any filter installed, blank primary lines are
    /// suppressed as well.
    pub fn with_filter(mut self, filter: LineFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn dispatch_primary(&self, text: &str) {
        self.dispatch(Channel::Primary, text);
    }

    pub fn dispatch_diagnostic(&self, text: &str) {
        self.dispatch(Channel::Diagnostic, text);
    }

    fn dispatch(&self, channel: Channel, raw: &str) {
        if !self.filters.iter().all(|keep| keep(raw)) {
            return;
        }
        let text = raw.trim();
        if text.is_empty() && channel == Channel::Primary && !self.filters.is_empty() {
            return;
        }
        let severity = self.classifier.classify(text);
        let dispatch = match channel {
            Channel::Primary => &self.primary,
            Channel::Diagnostic => &self.diagnostic,
        };
        emit(dispatch, severity, text);
    }
}

impl OutputSink for LogDispatcher {
    fn primary(&self, line: &str) {
        self.dispatch_primary(line);
    }

    fn diagnostic(&self, line: &str) {
        self.dispatch_diagnostic(line);
    }
}

fn emit(dispatch: &Dispatch, severity: Severity, text: &str) {
    let label = severity.label();
    tracing::dispatcher::with_default(dispatch, || match severity {
        Severity::Debug => tracing::debug!(severity = label, "{text}"),
        Severity::Info => tracing::info!(severity = label, "{text}"),
        Severity::Warning => tracing::warn!(severity = label, "{text}"),
        Severity::Error | Severity::Critical => tracing::error!(severity = label, "{text}"),
    });
}

/// `<log file>.out` / `<log file>.err`, when file logging is on.
fn file_sink_path(settings: &LogSettings, suffix: &str) -> Option<PathBuf> {
    settings.log_file_path().map(|path| {
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    })
}

fn channel_dispatch(
    name: &str,
    settings: &LogSettings,
    console: BoxMakeWriter,
    file: Option<PathBuf>,
    guards: &mut Vec<WorkerGuard>,
) -> Result<Dispatch> {
    let console_layer = fmt::layer()
        .event_format(ChannelFormat::new(name, !settings.no_color()))
        .with_writer(console)
        .with_filter(settings.console_threshold());

    let file_layer = match file {
        Some(path) => {
            let (directory, file_name) = split_path(&path)?;
            fs::create_dir_all(&directory).with_context(|| {
                format!("Failed to create log directory at {}", directory.display())
            })?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(&directory)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                fmt::layer()
                    .event_format(ChannelFormat::new(name, false))
                    .with_writer(writer)
                    .with_filter(LevelFilter::TRACE),
            )
        }
        None => None,
    };

    Ok(Dispatch::new(
        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer),
    ))
}

fn split_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name: {}", path.display()))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// In-memory console writer for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        pub(crate) fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        pub(crate) fn make_writer(&self) -> BoxMakeWriter {
            let this = self.clone();
            BoxMakeWriter::new(move || this.clone())
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn dispatcher(
        settings: &LogSettings,
        classifier: Classifier,
    ) -> (LogDispatcher, Captured, Captured) {
        let out = Captured::default();
        let err = Captured::default();
        let console = ConsoleWriters {
            primary: out.make_writer(),
            diagnostic: err.make_writer(),
        };
        let dispatcher = LogDispatcher::new("test", settings, classifier, console).unwrap();
        (dispatcher, out, err)
    }

    fn plain(verbosity: i8) -> LogSettings {
        LogSettings::new(verbosity, None, true)
    }

    #[test]
    fn classifier_prefixes_map_exactly() {
        let classifier = Classifier::build_tool();
        assert_eq!(classifier.classify("DEBUG   x"), Severity::Debug);
        assert_eq!(classifier.classify("VERBOSE x"), Severity::Debug);
        assert_eq!(classifier.classify("INFO    x"), Severity::Info);
        assert_eq!(classifier.classify("WARNING x"), Severity::Warning);
        assert_eq!(classifier.classify("ERROR   x"), Severity::Error);
        assert_eq!(classifier.classify("FATAL   x"), Severity::Critical);
        assert_eq!(classifier.classify("Copying blob"), Severity::Info);
        assert_eq!(classifier.classify("warning lowercase"), Severity::Info);
    }

    #[test]
    fn first_matching_rule_wins() {
        let classifier = Classifier::new([("WARN", Severity::Error), ("WARNING", Severity::Debug)]);
        assert_eq!(classifier.classify("WARNING: x"), Severity::Error);
    }

    #[test]
    fn threshold_is_monotonic() {
        let levels: Vec<LevelFilter> = (-3..=3)
            .map(|v| LogSettings::new(v, None, false).console_threshold())
            .collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(plain(0).console_threshold(), LevelFilter::INFO);
    }

    #[test]
    fn routes_each_severity_with_label() {
        let (dispatcher, out, err) = dispatcher(&plain(2), Classifier::build_tool());
        dispatcher.dispatch_primary("  INFO    building\n");
        dispatcher.dispatch_primary("WARNING careful");
        dispatcher.dispatch_diagnostic("FATAL   boom\n");
        dispatcher.dispatch_diagnostic("DEBUG   detail");

        assert_eq!(
            out.text(),
            "test:-: INFO    building\ntest:-:WARNING: WARNING careful\n"
        );
        assert_eq!(
            err.text(),
            "test:-:CRITICAL: FATAL   boom\ntest:-:DEBUG: DEBUG   detail\n"
        );
    }

    #[test]
    fn verbosity_hides_low_severities() {
        let (dispatcher, out, _err) = dispatcher(&plain(-1), Classifier::build_tool());
        dispatcher.dispatch_primary("INFO hidden");
        dispatcher.dispatch_primary("WARNING shown");
        assert_eq!(out.text(), "test:-:WARNING: WARNING shown\n");
    }

    #[test]
    fn colored_output_wraps_message_only() {
        let settings = LogSettings::new(0, None, false);
        let (dispatcher, out, _err) = dispatcher(&settings, Classifier::build_tool());
        dispatcher.dispatch_primary("ERROR bad");
        assert_eq!(out.text(), "test:-:ERROR: \x1b[31mERROR bad\x1b[0m\n");
    }

    #[test]
    fn blank_primary_lines_suppressed_only_with_filters() {
        let (unfiltered, out, _) = dispatcher(&plain(0), Classifier::default());
        unfiltered.dispatch_primary("   \n");
        assert_eq!(out.text(), "test:-: \n");

        let (filtered, out, err) = dispatcher(&plain(0), Classifier::default());
        let filtered = filtered.with_filter(progress_bars());
        filtered.dispatch_primary("\n");
        filtered.dispatch_primary("pkg | 2 MB | ### | 30%");
        filtered.dispatch_primary("pkg | 2 MB | ### | 100%");
        filtered.dispatch_diagnostic("\n");
        assert_eq!(out.text(), "test:-: pkg | 2 MB | ### | 100%\n");
        assert_eq!(err.text(), "test:-: \n");
    }

    #[test]
    fn file_sink_records_below_console_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("build.log");
        let settings = LogSettings::new(-2, Some(log.clone()), false);
        let (dispatcher, out, _err) = dispatcher(&settings, Classifier::build_tool());
        dispatcher.dispatch_primary("DEBUG quiet detail");
        dispatcher.dispatch_diagnostic("ERROR loud");
        drop(dispatcher);

        assert_eq!(out.text(), "");
        let primary = fs::read_to_string(dir.path().join("logs/build.log.out")).unwrap();
        let diagnostic = fs::read_to_string(dir.path().join("logs/build.log.err")).unwrap();
        assert_eq!(primary, "test:-:DEBUG: DEBUG quiet detail\n");
        assert_eq!(diagnostic, "test:-:ERROR: ERROR loud\n");
    }

    #[test]
    fn usable_as_output_sink() {
        let (dispatcher, out, err) = dispatcher(&plain(0), Classifier::build_tool());
        crate::cmd::Cmd::new("sh")
            .arg("-c")
            .arg("echo 'INFO    hi'; echo 'WARNING meh' >&2")
            .run_streaming(&dispatcher)
            .unwrap();
        assert_eq!(out.text(), "test:-: INFO    hi\n");
        assert_eq!(err.text(), "test:-:WARNING: WARNING meh\n");
    }
}
