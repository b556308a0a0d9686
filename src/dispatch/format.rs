//! Line rendering for dispatcher sinks.

use console::{Color, Style};
use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use super::Severity;

/// Wrap `text` in the severity's foreground color and a reset code.
///
/// INFO has no color and comes back unchanged.
pub fn colorize(severity: Severity, text: &str) -> String {
    let style = match severity {
        Severity::Debug => Style::new().fg(Color::Color256(8)),
        Severity::Info => return text.to_string(),
        Severity::Warning => Style::new().yellow(),
        Severity::Error => Style::new().red(),
        Severity::Critical => Style::new().red().bold(),
    };
    style.force_styling(true).apply_to(text).to_string()
}

/// `{name}:-: {message}` for INFO, `{name}:-:{LEVEL}: {message}` otherwise.
/// Only the message part is colored; without color, escape codes the child
/// printed are removed as well.
pub fn render_line(name: &str, severity: Severity, message: &str, color: bool) -> String {
    let message = if color {
        colorize(severity, message)
    } else {
        strip_ansi_escapes::strip_str(message)
    };
    match severity {
        Severity::Info => format!("{name}:-: {message}"),
        other => format!("{name}:-:{}: {message}", other.label()),
    }
}

/// `tracing` event formatter producing dispatcher lines.
pub(crate) struct ChannelFormat {
    name: String,
    color: bool,
}

impl ChannelFormat {
    pub(crate) fn new(name: &str, color: bool) -> Self {
        Self {
            name: name.to_string(),
            color,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ChannelFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let severity = fields
            .severity
            .unwrap_or_else(|| Severity::from_level(*event.metadata().level()));
        writeln!(
            writer,
            "{}",
            render_line(&self.name, severity, &fields.message, self.color)
        )
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    severity: Option<Severity>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "severity" => self.severity = Severity::from_label(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}
