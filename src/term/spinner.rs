use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

use super::proxy::ProxyHandle;
use super::strip_non_color_escapes;

const GLYPHS: [&str; 8] = ["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Animates `{glyph} {message}...` on the current terminal line until
/// stopped, then leaves the full message behind as a normal line.
pub struct MessageSpinner {
    shared: Arc<Mutex<SpinnerState>>,
    thread: Option<JoinHandle<()>>,
    stop_tx: Option<mpsc::Sender<()>>,
    started: bool,
    finished: bool,
}

struct SpinnerState {
    message: String,
    out: ProxyHandle,
    width: Option<usize>,
    frame: usize,
}

impl MessageSpinner {
    pub fn new(message: &str, out: ProxyHandle) -> Self {
        let width = console::Term::stdout()
            .size_checked()
            .map(|(_, cols)| usize::from(cols));
        Self {
            shared: Arc::new(Mutex::new(SpinnerState {
                message: message.to_string(),
                out,
                width,
                frame: 0,
            })),
            thread: None,
            stop_tx: None,
            started: false,
            finished: false,
        }
    }

    /// Override the terminal width used for truncation. `None` disables it.
    pub fn with_width(self, width: Option<usize>) -> Self {
        lock(&self.shared).width = width;
        self
    }

    pub fn start(&mut self) {
        if self.started || self.finished {
            return;
        }
        self.started = true;

        let (tx, rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        self.stop_tx = Some(tx);
        self.thread = Some(std::thread::spawn(move || {
            loop {
                tick(&shared);
                match rx.recv_timeout(FRAME_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
        }));
    }

    /// Swap the message shown by the animation. Never interleaves with a frame.
    pub fn update_message(&self, message: &str) {
        lock(&self.shared).message = message.to_string();
    }

    /// Stop animating and print the complete message on its own line.
    ///
    /// Safe to call before `start` or more than once; only the first call
    /// after `start` prints anything.
    pub fn stop(&mut self) -> io::Result<()> {
        if !self.halt() {
            return Ok(());
        }
        let state = lock(&self.shared);
        let text = strip_non_color_escapes(&state.message);
        state.out.finish_line(&text)
    }

    /// Stop animating and erase the spinner line without printing the message.
    pub fn clear(&mut self) -> io::Result<()> {
        if !self.halt() {
            return Ok(());
        }
        lock(&self.shared).out.clear_transient()
    }

    /// Join the animation thread. Returns false if there was nothing to stop.
    fn halt(&mut self) -> bool {
        if !self.started || self.finished {
            return false;
        }
        self.finished = true;
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        true
    }
}

impl Drop for MessageSpinner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn lock(shared: &Mutex<SpinnerState>) -> MutexGuard<'_, SpinnerState> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

fn tick(shared: &Mutex<SpinnerState>) {
    let mut state = lock(shared);
    if state.out.foreign_write_since_last() {
        trace!("spinner:foreign write detected");
    }
    let glyph = GLYPHS[state.frame % GLYPHS.len()];
    let line = render_frame(glyph, &state.message, state.width);
    match state.out.write_transient(&line) {
        Ok(true) => state.frame += 1,
        Ok(false) => trace!("spinner:deferring to foreign partial line"),
        Err(err) => trace!(error = %err, "spinner:frame write failed"),
    }
}

/// One animation frame: escapes other than color stripped, newlines
/// collapsed, truncated with an ellipsis to fit `width`.
fn render_frame(glyph: &str, message: &str, width: Option<usize>) -> String {
    let cleaned = strip_non_color_escapes(message);
    let single_line = cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let line = format!("{glyph} {single_line}...");
    match width {
        Some(width) if console::measure_text_width(&line) > width => {
            console::truncate_str(&line, width, "…").into_owned()
        }
        _ => line,
    }
}
