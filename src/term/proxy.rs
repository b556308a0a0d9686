use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Return to column 0 and erase the line.
pub(crate) const CLEAR_LINE: &str = "\r\x1b[2K";

/// A terminal stream shared by several writers.
///
/// Every writer goes through its own [`ProxyHandle`], so the proxy knows who
/// wrote last and whether the cursor sits at the start of a line. A writer
/// can put down a *transient* line (a spinner frame); the next write from
/// anyone else erases it first, so frames never end up glued to real output.
pub struct StreamWriteProxy {
    state: Mutex<ProxyState>,
    next_id: AtomicUsize,
}

struct ProxyState {
    stream: Box<dyn Write + Send>,
    last_writer: Option<usize>,
    at_line_start: bool,
    transient_owner: Option<usize>,
}

impl StreamWriteProxy {
    pub fn new(stream: impl Write + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProxyState {
                stream: Box::new(stream),
                last_writer: None,
                at_line_start: true,
                transient_owner: None,
            }),
            next_id: AtomicUsize::new(0),
        })
    }

    /// A new writer identity on this stream.
    pub fn handle(self: &Arc<Self>) -> ProxyHandle {
        ProxyHandle {
            proxy: Arc::clone(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One writer's view of a [`StreamWriteProxy`]. Clones share the identity.
#[derive(Clone)]
pub struct ProxyHandle {
    proxy: Arc<StreamWriteProxy>,
    id: usize,
}

impl ProxyHandle {
    /// True when another writer has written since this handle last did.
    pub fn foreign_write_since_last(&self) -> bool {
        let state = self.proxy.lock();
        state.last_writer.is_some_and(|w| w != self.id)
    }

    /// Replace the current line with `frame`, unless another writer left a
    /// partial line behind. Returns whether the frame was drawn.
    pub fn write_transient(&self, frame: &str) -> io::Result<bool> {
        let mut state = self.proxy.lock();
        let owns_line = state.transient_owner == Some(self.id);
        if !owns_line && !state.at_line_start {
            return Ok(false);
        }
        state.stream.write_all(CLEAR_LINE.as_bytes())?;
        state.stream.write_all(frame.as_bytes())?;
        state.stream.flush()?;
        state.last_writer = Some(self.id);
        state.at_line_start = false;
        state.transient_owner = Some(self.id);
        Ok(true)
    }

    /// Erase this handle's transient line, if it is still on screen.
    pub fn clear_transient(&self) -> io::Result<()> {
        let mut state = self.proxy.lock();
        if state.transient_owner == Some(self.id) {
            state.stream.write_all(CLEAR_LINE.as_bytes())?;
            state.stream.flush()?;
            state.transient_owner = None;
            state.at_line_start = true;
            state.last_writer = Some(self.id);
        }
        Ok(())
    }

    /// Record that the cursor moved to a new line outside this proxy, such
    /// as the terminal echoing a typed newline.
    pub fn assume_line_start(&self) {
        let mut state = self.proxy.lock();
        state.at_line_start = true;
        state.transient_owner = None;
    }

    /// Write `text` as a permanent line. It replaces this handle's transient
    /// line, or starts on a fresh line if someone else left a partial one.
    pub fn finish_line(&self, text: &str) -> io::Result<()> {
        let mut state = self.proxy.lock();
        let prefix = if state.transient_owner == Some(self.id) || state.at_line_start {
            CLEAR_LINE
        } else {
            "\n"
        };
        state.stream.write_all(prefix.as_bytes())?;
        state.stream.write_all(text.as_bytes())?;
        state.stream.write_all(b"\n")?;
        state.stream.flush()?;
        state.transient_owner = None;
        state.at_line_start = true;
        state.last_writer = Some(self.id);
        Ok(())
    }
}

impl Write for ProxyHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.proxy.lock();
        match state.transient_owner {
            Some(owner) if owner != self.id => {
                state.stream.write_all(CLEAR_LINE.as_bytes())?;
                state.at_line_start = true;
            }
            _ => {}
        }
        state.transient_owner = None;
        state.stream.write_all(buf)?;
        state.last_writer = Some(self.id);
        if let Some(&last) = buf.last() {
            state.at_line_start = last == b'\n';
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.proxy.lock().stream.flush()
    }
}
