// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output sink plumbing: shared writers, capture buffers, log adapters, and
//! teardown closers.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::Level;

// ---------------------------------------------------------------------------
// ByteSink
// ---------------------------------------------------------------------------

/// Cloneable handle to a shared writable byte stream.
///
/// Child stdout/stderr pump tasks write through the handle; every clone
/// refers to the same underlying writer.
#[derive(Clone)]
pub struct ByteSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ByteSink {
    /// Wrap a writer in a shared sink handle.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write the whole buffer to the underlying stream.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("sink lock poisoned");
        writer.write_all(buf)
    }

    /// Flush the underlying stream.
    pub fn flush(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("sink lock poisoned");
        writer.flush()
    }
}

impl fmt::Debug for ByteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ByteSink(..)")
    }
}

// ---------------------------------------------------------------------------
// CaptureSink
// ---------------------------------------------------------------------------

/// In-memory sink whose contents can be read back after a run.
#[derive(Clone, Default)]
pub struct CaptureSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    /// Create an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`ByteSink`] that appends to this buffer.
    pub fn sink(&self) -> ByteSink {
        ByteSink::new(CaptureWriter(Arc::clone(&self.buf)))
    }

    /// Copy of the captured bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().expect("capture lock poisoned").clone()
    }

    /// Captured bytes decoded as UTF-8, lossily.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.buf.lock().expect("capture lock poisoned").len();
        f.debug_struct("CaptureSink").field("len", &len).finish()
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogWriter
// ---------------------------------------------------------------------------

/// Writer adapter that forwards complete output lines to `tracing` events at
/// a fixed level.
///
/// Bytes are buffered until a newline arrives; [`flush`](Write::flush) emits
/// any trailing partial line, so attach a flush closer when installing one.
pub struct LogWriter {
    level: Level,
    label: String,
    buf: LineBuffer,
}

impl LogWriter {
    /// Create an adapter emitting at `level`, labelled with `label`.
    pub fn new(level: Level, label: impl Into<String>) -> Self {
        Self {
            level,
            label: label.into(),
            buf: LineBuffer::default(),
        }
    }

    fn emit(&self, line: &str) {
        log_line(self.level, &self.label, line);
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in self.buf.push(buf) {
            self.emit(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(rest) = self.buf.take_remainder() {
            self.emit(&rest);
        }
        Ok(())
    }
}

/// Line accumulator: buffers bytes and yields complete lines without their
/// trailing newline.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, buf: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(buf);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn log_line(level: Level, label: &str, line: &str) {
    if level == Level::ERROR {
        tracing::error!(label, "{line}");
    } else if level == Level::WARN {
        tracing::warn!(label, "{line}");
    } else if level == Level::INFO {
        tracing::info!(label, "{line}");
    } else if level == Level::DEBUG {
        tracing::debug!(label, "{line}");
    } else {
        tracing::trace!(label, "{line}");
    }
}

// ---------------------------------------------------------------------------
// Closers
// ---------------------------------------------------------------------------

/// Disposer invoked once after the owning command or process tears down.
pub type Closer = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Shared, drain-once list of [`Closer`]s.
///
/// Clones share the same list, so a spawn-option copy and its originating
/// command observe a single drain: whoever drains first runs the closers,
/// and later drains see an empty list.
#[derive(Clone, Default)]
pub struct CloserSet {
    inner: Arc<Mutex<Vec<Closer>>>,
}

impl CloserSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a closer.
    pub fn push(&self, closer: Closer) {
        self.inner.lock().expect("closer lock poisoned").push(closer);
    }

    /// Number of closers not yet drained.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("closer lock poisoned").len()
    }

    /// Whether the set holds no pending closers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending closer in registration order, returning the errors.
    ///
    /// Each closer runs at most once across all clones.
    pub fn drain(&self) -> Vec<io::Error> {
        let closers: Vec<Closer> = {
            let mut inner = self.inner.lock().expect("closer lock poisoned");
            inner.drain(..).collect()
        };
        let mut errors = Vec::new();
        for closer in closers {
            if let Err(err) = closer() {
                errors.push(err);
            }
        }
        errors
    }
}

impl fmt::Debug for CloserSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloserSet").field("len", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn capture_sink_round_trips_bytes() {
        let capture = CaptureSink::new();
        let sink = capture.sink();
        sink.write_all(b"hello ").unwrap();
        sink.write_all(b"world").unwrap();
        assert_eq!(capture.to_string_lossy(), "hello world");
    }

    #[test]
    fn capture_sink_clones_share_the_buffer() {
        let capture = CaptureSink::new();
        let a = capture.sink();
        let b = capture.sink();
        a.write_all(b"a").unwrap();
        b.write_all(b"b").unwrap();
        assert_eq!(capture.contents(), b"ab");
    }

    #[test]
    fn line_buffer_splits_on_newlines() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push(b"one\ntwo\nthr"), vec!["one", "two"]);
        assert_eq!(buf.push(b"ee\n"), vec!["three"]);
        assert!(buf.take_remainder().is_none());
    }

    #[test]
    fn line_buffer_keeps_partial_lines_until_flush() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"partial").is_empty());
        assert_eq!(buf.take_remainder().as_deref(), Some("partial"));
        assert!(buf.take_remainder().is_none());
    }

    #[test]
    fn log_writer_consumes_everything() {
        let mut writer = LogWriter::new(Level::DEBUG, "test");
        writer.write_all(b"line one\npartial").unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn closers_drain_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let set = CloserSet::new();
        for idx in 0..3 {
            let order = Arc::clone(&order);
            set.push(Box::new(move || {
                order.lock().unwrap().push(idx);
                Ok(())
            }));
        }

        let clone = set.clone();
        assert!(clone.drain().is_empty());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Second drain, through either handle, is a no-op.
        assert!(set.drain().is_empty());
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn closer_errors_are_collected() {
        let runs = Arc::new(AtomicUsize::new(0));
        let set = CloserSet::new();
        set.push(Box::new(|| Err(io::Error::other("boom"))));
        let counted = Arc::clone(&runs);
        set.push(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let errors = set.drain();
        assert_eq!(errors.len(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
