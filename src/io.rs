//! Sinks: where rendered rows go.
//!
//! A [`Sink`] accepts whole rows. Returning `Ok(false)` from [`Sink::write`]
//! signals backpressure: the row was accepted, but the flush loop must stop
//! until the host calls `on_drain` on the request.

use crate::error::{FlightError, Result};
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// The destination of a request's rows.
pub trait Sink: Send {
    /// Writes one row. `Ok(false)` means "accepted, but stop for now".
    fn write(&mut self, chunk: &[u8]) -> Result<bool>;

    /// Called once after the last row.
    fn end(&mut self) -> Result<()>;

    /// Called instead of `end` when the request fails fatally.
    fn destroy(&mut self, error: &FlightError);
}

/// A sink over any [`Write`], buffered.
///
/// Never reports backpressure; a blocking writer applies it by blocking.
#[derive(Debug)]
pub struct WriterSink<W: Write + Send> {
    writer: BufWriter<W>,
    bytes_written: u64,
}

impl<W: Write + Send> WriterSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            bytes_written: 0,
        }
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl WriterSink<File> {
    /// Creates (truncating) a file and writes into it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn write(&mut self, chunk: &[u8]) -> Result<bool> {
        self.writer.write_all(chunk)?;
        self.bytes_written += chunk.len() as u64;
        Ok(true)
    }

    fn end(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn destroy(&mut self, error: &FlightError) {
        tracing::warn!(%error, bytes = self.bytes_written, "writer sink destroyed");
        // Keep the rows that already reached the buffer.
        let _ = self.writer.flush();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    buffer: Vec<u8>,
    writes: usize,
    budget: Option<usize>,
    ended: bool,
    error: Option<String>,
}

/// An in-memory sink shared between the request and the test or host that
/// inspects it.
///
/// With a write budget set, the sink accepts that many rows and reports
/// backpressure on the row that exhausts it, like a socket whose buffer filled.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// An unbounded sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that reports backpressure after `rows` writes.
    pub fn with_budget(rows: usize) -> Self {
        let sink = Self::default();
        sink.state.lock().budget = Some(rows);
        sink
    }

    /// Adds room for `rows` more writes before the next backpressure signal.
    pub fn refill(&self, rows: usize) {
        let mut state = self.state.lock();
        if let Some(budget) = state.budget.as_mut() {
            *budget += rows;
        }
    }

    /// Removes the budget entirely.
    pub fn unbounded(&self) {
        self.state.lock().budget = None;
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().buffer.clone()
    }

    /// Everything written so far, as text (lossy for binary rows).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().buffer).into_owned()
    }

    /// Number of rows accepted.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Whether `end` was called.
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// The error passed to `destroy`, if any.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }
}

impl Sink for MemorySink {
    fn write(&mut self, chunk: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        if state.ended || state.error.is_some() {
            return Err(FlightError::Internal("write after sink was closed".into()));
        }
        state.buffer.extend_from_slice(chunk);
        state.writes += 1;
        match state.budget.as_mut() {
            Some(budget) => {
                *budget = budget.saturating_sub(1);
                Ok(*budget > 0)
            }
            None => Ok(true),
        }
    }

    fn end(&mut self) -> Result<()> {
        self.state.lock().ended = true;
        Ok(())
    }

    fn destroy(&mut self, error: &FlightError) {
        self.state.lock().error = Some(error.to_string());
    }
}

/// Memory-maps a recorded stream for reading.
pub fn map_file(path: impl AsRef<Path>) -> Result<Mmap> {
    let file = File::open(path)?;
    // Safety: Mmap is fundamentally unsafe as external processes could modify the file.
    // Recordings are written once and only read afterwards.
    #[allow(unsafe_code)]
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}
