//! One-shot entry points over [`Request`] and [`Response`].
//!
//! These drive a request on the calling thread until it closes. They suit
//! graphs whose deferred values and streams settle without outside help; hosts
//! that resolve values from other threads or apply backpressure drive a
//! [`Request`] themselves.

use crate::config::{RequestOptions, ResponseOptions};
use crate::error::{FlightError, Result};
use crate::external::{DefaultModuleResolver, DefaultReferenceConfig};
use crate::graph::{Graph, Value};
use crate::inspector::{DebugReport, FlightInspector};
use crate::io::{MemorySink, Sink, WriterSink, map_file};
use crate::request::{Callbacks, Request, RequestStatus};
use crate::response::Response;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// The main entry point for encoding and decoding whole streams.
#[derive(Debug)]
pub struct Flight;

impl Flight {
    /// Returns a builder to configure encoding.
    ///
    /// # Example
    /// ```rust
    /// use flightwire::{Flight, Graph, Value};
    ///
    /// let graph = Graph::new();
    /// let root = graph.object([("text", Value::from("a".repeat(40)))]);
    /// let mut buffer = Vec::new();
    /// Flight::builder()
    ///     .large_string_threshold(16)
    ///     .write_to_writer(&mut buffer, &graph, root)?;
    /// assert!(buffer.starts_with(b"1:T28,"));
    /// # Ok::<(), flightwire::FlightError>(())
    /// ```
    pub fn builder() -> FlightBuilder {
        FlightBuilder::default()
    }

    /// Encodes `root` with default options.
    pub fn encode(graph: &Graph, root: Value) -> Result<Vec<u8>> {
        Self::builder().encode(graph, root)
    }

    /// Decodes a complete stream into a fresh graph and its root value.
    ///
    /// Rows that never arrived reject with "Connection closed."; if the root is
    /// among them the error is returned.
    pub fn decode(bytes: &[u8]) -> Result<(Graph, Value)> {
        Self::builder().decode(bytes)
    }

    /// Encodes `root` straight into a file.
    pub fn save<P: AsRef<Path>>(path: P, graph: &Graph, root: Value) -> Result<()> {
        Self::builder().save(path, graph, root)
    }

    /// Decodes a file written by [`Flight::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<(Graph, Value)> {
        Self::builder().load(path)
    }

    /// Structural report of a recorded stream.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<DebugReport> {
        FlightInspector::inspect_file(path)
    }
}

/// Configures encoding and decoding.
#[derive(Debug, Clone, Default)]
pub struct FlightBuilder {
    request: RequestOptions,
    response: ResponseOptions,
}

impl FlightBuilder {
    /// Rendered characters a row may hold before containers are deferred.
    pub fn max_row_size(mut self, size: usize) -> Self {
        self.request.max_row_size = size;
        self
    }

    /// Length from which strings are written as text rows.
    pub fn large_string_threshold(mut self, length: usize) -> Self {
        self.request.large_string_threshold = length;
        self
    }

    /// Nesting depth from which containers are deferred.
    pub fn max_inline_depth(mut self, depth: usize) -> Self {
        self.request.max_inline_depth = depth;
        self
    }

    /// Delay between an abort and the fatal references of aborted tasks.
    pub fn abort_grace(mut self, grace: Duration) -> Self {
        self.request.abort_grace = grace;
        self
    }

    /// Environment stamped on error rows.
    pub fn environment_name(mut self, name: impl Into<String>) -> Self {
        self.request.environment_name = name.into();
        self
    }

    /// Whether diagnostic objects are retained for the debug channel.
    pub fn keep_diagnostics(mut self, keep: bool) -> Self {
        self.request.keep_diagnostics = keep;
        self
    }

    /// Largest binary or text row accepted while decoding.
    pub fn max_row_length(mut self, length: usize) -> Self {
        self.response.max_row_length = length;
        self
    }

    /// Replaces the encoder options wholesale.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.request = options;
        self
    }

    /// Replaces the decoder options wholesale.
    pub fn response_options(mut self, options: ResponseOptions) -> Self {
        self.response = options;
        self
    }

    /// A request for `root` configured by this builder.
    pub fn request(&self, graph: &Graph, root: Value) -> Request {
        Request::create(
            graph.clone(),
            root,
            self.request.clone(),
            DefaultReferenceConfig,
            Callbacks::default(),
        )
    }

    /// Encodes `root` into memory.
    pub fn encode(&self, graph: &Graph, root: Value) -> Result<Vec<u8>> {
        let sink = MemorySink::new();
        self.run(graph, root, sink.clone())?;
        Ok(sink.contents())
    }

    /// Encodes `root` and writes the stream to `writer`.
    pub fn write_to_writer<W: Write>(&self, mut writer: W, graph: &Graph, root: Value) -> Result<()> {
        let bytes = self.encode(graph, root)?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Encodes `root` into a file, row by row.
    pub fn save<P: AsRef<Path>>(&self, path: P, graph: &Graph, root: Value) -> Result<()> {
        let path = path.as_ref();
        let sink = WriterSink::create(path)?;
        self.run(graph, root, sink)?;
        tracing::debug!(path = %path.display(), "recording saved");
        Ok(())
    }

    /// Decodes a complete stream.
    pub fn decode(&self, bytes: &[u8]) -> Result<(Graph, Value)> {
        let mut response = Response::with_options(self.response.clone(), DefaultModuleResolver);
        response.ingest(bytes);
        response.close();
        let root = response.root_value()?;
        Ok((response.graph().clone(), root))
    }

    /// Decodes a recording through a memory map.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<(Graph, Value)> {
        let mmap = map_file(path)?;
        self.decode(&mmap)
    }

    fn run(&self, graph: &Graph, root: Value, sink: impl Sink + 'static) -> Result<()> {
        let mut request = self.request(graph, root);
        request.start_flowing(sink);
        drive(&mut request)
    }
}

/// Performs work until the request closes.
///
/// Fails when the request stalls on values nothing on this thread will settle.
fn drive(request: &mut Request) -> Result<()> {
    loop {
        request.perform_work();
        if let Some(error) = request.fatal_error() {
            return Err(error.clone());
        }
        if request.status() == RequestStatus::Closed {
            return Ok(());
        }
        if !request.has_pending_work() {
            return Err(FlightError::Render(format!(
                "request stalled with {} pending tasks",
                request.pending_tasks()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;

    #[test]
    fn stalled_requests_fail() {
        let graph = Graph::new();
        let root = graph.array([Value::Deferred(Deferred::new())]);
        let err = Flight::encode(&graph, root).unwrap_err();
        assert!(matches!(err, FlightError::Render(_)));
    }

    #[test]
    fn builder_options_reach_the_request() {
        let graph = Graph::new();
        let request = Flight::builder()
            .max_row_size(10)
            .environment_name("Edge")
            .request(&graph, Value::Null);
        assert_eq!(request.options().max_row_size, 10);
        assert_eq!(request.options().environment_name, "Edge");
    }
}
