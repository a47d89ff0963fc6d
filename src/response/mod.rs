//! The decoder: rebuilds a value graph from rows.
//!
//! A [`Response`] owns a fresh [`Graph`] and one settle-once chunk per row id.
//! Rows are fed with [`Response::ingest`] in whatever pieces the transport
//! delivers; every complete row is dispatched by tag, and model rows are
//! revived at once. References to rows that have not arrived yet leave a
//! placeholder in their slot and are patched when the row lands.
//!
//! ```rust
//! use flightwire::{Response, Value};
//!
//! let mut response = Response::new();
//! response.ingest(b"0:{\"a\":\"$1\"}\n");
//! assert!(!response.root().is_settled());
//! response.ingest(b"1:[1,2]\n");
//!
//! let root = response.root().value().cloned().unwrap();
//! let a = response.graph().field(&root, "a").unwrap();
//! assert_eq!(response.graph().field(&a, "1"), Some(Value::from(2)));
//! ```

mod chunk;
mod parser;
mod revive;

pub use chunk::{ChunkStatus, Read};
pub use parser::{ParseEvent, RawRow, RowParser};

use crate::config::ResponseOptions;
use crate::error::{ErrorDescriptor, FlightError, Result};
use crate::external::{DefaultModuleResolver, ModuleResolver};
use crate::format::RowTag;
use crate::graph::{Graph, Node, NodeId, StreamItem, StreamNode, StreamState, TypedArray, Value};
use bytes::Bytes;
use chunk::{Chunk, ChunkState, Handler, HandlerId, Listener, Owner};
use revive::{Delivery, Outcome, WorkQueue};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A hint row, handed to the consumer's host untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Hint {
    /// The one-character hint code.
    pub code: char,
    /// The hint's JSON model.
    pub model: Json,
}

/// One deserialization of one stream.
pub struct Response {
    graph: Graph,
    options: ResponseOptions,
    resolver: Box<dyn ModuleResolver>,
    chunks: BTreeMap<u32, Chunk>,
    handlers: HashMap<HandlerId, Handler>,
    next_handler: HandlerId,
    /// Open streams by row id.
    streams: HashMap<u32, NodeId>,
    parser: RowParser,
    debug_parser: RowParser,
    hints: Vec<Hint>,
    debug_info: BTreeMap<u32, Vec<Json>>,
    closed: Option<ErrorDescriptor>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// A response with default options and module resolver.
    pub fn new() -> Self {
        Self::with_options(ResponseOptions::default(), DefaultModuleResolver)
    }

    /// A response with explicit options and module resolver.
    pub fn with_options(options: ResponseOptions, resolver: impl ModuleResolver + 'static) -> Self {
        Self {
            graph: Graph::new(),
            parser: RowParser::new(options.max_row_length),
            debug_parser: RowParser::new(options.max_row_length),
            options,
            resolver: Box::new(resolver),
            chunks: BTreeMap::new(),
            handlers: HashMap::new(),
            next_handler: 0,
            streams: HashMap::new(),
            hints: Vec::new(),
            debug_info: BTreeMap::new(),
            closed: None,
        }
    }

    // --- INPUT ---

    /// Feeds bytes from the primary channel.
    pub fn ingest(&mut self, bytes: &[u8]) {
        let mut events = Vec::new();
        self.parser.feed(bytes, &mut events);
        for event in events {
            self.dispatch(event);
        }
    }

    /// Feeds bytes from the diagnostic channel.
    ///
    /// Debug rows share the id space of the primary channel.
    pub fn ingest_debug(&mut self, bytes: &[u8]) {
        let mut events = Vec::new();
        self.debug_parser.feed(bytes, &mut events);
        for event in events {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::Row(RawRow { id: Some(id), tag, payload }) => {
                self.resolve_row(id, tag, payload)
            }
            ParseEvent::Row(RawRow { id: None, tag, payload }) => {
                if tag == b'H' {
                    self.record_hint(&payload);
                } else {
                    tracing::warn!(tag = %char::from(tag), "dropping row without id");
                }
            }
            ParseEvent::Malformed { id: Some(id), reason } => {
                let mut work = WorkQueue::new();
                self.reject(id, ErrorDescriptor::local(reason), &mut work);
                self.drain(work);
            }
            ParseEvent::Malformed { id: None, .. } => {}
        }
    }

    /// Handles one framed row.
    ///
    /// Rows for an open stream become items of that stream; all others settle
    /// the chunk of `id` according to `tag` (`0` for model rows).
    pub fn resolve_row(&mut self, id: u32, tag: u8, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let mut work = WorkQueue::new();
        if let Some(node) = self.streams.get(&id).copied() {
            self.resolve_stream_row(id, node, tag, payload, &mut work);
        } else {
            self.resolve_chunk_row(id, tag, payload, &mut work);
        }
        self.drain(work);
    }

    fn resolve_chunk_row(&mut self, id: u32, tag: u8, payload: Bytes, work: &mut WorkQueue) {
        match RowTag::from_byte(tag) {
            RowTag::Model => {
                let chunk = self.ensure_chunk(id);
                if !matches!(chunk.state, ChunkState::Pending) {
                    tracing::warn!(id, status = ?chunk.state.status(), "ignoring duplicate row");
                    return;
                }
                chunk.state = ChunkState::ResolvedRaw(payload);
                self.initialize(id, work);
            }
            RowTag::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => self.fulfill(id, Value::String(text), work),
                Err(error) => {
                    self.reject(id, ErrorDescriptor::local(format!("invalid UTF-8 in text row: {error}")), work)
                }
            },
            RowTag::Binary(kind) => match TypedArray::new(kind, payload) {
                Ok(array) => self.fulfill(id, Value::Bytes(array), work),
                Err(error) => self.reject(id, ErrorDescriptor::from(&error), work),
            },
            RowTag::Import => {
                let reference = serde_json::from_slice::<Json>(&payload)
                    .map_err(FlightError::from)
                    .and_then(|metadata| self.resolver.resolve(&metadata));
                match reference {
                    Ok(reference) => self.fulfill(id, Value::Client(reference), work),
                    Err(error) => self.reject(id, ErrorDescriptor::from(&error), work),
                }
            }
            RowTag::Error => {
                let descriptor = parse_descriptor(&payload);
                self.reject(id, descriptor, work);
            }
            RowTag::Hint => self.record_hint(&payload),
            RowTag::StreamOpen(kind) => {
                let chunk = self.ensure_chunk(id);
                if !matches!(chunk.state, ChunkState::Pending) {
                    tracing::warn!(id, "ignoring stream opened on a settled row");
                    return;
                }
                let node = self.graph.alloc(Node::Stream(StreamNode::new(kind)));
                self.streams.insert(id, node);
                tracing::trace!(id, ?kind, "stream opened");
                self.fulfill(id, Value::Node(node), work);
            }
            RowTag::Close => tracing::warn!(id, "close row for a stream that is not open"),
            RowTag::DebugInfo => self.record_debug_info(id, &payload),
            RowTag::Timing | RowTag::IoInfo | RowTag::ConsoleLog => {
                tracing::trace!(id, tag = %char::from(tag), "debug row ignored");
            }
            RowTag::Unknown(tag) => {
                let error = FlightError::Unsupported(format!("unknown row tag '{}'", char::from(tag)));
                self.reject(id, ErrorDescriptor::from(&error), work);
            }
        }
    }

    fn resolve_stream_row(&mut self, id: u32, node: NodeId, tag: u8, payload: Bytes, work: &mut WorkQueue) {
        match RowTag::from_byte(tag) {
            RowTag::Model => {
                let Some(index) = self.push_stream_item(node, Value::Null, false) else {
                    return;
                };
                match serde_json::from_slice::<Json>(&payload) {
                    Ok(json) => self.revive_root(Owner::StreamItem(node, index), None, json, work),
                    Err(error) => {
                        let descriptor = ErrorDescriptor::from(&FlightError::from(error));
                        self.fail_owner(Owner::StreamItem(node, index), descriptor, work);
                    }
                }
            }
            RowTag::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => {
                    self.push_stream_item(node, Value::String(text), true);
                }
                Err(error) => self.error_stream(
                    id,
                    node,
                    ErrorDescriptor::local(format!("invalid UTF-8 in text row: {error}")),
                ),
            },
            RowTag::Binary(kind) => match TypedArray::new(kind, payload) {
                Ok(array) => {
                    self.push_stream_item(node, Value::Bytes(array), true);
                }
                Err(error) => self.error_stream(id, node, ErrorDescriptor::from(&error)),
            },
            RowTag::Close => {
                self.streams.remove(&id);
                if payload.is_empty() {
                    self.update_stream(node, |stream| stream.state = StreamState::Closed);
                } else {
                    match serde_json::from_slice::<Json>(&payload) {
                        Ok(json) => self.revive_root(Owner::StreamEnd(node), None, json, work),
                        Err(error) => {
                            let descriptor = ErrorDescriptor::from(&FlightError::from(error));
                            self.fail_owner(Owner::StreamEnd(node), descriptor, work);
                        }
                    }
                }
                tracing::trace!(id, "stream closed");
            }
            RowTag::Error => {
                let descriptor = parse_descriptor(&payload);
                self.error_stream(id, node, descriptor);
            }
            RowTag::DebugInfo => self.record_debug_info(id, &payload),
            other => tracing::warn!(id, tag = ?other, "ignoring row on an open stream"),
        }
    }

    fn push_stream_item(&mut self, node: NodeId, value: Value, ready: bool) -> Option<usize> {
        self.update_stream(node, |stream| {
            stream.items.push(StreamItem { value, ready });
            stream.items.len() - 1
        })
    }

    fn update_stream<R>(&self, node: NodeId, f: impl FnOnce(&mut StreamNode) -> R) -> Option<R> {
        self.graph
            .update(node, |node| match node {
                Node::Stream(stream) => Some(f(stream)),
                _ => None,
            })
            .flatten()
    }

    fn error_stream(&mut self, id: u32, node: NodeId, descriptor: ErrorDescriptor) {
        tracing::debug!(id, error = %descriptor, "stream errored");
        self.streams.remove(&id);
        self.update_stream(node, |stream| stream.state = StreamState::Errored(descriptor));
    }

    fn record_hint(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        let mut chars = text.chars();
        let Some(code) = chars.next() else {
            tracing::warn!("dropping empty hint row");
            return;
        };
        match serde_json::from_str(chars.as_str()) {
            Ok(model) => self.hints.push(Hint { code, model }),
            Err(error) => tracing::warn!(%code, %error, "dropping malformed hint"),
        }
    }

    fn record_debug_info(&mut self, id: u32, payload: &[u8]) {
        match serde_json::from_slice(payload) {
            Ok(info) => self.debug_info.entry(id).or_default().push(info),
            Err(error) => tracing::warn!(id, %error, "dropping malformed debug info"),
        }
    }

    // --- SETTLEMENT ---

    fn ensure_chunk(&mut self, id: u32) -> &mut Chunk {
        let closed = &self.closed;
        self.chunks.entry(id).or_insert_with(|| match closed {
            Some(error) => Chunk::new(ChunkState::Rejected(error.clone())),
            None => Chunk::new(ChunkState::Pending),
        })
    }

    fn fulfill(&mut self, id: u32, value: Value, work: &mut WorkQueue) {
        let chunk = self.ensure_chunk(id);
        if chunk.state.is_settled() {
            tracing::warn!(id, "ignoring second settlement of a row");
            return;
        }
        chunk.state = ChunkState::Fulfilled(value.clone());
        let listeners = std::mem::take(&mut chunk.listeners);
        tracing::trace!(id, listeners = listeners.len(), "chunk fulfilled");
        work.extend(listeners.into_iter().map(|listener| Delivery {
            source: id,
            listener,
            outcome: Outcome::Value(value.clone()),
        }));
    }

    fn reject(&mut self, id: u32, error: ErrorDescriptor, work: &mut WorkQueue) {
        let chunk = self.ensure_chunk(id);
        if chunk.state.is_settled() {
            return;
        }
        let previous = std::mem::replace(&mut chunk.state, ChunkState::Rejected(error.clone()));
        let listeners = std::mem::take(&mut chunk.listeners);
        if let ChunkState::Blocked { handler, .. } = previous {
            self.handlers.remove(&handler);
        }
        tracing::debug!(id, error = %error, "chunk rejected");
        work.extend(listeners.into_iter().map(|listener| Delivery {
            source: id,
            listener,
            outcome: Outcome::Error(error.clone()),
        }));
    }

    fn complete_owner(&mut self, owner: Owner, value: Value, work: &mut WorkQueue) {
        match owner {
            Owner::Chunk(id) => self.fulfill(id, value, work),
            Owner::StreamItem(node, index) => {
                self.update_stream(node, |stream| {
                    if let Some(item) = stream.items.get_mut(index) {
                        item.value = value;
                        item.ready = true;
                    }
                });
            }
            Owner::StreamEnd(node) => {
                self.update_stream(node, |stream| {
                    stream.final_value = Some(value);
                    stream.state = StreamState::Closed;
                });
            }
        }
    }

    fn fail_owner(&mut self, owner: Owner, error: ErrorDescriptor, work: &mut WorkQueue) {
        match owner {
            Owner::Chunk(id) => self.reject(id, error, work),
            Owner::StreamItem(node, _) | Owner::StreamEnd(node) => {
                if let Some(id) = self
                    .streams
                    .iter()
                    .find_map(|(id, open)| (*open == node).then_some(*id))
                {
                    self.streams.remove(&id);
                }
                tracing::debug!(error = %error, "stream item failed");
                self.update_stream(node, |stream| stream.state = StreamState::Errored(error));
            }
        }
    }

    // --- LIFECYCLE ---

    /// Ends the input: every unsettled chunk and open stream fails with
    /// "Connection closed.", and later lookups of unknown ids do too.
    pub fn close(&mut self) {
        let message = self.options.closed_message.clone();
        self.close_with(ErrorDescriptor::local(message));
    }

    /// Like [`Response::close`], with a caller supplied reason.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        self.close_with(ErrorDescriptor::local(reason));
    }

    fn close_with(&mut self, error: ErrorDescriptor) {
        if self.closed.is_some() {
            return;
        }
        if !self.parser.is_idle() {
            tracing::warn!("input ended inside a row");
        }
        self.closed = Some(error.clone());
        let mut work = WorkQueue::new();
        let open: Vec<u32> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| !chunk.state.is_settled())
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            self.reject(id, error.clone(), &mut work);
        }
        let streams: Vec<(u32, NodeId)> = self.streams.drain().collect();
        for (id, node) in streams {
            self.error_stream(id, node, error.clone());
        }
        self.handlers.clear();
        tracing::debug!(chunks = self.chunks.len(), "response closed");
        self.drain(work);
    }

    /// Whether `close` or `abandon` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    // --- CONSUMER API ---

    /// The lifecycle state of chunk `id`, if it was ever referenced.
    pub fn status(&self, id: u32) -> Option<ChunkStatus> {
        self.chunks.get(&id).map(|chunk| chunk.state.status())
    }

    /// The outcome of chunk `id`.
    pub fn read(&self, id: u32) -> Read<'_> {
        match (self.chunks.get(&id), &self.closed) {
            (Some(chunk), _) => chunk.state.read(),
            (None, Some(error)) => Read::Failed(error),
            (None, None) => Read::Pending,
        }
    }

    /// The outcome of the root chunk (id 0).
    pub fn root(&self) -> Read<'_> {
        self.read(0)
    }

    /// The root value, or the error that replaced it.
    pub fn root_value(&self) -> Result<Value> {
        match self.root() {
            Read::Ready(value) => Ok(value.clone()),
            Read::Failed(error) => Err(FlightError::Rejected(error.clone())),
            Read::Pending => Err(FlightError::Format("the root row has not arrived".into())),
        }
    }

    /// Calls `f` once chunk `id` settles, immediately if it already has.
    pub fn on_settle(&mut self, id: u32, f: impl FnOnce(Read<'_>) + 'static) {
        let chunk = self.ensure_chunk(id);
        if chunk.state.is_settled() {
            f(chunk.state.read());
        } else {
            chunk.listeners.push(Listener::Consumer(Box::new(f)));
        }
    }

    /// The buffered state of the stream opened on row `id`.
    pub fn stream(&self, id: u32) -> Option<StreamNode> {
        let Read::Ready(Value::Node(node)) = self.read(id) else {
            return None;
        };
        match self.graph.get(*node)? {
            Node::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// The graph values are decoded into.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Hint rows received since the last call.
    pub fn take_hints(&mut self) -> Vec<Hint> {
        std::mem::take(&mut self.hints)
    }

    /// Debug info rows attached to row `id`.
    pub fn debug_info(&self, id: u32) -> &[Json] {
        self.debug_info.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Chunks referenced or defined so far that have not settled.
    pub fn pending_chunks(&self) -> usize {
        self.chunks
            .values()
            .filter(|chunk| !chunk.state.is_settled())
            .count()
    }
}

fn parse_descriptor(payload: &[u8]) -> ErrorDescriptor {
    serde_json::from_slice(payload).unwrap_or_else(|error| {
        ErrorDescriptor::local(format!("malformed error row: {error}"))
    })
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("chunks", &self.chunks.len())
            .field("pending", &self.pending_chunks())
            .field("open_streams", &self.streams.len())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}
