//! Streaming sources consumed by the encoder's stream adapter.
//!
//! A [`Source`] is pulled one item at a time. When it has nothing to give it
//! returns [`Pull::Pending`] and keeps the [`Ping`] to wake the stream task
//! once more data arrives.

use crate::error::{ErrorInfo, FlightError, Result};
use crate::format::StreamKind;
use crate::graph::Value;
use crate::schedule::Ping;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// What a source produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// One more item.
    Item(Value),
    /// The source is exhausted, optionally with a final value.
    End(Option<Value>),
    /// The source failed; the stream is errored.
    Failed(ErrorInfo),
}

/// The outcome of polling a source.
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// An event is available.
    Ready(SourceEvent),
    /// Nothing yet; the source will wake the given ping later.
    Pending,
}

/// A pull-based stream of values.
pub trait Source: Send {
    /// Returns the next event, or `Pending` after arranging to wake `ping`.
    fn poll_item(&mut self, ping: &Ping) -> Pull;

    /// Stops the source. No further polls follow.
    fn cancel(&mut self, _reason: &ErrorInfo) {}
}

/// A streamed value as it appears in a graph: a kind plus a source.
///
/// The source is taken by the first request that renders the handle; clones
/// share it, so rendering the same handle twice references the same stream.
#[derive(Clone)]
pub struct StreamHandle {
    kind: StreamKind,
    source: Arc<Mutex<Option<Box<dyn Source>>>>,
}

impl StreamHandle {
    /// Wraps a source.
    pub fn new(kind: StreamKind, source: impl Source + 'static) -> Self {
        Self {
            kind,
            source: Arc::new(Mutex::new(Some(Box::new(source)))),
        }
    }

    /// The stream flavor.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// A stable identity for deduplication.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.source) as usize
    }

    pub(crate) fn take(&self) -> Option<Box<dyn Source>> {
        self.source.lock().take()
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("kind", &self.kind)
            .field("taken", &self.source.lock().is_none())
            .finish()
    }
}

// --- CHANNEL SOURCE ---

#[derive(Default)]
struct ChannelState {
    events: VecDeque<SourceEvent>,
    waiter: Option<Ping>,
    finished: bool,
    cancelled: Option<ErrorInfo>,
}

/// Creates a connected writer and stream handle.
///
/// The writer may live on any thread; every push wakes the stream task if it
/// is parked.
///
/// ```rust
/// use flightwire::{stream_channel, StreamKind, Value};
///
/// let (writer, handle) = stream_channel(StreamKind::Readable);
/// writer.send(Value::from("first")).unwrap();
/// writer.close().unwrap();
/// assert_eq!(handle.kind(), StreamKind::Readable);
/// ```
pub fn stream_channel(kind: StreamKind) -> (StreamWriter, StreamHandle) {
    let shared = Arc::new(Mutex::new(ChannelState::default()));
    let writer = StreamWriter {
        shared: shared.clone(),
    };
    (writer, StreamHandle::new(kind, ChannelSource { shared }))
}

/// The producing half of [`stream_channel`].
#[derive(Clone)]
pub struct StreamWriter {
    shared: Arc<Mutex<ChannelState>>,
}

impl StreamWriter {
    /// Pushes one item.
    pub fn send(&self, value: Value) -> Result<()> {
        self.push(SourceEvent::Item(value), false)
    }

    /// Ends the stream.
    pub fn close(&self) -> Result<()> {
        self.push(SourceEvent::End(None), true)
    }

    /// Ends the stream with a final value.
    pub fn close_with(&self, value: Value) -> Result<()> {
        self.push(SourceEvent::End(Some(value)), true)
    }

    /// Fails the stream.
    pub fn fail(&self, error: ErrorInfo) -> Result<()> {
        self.push(SourceEvent::Failed(error), true)
    }

    /// The reason the consumer side cancelled, if it did.
    pub fn cancelled(&self) -> Option<ErrorInfo> {
        self.shared.lock().cancelled.clone()
    }

    fn push(&self, event: SourceEvent, last: bool) -> Result<()> {
        let waiter = {
            let mut state = self.shared.lock();
            if let Some(reason) = &state.cancelled {
                return Err(FlightError::Aborted(reason.message.clone()));
            }
            if state.finished {
                return Err(FlightError::Internal(
                    "stream channel already finished".into(),
                ));
            }
            state.events.push_back(event);
            state.finished = last;
            state.waiter.take()
        };
        if let Some(ping) = waiter {
            ping.wake();
        }
        Ok(())
    }
}

struct ChannelSource {
    shared: Arc<Mutex<ChannelState>>,
}

impl Source for ChannelSource {
    fn poll_item(&mut self, ping: &Ping) -> Pull {
        let mut state = self.shared.lock();
        match state.events.pop_front() {
            Some(event) => Pull::Ready(event),
            None => {
                state.waiter = Some(ping.clone());
                Pull::Pending
            }
        }
    }

    fn cancel(&mut self, reason: &ErrorInfo) {
        let mut state = self.shared.lock();
        state.cancelled = Some(reason.clone());
        state.events.clear();
        state.waiter = None;
    }
}

// --- ITERATOR SOURCE ---

/// A source over an in-memory iterator; never pending.
pub struct IterSource<I> {
    items: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Value> + Send,
{
    /// Wraps an iterator.
    pub fn new(items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator<Item = Value> + Send,
{
    fn poll_item(&mut self, _ping: &Ping) -> Pull {
        match self.items.next() {
            Some(value) => Pull::Ready(SourceEvent::Item(value)),
            None => Pull::Ready(SourceEvent::End(None)),
        }
    }
}

/// A stream handle over a ready list of values.
pub fn iter_stream(
    kind: StreamKind,
    items: impl IntoIterator<Item = Value, IntoIter: Send + 'static>,
) -> StreamHandle {
    StreamHandle::new(kind, IterSource::new(items))
}
