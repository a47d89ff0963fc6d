//! Decoder-side settle-once cells and their dependency bookkeeping.

use crate::error::ErrorDescriptor;
use crate::graph::{NodeId, Value};
use bytes::Bytes;
use std::fmt;

/// Public view of a chunk's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Referenced, but its row has not arrived.
    Pending,
    /// Its row arrived and waits on other chunks.
    Blocked,
    /// Its row is being revived.
    Cyclic,
    /// Its row arrived but has not been revived yet.
    ResolvedRaw,
    /// Holds its final value.
    Fulfilled,
    /// Holds an error.
    Rejected,
}

/// The outcome of a chunk, as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Read<'a> {
    /// Not settled yet.
    Pending,
    /// The chunk's value.
    Ready(&'a Value),
    /// The chunk's error.
    Failed(&'a ErrorDescriptor),
}

impl<'a> Read<'a> {
    /// The value, if the chunk fulfilled.
    pub fn value(self) -> Option<&'a Value> {
        match self {
            Read::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the chunk settled either way.
    pub fn is_settled(self) -> bool {
        !matches!(self, Read::Pending)
    }
}

pub(super) type HandlerId = u32;

#[derive(Debug)]
pub(super) enum ChunkState {
    Pending,
    /// Waiting on the handler's dependencies; `partial` is the revived value
    /// with placeholders still in its slots.
    Blocked { handler: HandlerId, partial: Value },
    Cyclic,
    ResolvedRaw(Bytes),
    Fulfilled(Value),
    Rejected(ErrorDescriptor),
}

impl ChunkState {
    pub fn status(&self) -> ChunkStatus {
        match self {
            ChunkState::Pending => ChunkStatus::Pending,
            ChunkState::Blocked { .. } => ChunkStatus::Blocked,
            ChunkState::Cyclic => ChunkStatus::Cyclic,
            ChunkState::ResolvedRaw(_) => ChunkStatus::ResolvedRaw,
            ChunkState::Fulfilled(_) => ChunkStatus::Fulfilled,
            ChunkState::Rejected(_) => ChunkStatus::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ChunkState::Fulfilled(_) | ChunkState::Rejected(_))
    }

    pub fn read(&self) -> Read<'_> {
        match self {
            ChunkState::Fulfilled(value) => Read::Ready(value),
            ChunkState::Rejected(error) => Read::Failed(error),
            _ => Read::Pending,
        }
    }
}

#[derive(Debug)]
pub(super) struct Chunk {
    pub state: ChunkState,
    pub listeners: Vec<Listener>,
}

impl Chunk {
    pub fn new(state: ChunkState) -> Self {
        Self {
            state,
            listeners: Vec::new(),
        }
    }
}

/// Where a resolved reference is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Slot {
    /// The handler's root value itself.
    Root,
    /// A positional slot of a container (see `Node::slot_mut`).
    Index(NodeId, usize),
}

/// How a referenced value is turned into the value that fills the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MapKind {
    Plain,
    Map,
    Set,
    Error,
    Server,
    Iterator,
}

/// What a handler completes once its last dependency lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Owner {
    Chunk(u32),
    StreamItem(NodeId, usize),
    StreamEnd(NodeId),
}

/// The blocked-count token of one revival pass.
#[derive(Debug)]
pub(super) struct Handler {
    pub deps: usize,
    pub value: Value,
    pub owner: Owner,
    /// Chunks this handler still waits on, one entry per outstanding listener.
    pub waits: Vec<u32>,
}

type ConsumerHook = Box<dyn FnOnce(Read<'_>)>;

pub(super) enum Listener {
    Reference {
        handler: HandlerId,
        slot: Slot,
        path: Vec<String>,
        map: MapKind,
    },
    Consumer(ConsumerHook),
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Reference {
                handler,
                slot,
                path,
                map,
            } => f
                .debug_struct("Reference")
                .field("handler", handler)
                .field("slot", slot)
                .field("path", path)
                .field("map", map)
                .finish(),
            Listener::Consumer(_) => f.write_str("Consumer"),
        }
    }
}
