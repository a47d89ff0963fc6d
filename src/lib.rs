//! # flightwire
//!
//! Streaming, out-of-order serialization of live value graphs.
//!
//! ## Overview
//!
//! flightwire turns a graph of values into an append-only sequence of rows that
//! a consumer can start using before the producer has finished. Unlike a plain
//! JSON encoder it keeps the *shape* of the graph intact:
//!
//! ### Key Features
//!
//! *   **Shared References and Cycles:** A container reachable from two places is
//!     written once and referenced afterwards; cycles are ordinary references.
//! *   **Out-of-Order Rows:** Values that are not ready yet (a [`Deferred`] or a
//!     stream) get their own row id. The row is written whenever the value
//!     settles, and the consumer patches it in when it arrives.
//! *   **Binary Payloads:** Typed arrays travel as length-prefixed raw bytes
//!     instead of being expanded into JSON numbers.
//! *   **Streams:** Readable streams and async iterables are written item by
//!     item and rebuilt in order on the consumer side.
//! *   **Backpressure and Abort:** The encoder stops when its sink asks it to,
//!     and an abort settles every outstanding row with a single shared error.
//!
//! ## Architecture
//!
//! ### The Graph Model
//!
//! Containers live in a [`Graph`] arena and are addressed by [`NodeId`]. A
//! [`Value`] is either a scalar or a handle into the arena, so aliasing and
//! cycles are handle edges rather than owning pointers.
//!
//! ### Wire Format
//!
//! Every row is framed by a hex id and an optional tag:
//! ```text
//! 0:{"user":"$1","posts":"$@2"}\n        model row
//! 1:{"name":"Ada","self":"$1"}\n         a shared object, referencing itself
//! 3:o4,<4 raw bytes>                     a Uint8Array, length-prefixed
//! 2:E{"digest":"...","message":"..."}\n  a rejected promise
//! ```
//! The [`format`] module defines the grammar.
//!
//! ## Core Concepts
//!
//! ### Request
//!
//! A [`Request`] encodes one root value. It renders tasks into rows, queues
//! them by priority and drains the queues into a [`Sink`].
//!
//! ### Response
//!
//! A [`Response`] decodes one stream into a fresh graph. Rows may arrive in any
//! order and in arbitrary byte pieces.
//!
//! ## Usage Patterns
//!
//! ### Round Trip
//!
//! ```rust
//! use flightwire::{Flight, Graph, Value};
//!
//! let graph = Graph::new();
//! let shared = graph.array([Value::from(2)]);
//! let root = graph.map([
//!     (Value::from("k"), shared.clone()),
//!     (Value::from("again"), shared),
//! ]);
//!
//! let bytes = Flight::encode(&graph, root)?;
//! let (decoded, root) = Flight::decode(&bytes)?;
//!
//! let flightwire::Node::Map(entries) = decoded.get(root.as_node().unwrap()).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(entries[0].1, entries[1].1);
//! # Ok::<(), flightwire::FlightError>(())
//! ```
//!
//! ### Plain Rust Data
//!
//! ```rust
//! use flightwire::{Flight, FlightModel, Graph, IntoModel};
//!
//! #[derive(FlightModel)]
//! struct Point {
//!     x: i32,
//!     #[flight(rename = "label")]
//!     name: String,
//! }
//!
//! let graph = Graph::new();
//! let root = Point { x: 3, name: "p".into() }.into_model(&graph);
//! let bytes = Flight::encode(&graph, root)?;
//! assert_eq!(bytes, b"0:{\"x\":3,\"label\":\"p\"}\n");
//! # Ok::<(), flightwire::FlightError>(())
//! ```
//!
//! ## Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** the only `unsafe` is the memory map in
//!   [`io::map_file`].
//! * **No Panics:** No `unwrap()` or `panic!()` calls in the library (enforced by clippy lints).
//! * **Comprehensive Errors:** library failures are a [`FlightError`]; application
//!   errors travel as [`ErrorInfo`] and come back as [`ErrorDescriptor`].

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod api;
pub mod config;
pub mod error;
pub mod format;
pub mod graph;
pub mod inspector;
pub mod model;
pub mod request;
pub mod response;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod deferred;
#[doc(hidden)]
pub mod external;
#[doc(hidden)]
pub mod flush;
#[doc(hidden)]
pub mod io;
#[doc(hidden)]
pub mod schedule;
#[doc(hidden)]
pub mod source;

// --- RE-EXPORTS ---

pub use api::{Flight, FlightBuilder};
pub use config::{RequestOptions, ResponseOptions};
pub use deferred::{Deferred, Settled};
pub use error::{ErrorDescriptor, ErrorInfo, FlightError, Result, StackFrame};
pub use external::{ModuleResolver, ReferenceConfig};
pub use format::{ArrayKind, StreamKind};
pub use graph::{
    ClientReference, Graph, Node, NodeId, ServerReference, StreamItem, StreamNode, StreamState,
    TypedArray, Value,
};
pub use inspector::{DebugReport, FlightInspector, Shape};
pub use io::{MemorySink, Sink, WriterSink};
pub use model::IntoModel;
pub use request::{Callbacks, Request, RequestStatus, TaskStatus};
pub use response::{ChunkStatus, Hint, Read, Response};
pub use schedule::PingQueue;
pub use source::{Pull, Source, SourceEvent, StreamHandle, StreamWriter, iter_stream, stream_channel};

// Re-export the derive macro so it is accessible as `flightwire::FlightModel`
pub use flightwire_derive::FlightModel;

/// Constants used throughout the library.
pub mod constants {
    pub use crate::config::{
        DEFAULT_LARGE_STRING_THRESHOLD, DEFAULT_MAX_INLINE_DEPTH, DEFAULT_MAX_ROW_SIZE,
    };

    /// Stream items written per task retry before yielding to other tasks.
    pub const ITEMS_PER_PASS: usize = 64;
}
