//! The value graph shared by the encoder and the decoder.
//!
//! Containers live in an arena ([`Graph`]) and are addressed by [`NodeId`]
//! handles, so aliasing and cycles never need owning pointers.

/// Defines the `Graph` arena and the `Node` containers.
pub mod core;
/// Defines the `NodeId` type.
pub mod id;
/// Defines `Value` and the leaf payload types.
pub mod value;

pub use core::{Graph, Node, StreamItem, StreamNode, StreamState};
pub use id::NodeId;
pub use value::{ClientReference, ServerReference, TypedArray, Value};
