//! Conversion of plain Rust data into value graphs.
//!
//! [`IntoModel`] is what `#[derive(FlightModel)]` implements. Structs become
//! objects, sequences arrays, maps and sets their graph counterparts. Each
//! call allocates fresh nodes, so converting the same data twice yields two
//! distinct identities; share a [`Value`] to share a node.

use crate::deferred::Deferred;
use crate::error::ErrorInfo;
use crate::graph::{ClientReference, Graph, ServerReference, TypedArray, Value};
use crate::source::StreamHandle;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Types that can be rendered into a [`Graph`].
pub trait IntoModel {
    /// Builds the value, allocating any containers in `graph`.
    fn into_model(&self, graph: &Graph) -> Value;
}

/// A `Uint8Array` copy of `bytes`; used for `#[flight(bytes)]` fields.
pub fn bytes_model(bytes: impl AsRef<[u8]>) -> Value {
    Value::Bytes(TypedArray::uint8(Bytes::copy_from_slice(bytes.as_ref())))
}

impl IntoModel for Value {
    fn into_model(&self, _graph: &Graph) -> Value {
        self.clone()
    }
}

impl IntoModel for bool {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Bool(*self)
    }
}

macro_rules! impl_number {
    ($($ty:ty),*) => {
        $(impl IntoModel for $ty {
            fn into_model(&self, _graph: &Graph) -> Value {
                Value::Number(*self as f64)
            }
        })*
    };
}

impl_number!(u8, u16, u32, i8, i16, i32, f32, f64);

// Wide integers keep full precision as bigints.
macro_rules! impl_wide {
    ($($ty:ty),*) => {
        $(impl IntoModel for $ty {
            fn into_model(&self, _graph: &Graph) -> Value {
                Value::BigInt(i128::from(*self))
            }
        })*
    };
}

impl_wide!(u64, i64, i128);

impl IntoModel for usize {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Number(*self as f64)
    }
}

impl IntoModel for str {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoModel for String {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::String(self.clone())
    }
}

impl IntoModel for char {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoModel for () {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Undefined
    }
}

impl<T: IntoModel + ?Sized> IntoModel for &T {
    fn into_model(&self, graph: &Graph) -> Value {
        (**self).into_model(graph)
    }
}

impl<T: IntoModel + ?Sized> IntoModel for Box<T> {
    fn into_model(&self, graph: &Graph) -> Value {
        (**self).into_model(graph)
    }
}

impl<T: IntoModel> IntoModel for Option<T> {
    fn into_model(&self, graph: &Graph) -> Value {
        match self {
            Some(value) => value.into_model(graph),
            None => Value::Null,
        }
    }
}

impl<T: IntoModel> IntoModel for [T] {
    fn into_model(&self, graph: &Graph) -> Value {
        let items: Vec<Value> = self.iter().map(|item| item.into_model(graph)).collect();
        graph.array(items)
    }
}

impl<T: IntoModel> IntoModel for Vec<T> {
    fn into_model(&self, graph: &Graph) -> Value {
        self.as_slice().into_model(graph)
    }
}

impl<K: IntoModel, V: IntoModel, S> IntoModel for HashMap<K, V, S> {
    fn into_model(&self, graph: &Graph) -> Value {
        let entries: Vec<(Value, Value)> = self
            .iter()
            .map(|(k, v)| (k.into_model(graph), v.into_model(graph)))
            .collect();
        graph.map(entries)
    }
}

impl<K: IntoModel, V: IntoModel> IntoModel for BTreeMap<K, V> {
    fn into_model(&self, graph: &Graph) -> Value {
        let entries: Vec<(Value, Value)> = self
            .iter()
            .map(|(k, v)| (k.into_model(graph), v.into_model(graph)))
            .collect();
        graph.map(entries)
    }
}

impl<T: IntoModel, S> IntoModel for HashSet<T, S> {
    fn into_model(&self, graph: &Graph) -> Value {
        let members: Vec<Value> = self.iter().map(|m| m.into_model(graph)).collect();
        graph.set(members)
    }
}

impl<T: IntoModel> IntoModel for BTreeSet<T> {
    fn into_model(&self, graph: &Graph) -> Value {
        let members: Vec<Value> = self.iter().map(|m| m.into_model(graph)).collect();
        graph.set(members)
    }
}

impl IntoModel for Bytes {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Bytes(TypedArray::uint8(self.clone()))
    }
}

impl IntoModel for TypedArray {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Bytes(self.clone())
    }
}

impl IntoModel for ErrorInfo {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Error(self.clone())
    }
}

impl IntoModel for ClientReference {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Client(self.clone())
    }
}

impl IntoModel for ServerReference {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Server(self.clone())
    }
}

impl IntoModel for Deferred {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Deferred(self.clone())
    }
}

impl IntoModel for StreamHandle {
    fn into_model(&self, _graph: &Graph) -> Value {
        Value::Stream(self.clone())
    }
}
