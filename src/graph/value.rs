use super::id::NodeId;
use crate::deferred::Deferred;
use crate::error::{ErrorInfo, FlightError, Result};
use crate::format::ArrayKind;
use crate::source::StreamHandle;
use bytes::Bytes;

/// A single value in a graph.
///
/// Scalars are stored inline. Containers live in the [`Graph`](super::Graph)
/// arena and are referenced by [`NodeId`], so aliasing and cycles are plain
/// handle edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absence of a value, distinct from `Null`.
    Undefined,
    /// JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double, including `-0`, `NaN` and the infinities.
    Number(f64),
    /// An arbitrary precision integer (limited to `i128`).
    BigInt(i128),
    /// A text value.
    String(String),
    /// A timestamp in ISO-8601 text form.
    Date(String),
    /// A well-known symbol by registry name.
    Symbol(String),
    /// A binary payload.
    Bytes(TypedArray),
    /// A container in the arena.
    Node(NodeId),
    /// An error *value* (not a failure of the encoder).
    Error(ErrorInfo),
    /// An opaque key the consumer resolves against its own temporary table.
    Temporary(String),
    /// A handle to code living on the consumer side.
    Client(ClientReference),
    /// A handle to a callable living on the producer side.
    Server(ServerReference),
    /// An asynchronous value that may still be pending (encoder side).
    Deferred(Deferred),
    /// An open streaming source (encoder side).
    Stream(StreamHandle),
    /// A decoded promise or deferred diagnostic: the wire id of its chunk (decoder side).
    Chunk(u32),
}

impl Value {
    /// Builds a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    /// Returns the node handle if this is a container.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the text if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the flag if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns `true` for `Undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// A short name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Symbol(_) => "symbol",
            Value::Bytes(_) => "bytes",
            Value::Node(_) => "node",
            Value::Error(_) => "error",
            Value::Temporary(_) => "temporary reference",
            Value::Client(_) => "client reference",
            Value::Server(_) => "server reference",
            Value::Deferred(_) => "deferred",
            Value::Stream(_) => "stream",
            Value::Chunk(_) => "chunk",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Node(id)
    }
}

impl From<TypedArray> for Value {
    fn from(array: TypedArray) -> Self {
        Value::Bytes(array)
    }
}

impl From<Deferred> for Value {
    fn from(deferred: Deferred) -> Self {
        Value::Deferred(deferred)
    }
}

impl From<StreamHandle> for Value {
    fn from(stream: StreamHandle) -> Self {
        Value::Stream(stream)
    }
}

impl From<ErrorInfo> for Value {
    fn from(info: ErrorInfo) -> Self {
        Value::Error(info)
    }
}

/// A binary payload tagged with its element kind.
///
/// The bytes are kept in the platform's little-endian layout, exactly as they go
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedArray {
    kind: ArrayKind,
    bytes: Bytes,
}

impl TypedArray {
    /// Wraps raw bytes, checking that they hold a whole number of elements.
    pub fn new(kind: ArrayKind, bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let size = kind.element_size();
        if bytes.len() % size != 0 {
            return Err(FlightError::Format(format!(
                "{} payload of {} bytes is not a multiple of {}",
                kind.name(),
                bytes.len(),
                size
            )));
        }
        Ok(Self { kind, bytes })
    }

    /// A `Uint8Array` over the given bytes.
    pub fn uint8(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: ArrayKind::Uint8,
            bytes: bytes.into(),
        }
    }

    /// A raw `ArrayBuffer`.
    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: ArrayKind::ArrayBuffer,
            bytes: bytes.into(),
        }
    }

    /// A `Float64Array` from native doubles.
    pub fn float64(values: &[f64]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            kind: ArrayKind::Float64,
            bytes: Bytes::from(bytes),
        }
    }

    /// An `Int32Array` from native integers.
    pub fn int32(values: &[i32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            kind: ArrayKind::Int32,
            bytes: Bytes::from(bytes),
        }
    }

    /// The element kind.
    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    /// The raw payload.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.element_size()
    }

    /// Returns `true` when there are no elements.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A handle to code on the consumer side: module id plus export name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientReference {
    /// Module identifier as known to the consumer's module system.
    pub id: String,
    /// Export name inside the module.
    pub name: String,
    /// Whether the module must be loaded asynchronously.
    pub is_async: bool,
}

impl ClientReference {
    /// A synchronous reference to `name` in module `id`.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_async: false,
        }
    }

    /// Marks the module as asynchronous.
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// The deduplication key: one import row is written per key.
    pub fn key(&self) -> String {
        format!("{}#{}", self.id, self.name)
    }
}

/// A handle to a callable on the producer side, optionally with bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReference {
    /// Opaque identifier of the callable.
    pub id: String,
    /// Arguments bound ahead of time.
    pub bound: Option<Vec<Value>>,
}

impl ServerReference {
    /// A reference without bound arguments.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bound: None,
        }
    }

    /// Binds arguments.
    pub fn bind(mut self, args: Vec<Value>) -> Self {
        self.bound = Some(args);
        self
    }
}
