//! Centralized error handling for flightwire.
//!
//! Two families of failure live here:
//!
//! 1. [`FlightError`] describes failures of the library itself: I/O on a sink,
//!    malformed rows, values that cannot be encoded, a consumer that was closed
//!    before the producer finished.
//! 2. [`ErrorInfo`] and [`ErrorDescriptor`] describe *application* errors that
//!    travel over the wire. A rejected [`Deferred`](crate::Deferred) or a failing
//!    stream source produces an `ErrorInfo`; the encoder turns it into an error row
//!    carrying an [`ErrorDescriptor`], and the decoder hands that descriptor back
//!    as the rejection reason of the affected chunk.
//!
//! ## Error Propagation with `?`
//!
//! ```rust
//! use flightwire::{Flight, Graph, Value};
//!
//! fn roundtrip() -> flightwire::Result<()> {
//!     let graph = Graph::new();
//!     let root = graph.array([Value::from(1), Value::from("two")]);
//!     let bytes = Flight::encode(&graph, root)?;
//!     let (_graph, _root) = Flight::decode(&bytes)?;
//!     Ok(())
//! }
//! # roundtrip().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// A specialized `Result` type for flightwire operations.
pub type Result<T> = std::result::Result<T, FlightError>;

/// The master error enum covering all failure domains in flightwire.
///
/// I/O errors are wrapped in `Arc` so the type stays `Clone`; a fatal error is
/// both handed to the fatal-error callback and kept on the request for a sink
/// attached later.
#[derive(Debug, Clone, Error)]
pub enum FlightError {
    /// Low-level I/O failure while writing to a sink or reading a recording.
    #[error("I/O Error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A JSON payload could not be produced or parsed.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The byte stream does not follow the row grammar (bad id, bad length, bad UTF-8).
    #[error("Format Error: {0}")]
    Format(String),

    /// A row tag or reference token this implementation does not understand.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A value reachable from the root cannot be encoded.
    #[error("Render Error: {0}")]
    Render(String),

    /// The producer reported an application error for this chunk.
    #[error("{0}")]
    Rejected(ErrorDescriptor),

    /// The byte stream ended while the chunk was still outstanding.
    #[error("Connection closed.")]
    ConnectionClosed,

    /// The request was aborted before the value was produced.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Logic error in the scheduler or the revival engine.
    ///
    /// This should not occur in production; it indicates a bug.
    #[error("Internal Logic Error: {0}")]
    Internal(String),
}

impl From<io::Error> for FlightError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for FlightError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// One frame of a captured stack: `[function, file, line, column]` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame(pub String, pub String, pub u32, pub u32);

fn default_error_name() -> String {
    "Error".to_string()
}

/// An application-level error as seen by the encoder.
///
/// This is the payload of a rejected [`Deferred`](crate::Deferred), a failed
/// stream source, or an error *value* (`Value::Error`) embedded in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class name, `"Error"` unless set.
    #[serde(default = "default_error_name")]
    pub name: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
    /// Captured frames, empty when unknown.
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    /// The environment the error originated in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    /// A nested cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    /// An `Error` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// An error with an explicit class name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: Vec::new(),
            env: None,
            cause: None,
        }
    }

    /// Attaches a cause.
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attaches a stack frame.
    pub fn with_frame(mut self, function: &str, file: &str, line: u32, column: u32) -> Self {
        self.stack.push(StackFrame(
            function.to_string(),
            file.to_string(),
            line,
            column,
        ));
        self
    }

    /// Sets the originating environment.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

impl From<&FlightError> for ErrorInfo {
    fn from(err: &FlightError) -> Self {
        match err {
            FlightError::Rejected(descriptor) => descriptor.info.clone(),
            other => ErrorInfo::new(other.to_string()),
        }
    }
}

impl From<FlightError> for ErrorInfo {
    fn from(err: FlightError) -> Self {
        ErrorInfo::from(&err)
    }
}

/// The body of an `E` row: an [`ErrorInfo`] plus an opaque digest.
///
/// The digest is what production consumers are meant to match on; the message
/// and stack may be redacted by the producer's error callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Opaque identifier computed by the producer.
    #[serde(default)]
    pub digest: String,
    /// The error itself.
    #[serde(flatten)]
    pub info: ErrorInfo,
}

impl ErrorDescriptor {
    /// Builds a descriptor from an error and a digest.
    pub fn new(digest: impl Into<String>, info: ErrorInfo) -> Self {
        Self {
            digest: digest.into(),
            info,
        }
    }

    /// A descriptor without digest, used for consumer-side failures.
    pub fn local(message: impl Into<String>) -> Self {
        Self::new("", ErrorInfo::new(message))
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.digest.is_empty() {
            write!(f, "{}", self.info)
        } else {
            write!(f, "{} (digest: {})", self.info, self.digest)
        }
    }
}

impl From<&FlightError> for ErrorDescriptor {
    fn from(err: &FlightError) -> Self {
        match err {
            FlightError::Rejected(descriptor) => descriptor.clone(),
            other => ErrorDescriptor::local(other.to_string()),
        }
    }
}
