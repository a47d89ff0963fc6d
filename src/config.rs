//! Tunables for requests and responses.
//!
//! Both option structs deserialize with defaults for missing fields, so a host
//! can keep them in its own configuration file:
//!
//! ```rust
//! use flightwire::RequestOptions;
//!
//! let options: RequestOptions =
//!     serde_json::from_str(r#"{ "max_row_size": 512, "environment_name": "Edge" }"#).unwrap();
//! assert_eq!(options.max_row_size, 512);
//! assert_eq!(options.large_string_threshold, 1024);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rendered characters a row may accumulate before remaining containers are
/// deferred into their own rows.
pub const DEFAULT_MAX_ROW_SIZE: usize = 3200;

/// Strings at least this long are outlined into a text row.
pub const DEFAULT_LARGE_STRING_THRESHOLD: usize = 1024;

/// Container nesting a single row may reach before the rest is deferred.
pub const DEFAULT_MAX_INLINE_DEPTH: usize = 64;

/// Encoder options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Size budget of one row, in rendered characters.
    pub max_row_size: usize,
    /// Length from which strings get their own `T` row.
    pub large_string_threshold: usize,
    /// Nesting depth from which containers get their own row.
    pub max_inline_depth: usize,
    /// Delay between `abort` and the fatal-reference rows of aborted tasks.
    #[serde(with = "millis")]
    pub abort_grace: Duration,
    /// Stamped on every error row as `env`.
    pub environment_name: String,
    /// Whether diagnostic objects are retained for the debug channel.
    pub keep_diagnostics: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_row_size: DEFAULT_MAX_ROW_SIZE,
            large_string_threshold: DEFAULT_LARGE_STRING_THRESHOLD,
            max_inline_depth: DEFAULT_MAX_INLINE_DEPTH,
            abort_grace: Duration::ZERO,
            environment_name: "Server".to_string(),
            keep_diagnostics: false,
        }
    }
}

/// Decoder options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseOptions {
    /// Largest length-prefixed row accepted, in bytes.
    pub max_row_length: usize,
    /// Message used to reject outstanding chunks on `close`.
    pub closed_message: String,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            max_row_length: 256 * 1024 * 1024,
            closed_message: "Connection closed.".to_string(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
