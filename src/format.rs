//! Defines the wire layout of a flight stream.
//!
//! # Row Grammar
//! A stream is a sequence of rows. Every row starts with a hexadecimal id and a
//! colon, followed by an optional one-byte tag:
//!
//! ```text
//! <hex-id>:<json>\n                  model row (no tag)
//! <hex-id>:<tag><json>\n             tagged text row (I, E, H, C, D, ...)
//! <hex-id>:<tag><hex-len>,<bytes>    length-prefixed row (T and the binary tags)
//! ```
//!
//! Hint rows carry an empty id (`:H<code><json>`). Length-prefixed rows have no
//! trailing newline; the length counts bytes, not characters.
//!
//! # Reference Tokens
//! Inside JSON payloads, strings that start with `$` are tokens (see [`Token`]).
//! Plain strings starting with `$` are escaped by doubling it.

use crate::error::{FlightError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// The character that starts every reference token.
pub const REFERENCE_ESCAPE: char = '$';

/// Terminates every text row.
pub const ROW_TERMINATOR: u8 = b'\n';

/// Separates the row id from the tag and payload.
pub const ID_SEPARATOR: u8 = b':';

/// Ends the hexadecimal length of a length-prefixed row.
pub const LENGTH_SEPARATOR: u8 = b',';

/// Tag of a length-prefixed UTF-8 text row.
pub const TEXT_TAG: u8 = b'T';

/// Largest integer a double represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// The element kind of a binary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Untyped bytes (`A`).
    ArrayBuffer,
    /// `O`
    Int8,
    /// `o`
    Uint8,
    /// `U`
    Uint8Clamped,
    /// `S`
    Int16,
    /// `s`
    Uint16,
    /// `L`
    Int32,
    /// `l`
    Uint32,
    /// `G`
    Float32,
    /// `g`
    Float64,
    /// `M`
    BigInt64,
    /// `m`
    BigUint64,
    /// Untyped view (`V`).
    DataView,
}

impl ArrayKind {
    /// Every kind, in tag order.
    pub const ALL: [ArrayKind; 13] = [
        ArrayKind::ArrayBuffer,
        ArrayKind::Int8,
        ArrayKind::Uint8,
        ArrayKind::Uint8Clamped,
        ArrayKind::Int16,
        ArrayKind::Uint16,
        ArrayKind::Int32,
        ArrayKind::Uint32,
        ArrayKind::Float32,
        ArrayKind::Float64,
        ArrayKind::BigInt64,
        ArrayKind::BigUint64,
        ArrayKind::DataView,
    ];

    /// The row tag.
    pub fn tag(self) -> u8 {
        match self {
            ArrayKind::ArrayBuffer => b'A',
            ArrayKind::Int8 => b'O',
            ArrayKind::Uint8 => b'o',
            ArrayKind::Uint8Clamped => b'U',
            ArrayKind::Int16 => b'S',
            ArrayKind::Uint16 => b's',
            ArrayKind::Int32 => b'L',
            ArrayKind::Uint32 => b'l',
            ArrayKind::Float32 => b'G',
            ArrayKind::Float64 => b'g',
            ArrayKind::BigInt64 => b'M',
            ArrayKind::BigUint64 => b'm',
            ArrayKind::DataView => b'V',
        }
    }

    /// Looks a kind up by its row tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            ArrayKind::ArrayBuffer
            | ArrayKind::Int8
            | ArrayKind::Uint8
            | ArrayKind::Uint8Clamped
            | ArrayKind::DataView => 1,
            ArrayKind::Int16 | ArrayKind::Uint16 => 2,
            ArrayKind::Int32 | ArrayKind::Uint32 | ArrayKind::Float32 => 4,
            ArrayKind::Float64 | ArrayKind::BigInt64 | ArrayKind::BigUint64 => 8,
        }
    }

    /// The JavaScript-facing type name, used in reports.
    pub fn name(self) -> &'static str {
        match self {
            ArrayKind::ArrayBuffer => "ArrayBuffer",
            ArrayKind::Int8 => "Int8Array",
            ArrayKind::Uint8 => "Uint8Array",
            ArrayKind::Uint8Clamped => "Uint8ClampedArray",
            ArrayKind::Int16 => "Int16Array",
            ArrayKind::Uint16 => "Uint16Array",
            ArrayKind::Int32 => "Int32Array",
            ArrayKind::Uint32 => "Uint32Array",
            ArrayKind::Float32 => "Float32Array",
            ArrayKind::Float64 => "Float64Array",
            ArrayKind::BigInt64 => "BigInt64Array",
            ArrayKind::BigUint64 => "BigUint64Array",
            ArrayKind::DataView => "DataView",
        }
    }
}

/// The flavor of a streamed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// A readable stream of arbitrary values (`R`).
    Readable,
    /// A readable byte stream (`r`).
    Bytes,
    /// An async iterable, may be iterated more than once on the consumer (`X`).
    AsyncIterable,
    /// A one-shot async iterator (`x`).
    Iterator,
}

impl StreamKind {
    /// The tag of the row that opens the stream.
    pub fn tag(self) -> u8 {
        match self {
            StreamKind::Readable => b'R',
            StreamKind::Bytes => b'r',
            StreamKind::AsyncIterable => b'X',
            StreamKind::Iterator => b'x',
        }
    }

    /// Looks a kind up by its opening tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'R' => Some(StreamKind::Readable),
            b'r' => Some(StreamKind::Bytes),
            b'X' => Some(StreamKind::AsyncIterable),
            b'x' => Some(StreamKind::Iterator),
            _ => None,
        }
    }
}

/// The decoded meaning of a row tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTag {
    /// No tag: the payload is a JSON model.
    Model,
    /// `I`: client reference metadata.
    Import,
    /// `H`: a hint for the consumer's host.
    Hint,
    /// `E`: an error descriptor.
    Error,
    /// `T`: length-prefixed text.
    Text,
    /// One of the binary tags.
    Binary(ArrayKind),
    /// `R`, `r`, `X` or `x`: opens a stream.
    StreamOpen(StreamKind),
    /// `C`: closes a stream.
    Close,
    /// `D`: debug info attached to a chunk.
    DebugInfo,
    /// `N`: time origin.
    Timing,
    /// `J`: I/O debug info.
    IoInfo,
    /// `W`: a replayed console entry.
    ConsoleLog,
    /// Any other tag byte.
    Unknown(u8),
}

impl RowTag {
    /// Interprets a tag byte; `0` stands for "no tag".
    pub fn from_byte(tag: u8) -> Self {
        if tag == 0 {
            return RowTag::Model;
        }
        if tag == TEXT_TAG {
            return RowTag::Text;
        }
        if let Some(kind) = ArrayKind::from_tag(tag) {
            return RowTag::Binary(kind);
        }
        if let Some(kind) = StreamKind::from_tag(tag) {
            return RowTag::StreamOpen(kind);
        }
        match tag {
            b'I' => RowTag::Import,
            b'H' => RowTag::Hint,
            b'E' => RowTag::Error,
            b'C' => RowTag::Close,
            b'D' => RowTag::DebugInfo,
            b'N' => RowTag::Timing,
            b'J' => RowTag::IoInfo,
            b'W' => RowTag::ConsoleLog,
            other => RowTag::Unknown(other),
        }
    }

    /// The tag byte, `0` for model rows.
    pub fn byte(self) -> u8 {
        match self {
            RowTag::Model => 0,
            RowTag::Import => b'I',
            RowTag::Hint => b'H',
            RowTag::Error => b'E',
            RowTag::Text => TEXT_TAG,
            RowTag::Binary(kind) => kind.tag(),
            RowTag::StreamOpen(kind) => kind.tag(),
            RowTag::Close => b'C',
            RowTag::DebugInfo => b'D',
            RowTag::Timing => b'N',
            RowTag::IoInfo => b'J',
            RowTag::ConsoleLog => b'W',
            RowTag::Unknown(tag) => tag,
        }
    }

    /// Whether rows with this tag byte carry a hex length instead of a newline.
    pub fn is_length_prefixed(tag: u8) -> bool {
        tag == TEXT_TAG || ArrayKind::from_tag(tag).is_some()
    }

    /// Whether a byte following the id separator is a text-row tag.
    ///
    /// Checked after [`RowTag::is_length_prefixed`]. Any other byte is the first
    /// byte of a model row's JSON.
    pub fn is_text_tag(tag: u8) -> bool {
        tag.is_ascii_uppercase() || tag == b'#' || tag == b'r' || tag == b'x'
    }
}

// --- ROW BUILDERS ---

fn row_with_prefix(id: u32, tag: Option<u8>, capacity: usize) -> BytesMut {
    let prefix = format!("{id:x}:");
    let mut row = BytesMut::with_capacity(prefix.len() + capacity + 2);
    row.put_slice(prefix.as_bytes());
    if let Some(tag) = tag {
        row.put_u8(tag);
    }
    row
}

/// `<id>:<json>\n`
pub fn model_row(id: u32, json: &str) -> Bytes {
    let mut row = row_with_prefix(id, None, json.len());
    row.put_slice(json.as_bytes());
    row.put_u8(ROW_TERMINATOR);
    row.freeze()
}

/// `<id>:<tag><json>\n`
pub fn tagged_row(id: u32, tag: u8, json: &str) -> Bytes {
    let mut row = row_with_prefix(id, Some(tag), json.len());
    row.put_slice(json.as_bytes());
    row.put_u8(ROW_TERMINATOR);
    row.freeze()
}

/// `<id>:<tag>\n`, used to open and close streams.
pub fn empty_tagged_row(id: u32, tag: u8) -> Bytes {
    tagged_row(id, tag, "")
}

/// `:H<code><json>\n`
pub fn hint_row(code: char, json: &str) -> Bytes {
    let mut row = BytesMut::with_capacity(json.len() + 4 + code.len_utf8());
    row.put_u8(ID_SEPARATOR);
    row.put_u8(b'H');
    let mut buf = [0u8; 4];
    row.put_slice(code.encode_utf8(&mut buf).as_bytes());
    row.put_slice(json.as_bytes());
    row.put_u8(ROW_TERMINATOR);
    row.freeze()
}

/// `<id>:<tag><hex-len>,<bytes>`
pub fn binary_row(id: u32, tag: u8, payload: &[u8]) -> Bytes {
    let length = format!("{:x},", payload.len());
    let mut row = row_with_prefix(id, Some(tag), length.len() + payload.len());
    row.put_slice(length.as_bytes());
    row.put_slice(payload);
    row.freeze()
}

/// `<id>:T<hex-len>,<utf8>`
pub fn text_row(id: u32, text: &str) -> Bytes {
    binary_row(id, TEXT_TAG, text.as_bytes())
}

/// A model row whose whole payload is one reference token, e.g. `<id>:"$<fatal>"`.
pub fn reference_row(id: u32, reference: &str) -> Result<Bytes> {
    let json = serde_json::to_string(reference)?;
    Ok(model_row(id, &json))
}

// --- TOKEN BUILDERS ---

/// `$<hex>`
pub fn by_value_id(id: u32) -> String {
    format!("${id:x}")
}

/// `$@<hex>`
pub fn promise_id(id: u32) -> String {
    format!("$@{id:x}")
}

/// `$Y<hex>`
pub fn diagnostic_id(id: u32) -> String {
    format!("$Y{id:x}")
}

/// Prefixes a token letter to an outlined id, e.g. `$Q1f`.
pub fn outlined_id(prefix: char, id: u32) -> String {
    format!("${prefix}{id:x}")
}

/// Encodes a number, mapping the values JSON cannot carry to tokens.
///
/// Integral values in the safe range are written without a fraction.
pub fn serialize_number(n: f64) -> serde_json::Value {
    use serde_json::Value as Json;
    if n.is_nan() {
        return Json::String("$NaN".into());
    }
    if n.is_infinite() {
        let token = if n > 0.0 { "$Infinity" } else { "$-Infinity" };
        return Json::String(token.into());
    }
    if n == 0.0 && n.is_sign_negative() {
        return Json::String("$-0".into());
    }
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Json::Number(serde_json::Number::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

/// Escapes a plain string so it cannot be mistaken for a token.
pub fn escape_string(s: &str) -> Cow<'_, str> {
    if s.starts_with(REFERENCE_ESCAPE) {
        Cow::Owned(format!("{REFERENCE_ESCAPE}{s}"))
    } else {
        Cow::Borrowed(s)
    }
}

/// Escapes every string inside a JSON document.
///
/// Used for structured payloads (error and server reference metadata) that are
/// written as model rows without going through the value renderer.
pub fn escape_json(json: serde_json::Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match json {
        Json::String(s) if s.starts_with(REFERENCE_ESCAPE) => {
            Json::String(format!("{REFERENCE_ESCAPE}{s}"))
        }
        Json::Array(items) => Json::Array(items.into_iter().map(escape_json).collect()),
        Json::Object(fields) => Json::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, escape_json(v)))
                .collect(),
        ),
        other => other,
    }
}

// --- TOKEN PARSING ---

/// An id plus the path walked from the value of that id, as in `$1f:items:0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlinedRef {
    /// The referenced row id.
    pub id: u32,
    /// Keys to follow from the referenced value.
    pub path: Vec<String>,
}

impl OutlinedRef {
    fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split(':');
        let id = parse_hex_id(parts.next().unwrap_or_default())?;
        Ok(Self {
            id,
            path: parts.map(str::to_string).collect(),
        })
    }
}

/// The meaning of a string found inside a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    /// A plain string (already unescaped).
    Literal(&'a str),
    /// `$@<hex>`: a promise for the chunk.
    Promise(u32),
    /// `$L<hex>`: a lazily initialized reference.
    Lazy(OutlinedRef),
    /// `$<hex>[:path]`
    Reference(OutlinedRef),
    /// `$Q<hex>`: a map built from the entries array.
    Map(OutlinedRef),
    /// `$W<hex>`: a set built from the members array.
    Set(OutlinedRef),
    /// `$Z<hex>`: an error value built from the descriptor.
    Error(OutlinedRef),
    /// `$F<hex>`: a server reference built from `{id, bound}`.
    Server(OutlinedRef),
    /// `$i<hex>`: an iterator over the array.
    Iterator(OutlinedRef),
    /// `$T<key>`
    Temporary(&'a str),
    /// `$S<name>`
    Symbol(&'a str),
    /// `$D<iso>`
    Date(&'a str),
    /// `$n<digits>`
    BigInt(i128),
    /// `$undefined`
    Undefined,
    /// `$Infinity`
    Infinity,
    /// `$-Infinity`
    NegInfinity,
    /// `$-0`
    NegZero,
    /// `$NaN`
    NaN,
    /// `$Y[<hex>]`: a diagnostic object, retained on the producer when an id is present.
    Diagnostic(Option<u32>),
}

/// Classifies a string from a model payload.
pub fn parse_token(s: &str) -> Result<Token<'_>> {
    let Some(rest) = s.strip_prefix(REFERENCE_ESCAPE) else {
        return Ok(Token::Literal(s));
    };
    let mut chars = rest.chars();
    let Some(marker) = chars.next() else {
        return Err(FlightError::Unsupported("bare '$' token".into()));
    };
    let body = chars.as_str();
    Ok(match marker {
        '$' => Token::Literal(rest),
        '@' => Token::Promise(parse_hex_id(body)?),
        'L' => Token::Lazy(OutlinedRef::parse(body)?),
        'Q' => Token::Map(OutlinedRef::parse(body)?),
        'W' => Token::Set(OutlinedRef::parse(body)?),
        'Z' => Token::Error(OutlinedRef::parse(body)?),
        'F' => Token::Server(OutlinedRef::parse(body)?),
        'i' => Token::Iterator(OutlinedRef::parse(body)?),
        'T' => Token::Temporary(body),
        'S' => Token::Symbol(body),
        'D' => Token::Date(body),
        'n' => Token::BigInt(
            body.parse::<i128>()
                .map_err(|e| FlightError::Format(format!("bad bigint '{body}': {e}")))?,
        ),
        'u' => Token::Undefined,
        'I' => Token::Infinity,
        'N' => Token::NaN,
        '-' if body == "0" => Token::NegZero,
        '-' if body == "Infinity" => Token::NegInfinity,
        'Y' if body.is_empty() => Token::Diagnostic(None),
        'Y' => Token::Diagnostic(Some(parse_hex_id(body)?)),
        c if c.is_ascii_digit() || ('a'..='f').contains(&c) => {
            Token::Reference(OutlinedRef::parse(rest)?)
        }
        other => {
            return Err(FlightError::Unsupported(format!(
                "unknown reference token '${other}'"
            )));
        }
    })
}

/// Parses a row id written in lowercase or uppercase hex.
pub fn parse_hex_id(text: &str) -> Result<u32> {
    u32::from_str_radix(text, 16)
        .map_err(|e| FlightError::Format(format!("bad row id '{text}': {e}")))
}
