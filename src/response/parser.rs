//! Incremental row parser.
//!
//! Bytes arrive in arbitrary chunks; the parser keeps its position between
//! calls and emits every row that completes. Rows may be split anywhere,
//! including inside a multi-byte UTF-8 sequence or a length prefix.

use crate::format::{ID_SEPARATOR, LENGTH_SEPARATOR, ROW_TERMINATOR, RowTag};
use bytes::{Bytes, BytesMut};

/// One complete row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// The row id; `None` for hint rows.
    pub id: Option<u32>,
    /// The tag byte, `0` for model rows.
    pub tag: u8,
    /// Everything after the tag (or after the length prefix).
    pub payload: Bytes,
}

/// What a call to [`RowParser::feed`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A complete row.
    Row(RawRow),
    /// A row that could not be framed; the parser skipped to the next newline.
    Malformed {
        /// The id, when it was read before the error.
        id: Option<u32>,
        /// What went wrong.
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Id,
    Tag,
    Length,
    Text,
    Binary { remaining: usize },
    /// Discarding bytes up to the next newline after a framing error.
    Skip,
}

/// The framing state machine.
#[derive(Debug)]
pub struct RowParser {
    state: State,
    id: Option<u32>,
    tag: u8,
    length: usize,
    buffer: BytesMut,
    max_row_length: usize,
}

impl RowParser {
    /// A parser that rejects length prefixes above `max_row_length`.
    pub fn new(max_row_length: usize) -> Self {
        Self {
            state: State::Id,
            id: None,
            tag: 0,
            length: 0,
            buffer: BytesMut::new(),
            max_row_length,
        }
    }

    /// Whether the parser sits between rows.
    pub fn is_idle(&self) -> bool {
        self.state == State::Id && self.id.is_none()
    }

    /// Consumes `chunk`, appending completed rows to `events`.
    pub fn feed(&mut self, chunk: &[u8], events: &mut Vec<ParseEvent>) {
        let mut i = 0;
        while i < chunk.len() {
            match self.state {
                State::Id => {
                    let byte = chunk[i];
                    i += 1;
                    match byte {
                        ID_SEPARATOR => self.state = State::Tag,
                        ROW_TERMINATOR => {
                            if self.id.is_some() {
                                self.malformed(events, "row ended inside its id");
                                self.reset();
                            }
                        }
                        _ => match (byte as char).to_digit(16) {
                            Some(digit) => {
                                let id = self.id.unwrap_or(0);
                                match id.checked_mul(16).and_then(|id| id.checked_add(digit)) {
                                    Some(id) => self.id = Some(id),
                                    None => self.malformed(events, "row id overflows 32 bits"),
                                }
                            }
                            None => self.malformed(
                                events,
                                format!("unexpected byte 0x{byte:02x} in row id"),
                            ),
                        },
                    }
                }
                State::Tag => {
                    let byte = chunk[i];
                    if RowTag::is_length_prefixed(byte) {
                        self.tag = byte;
                        self.length = 0;
                        self.state = State::Length;
                        i += 1;
                    } else if RowTag::is_text_tag(byte) {
                        self.tag = byte;
                        self.state = State::Text;
                        i += 1;
                    } else {
                        // A model row: the byte starts the JSON payload.
                        self.tag = 0;
                        self.state = State::Text;
                    }
                }
                State::Length => {
                    let byte = chunk[i];
                    i += 1;
                    if byte == LENGTH_SEPARATOR {
                        if self.length == 0 {
                            self.emit(events);
                        } else {
                            self.state = State::Binary {
                                remaining: self.length,
                            };
                        }
                        continue;
                    }
                    let Some(digit) = (byte as char).to_digit(16) else {
                        self.malformed(events, format!("unexpected byte 0x{byte:02x} in row length"));
                        continue;
                    };
                    self.length = self.length.saturating_mul(16).saturating_add(digit as usize);
                    if self.length > self.max_row_length {
                        let message = format!(
                            "row length {} exceeds the limit of {} bytes",
                            self.length, self.max_row_length
                        );
                        self.malformed(events, message);
                    }
                }
                State::Text => {
                    let rest = &chunk[i..];
                    match rest.iter().position(|b| *b == ROW_TERMINATOR) {
                        Some(end) => {
                            self.buffer.extend_from_slice(&rest[..end]);
                            i += end + 1;
                            self.emit(events);
                        }
                        None => {
                            self.buffer.extend_from_slice(rest);
                            i = chunk.len();
                        }
                    }
                }
                State::Binary { remaining } => {
                    let take = remaining.min(chunk.len() - i);
                    self.buffer.extend_from_slice(&chunk[i..i + take]);
                    i += take;
                    if take == remaining {
                        self.emit(events);
                    } else {
                        self.state = State::Binary {
                            remaining: remaining - take,
                        };
                    }
                }
                State::Skip => {
                    match chunk[i..].iter().position(|b| *b == ROW_TERMINATOR) {
                        Some(end) => {
                            i += end + 1;
                            self.reset();
                        }
                        None => i = chunk.len(),
                    }
                }
            }
        }
    }

    fn emit(&mut self, events: &mut Vec<ParseEvent>) {
        events.push(ParseEvent::Row(RawRow {
            id: self.id,
            tag: self.tag,
            payload: self.buffer.split().freeze(),
        }));
        self.reset();
    }

    fn malformed(&mut self, events: &mut Vec<ParseEvent>, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(id = ?self.id, %reason, "skipping malformed row");
        events.push(ParseEvent::Malformed {
            id: self.id,
            reason,
        });
        self.buffer.clear();
        self.state = State::Skip;
    }

    fn reset(&mut self) {
        self.state = State::Id;
        self.id = None;
        self.tag = 0;
        self.length = 0;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(parser: &mut RowParser, input: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        parser.feed(input, &mut events);
        events
    }

    fn row(id: Option<u32>, tag: u8, payload: &'static [u8]) -> ParseEvent {
        ParseEvent::Row(RawRow {
            id,
            tag,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn frames_model_tagged_and_binary_rows() {
        let mut parser = RowParser::new(1024);
        let events = rows(
            &mut parser,
            b"0:{\"a\":1}\n1f:E{}\n2:o3,\x01\x02\x03:HD\"x\"\n3:T0,",
        );
        assert_eq!(
            events,
            vec![
                row(Some(0), 0, b"{\"a\":1}"),
                row(Some(0x1f), b'E', b"{}"),
                row(Some(2), b'o', b"\x01\x02\x03"),
                row(None, b'H', b"D\"x\""),
                row(Some(3), b'T', b""),
            ]
        );
        assert!(parser.is_idle());
    }

    #[test]
    fn rows_survive_any_split() {
        let input = "0:[\"héllo\"]\n1:T6,héllo2:R\n".as_bytes();
        let mut whole = RowParser::new(1024);
        let expected = rows(&mut whole, input);
        assert_eq!(expected.len(), 3);

        for split in 0..input.len() {
            let mut parser = RowParser::new(1024);
            let mut events = rows(&mut parser, &input[..split]);
            events.extend(rows(&mut parser, &input[split..]));
            assert_eq!(events, expected, "split at {split}");
        }
    }

    #[test]
    fn model_rows_keep_their_first_byte() {
        let mut parser = RowParser::new(1024);
        assert_eq!(
            rows(&mut parser, b"4:null\n5:\"$@1\"\n"),
            vec![row(Some(4), 0, b"null"), row(Some(5), 0, b"\"$@1\"")]
        );
    }

    #[test]
    fn malformed_ids_skip_to_the_next_row() {
        let mut parser = RowParser::new(1024);
        let events = rows(&mut parser, b"zz:[]\n1:[]\n");
        assert!(matches!(events[0], ParseEvent::Malformed { id: None, .. }));
        assert_eq!(events[1], row(Some(1), 0, b"[]"));
    }

    #[test]
    fn oversized_rows_are_rejected() {
        let mut parser = RowParser::new(4);
        let events = rows(&mut parser, b"1:o10,\n2:[]\n");
        assert!(matches!(events[0], ParseEvent::Malformed { id: Some(1), .. }));
        assert_eq!(events[1], row(Some(2), 0, b"[]"));
    }
}
