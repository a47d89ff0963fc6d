// src/inspector.rs

//! Tools for inspecting recorded streams and decoded graphs.
//! Useful for debugging row splitting and verifying round trips.

use crate::error::Result;
use crate::format::{self, RowTag, StreamKind, Token};
use crate::graph::{Graph, Node, NodeId, Value};
use crate::io::map_file;
use crate::response::{ParseEvent, RowParser};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

/// A structural report of a recorded stream.
#[derive(Debug, Serialize)]
pub struct DebugReport {
    /// Total size of the recording.
    pub total_bytes: u64,
    /// Rows that carry an id.
    pub row_count: usize,
    /// Hint rows.
    pub hint_count: usize,
    /// Framing errors, in stream order.
    pub malformed: Vec<String>,
    /// Rows reachable from the root row, as a tree.
    pub tree: Option<RowInfo>,
    /// Rows nothing reachable from the root references.
    pub detached: Vec<RowInfo>,
}

/// Metadata for a single row.
#[derive(Debug, Clone, Serialize)]
pub struct RowInfo {
    /// The row id.
    pub id: u32,
    /// Tag name ("Model", "Text", "Uint8Array", ...).
    pub kind: String,
    /// Payload size in bytes, excluding id, tag and terminator.
    pub payload_size: u64,
    /// Row ids this row's payload refers to.
    pub references: Vec<u32>,
    /// Whether this row was already listed higher up the tree.
    pub seen: bool,
    /// Referenced rows.
    pub children: Vec<RowInfo>,
}

#[derive(Debug)]
struct RowSummary {
    kind: String,
    payload_size: u64,
    references: Vec<u32>,
}

/// The flightwire inspector tool.
#[derive(Debug)]
pub struct FlightInspector;

impl FlightInspector {
    /// Analyzes a recorded stream.
    pub fn inspect(bytes: &[u8]) -> Result<DebugReport> {
        let mut parser = RowParser::new(usize::MAX);
        let mut events = Vec::new();
        parser.feed(bytes, &mut events);

        let mut rows: BTreeMap<u32, RowSummary> = BTreeMap::new();
        let mut hint_count = 0;
        let mut malformed = Vec::new();
        for event in events {
            match event {
                ParseEvent::Row(row) => match row.id {
                    None => hint_count += 1,
                    Some(id) => {
                        let summary = RowSummary {
                            kind: tag_name(RowTag::from_byte(row.tag)),
                            payload_size: row.payload.len() as u64,
                            references: payload_references(row.tag, &row.payload),
                        };
                        // Debug rows may share an id with the row they describe.
                        rows.entry(id).or_insert(summary);
                    }
                },
                ParseEvent::Malformed { id, reason } => match id {
                    Some(id) => malformed.push(format!("row {id:x}: {reason}")),
                    None => malformed.push(reason),
                },
            }
        }
        if !parser.is_idle() {
            malformed.push("stream ends inside a row".to_string());
        }

        let mut visited = HashSet::new();
        let tree = rows
            .contains_key(&0)
            .then(|| Self::inspect_row(0, &rows, &mut visited));
        let detached = rows
            .keys()
            .filter(|id| !visited.contains(*id))
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|id| Self::inspect_row(id, &rows, &mut visited))
            .collect();

        Ok(DebugReport {
            total_bytes: bytes.len() as u64,
            row_count: rows.len(),
            hint_count,
            malformed,
            tree,
            detached,
        })
    }

    /// Analyzes a recording on disk.
    pub fn inspect_file<P: AsRef<Path>>(path: P) -> Result<DebugReport> {
        let mmap = map_file(path)?;
        Self::inspect(&mmap)
    }

    fn inspect_row(
        id: u32,
        rows: &BTreeMap<u32, RowSummary>,
        visited: &mut HashSet<u32>,
    ) -> RowInfo {
        let seen = !visited.insert(id);
        let Some(summary) = rows.get(&id) else {
            return RowInfo {
                id,
                kind: "Missing".to_string(),
                payload_size: 0,
                references: Vec::new(),
                seen,
                children: Vec::new(),
            };
        };
        let children = if seen {
            Vec::new()
        } else {
            summary
                .references
                .iter()
                .map(|child| Self::inspect_row(*child, rows, visited))
                .collect()
        };
        RowInfo {
            id,
            kind: summary.kind.clone(),
            payload_size: summary.payload_size,
            references: summary.references.clone(),
            seen,
            children,
        }
    }
}

fn tag_name(tag: RowTag) -> String {
    match tag {
        RowTag::Model => "Model".to_string(),
        RowTag::Import => "Import".to_string(),
        RowTag::Hint => "Hint".to_string(),
        RowTag::Error => "Error".to_string(),
        RowTag::Text => "Text".to_string(),
        RowTag::Binary(kind) => kind.name().to_string(),
        RowTag::StreamOpen(StreamKind::Readable) => "ReadableStream".to_string(),
        RowTag::StreamOpen(StreamKind::Bytes) => "ByteStream".to_string(),
        RowTag::StreamOpen(StreamKind::AsyncIterable) => "AsyncIterable".to_string(),
        RowTag::StreamOpen(StreamKind::Iterator) => "AsyncIterator".to_string(),
        RowTag::Close => "Close".to_string(),
        RowTag::DebugInfo => "DebugInfo".to_string(),
        RowTag::Timing => "Timing".to_string(),
        RowTag::IoInfo => "IoInfo".to_string(),
        RowTag::ConsoleLog => "ConsoleLog".to_string(),
        RowTag::Unknown(byte) => format!("Unknown({})", char::from(byte)),
    }
}

/// Row ids referenced from a model payload, in order of first appearance.
fn payload_references(tag: u8, payload: &[u8]) -> Vec<u32> {
    if tag != 0 {
        return Vec::new();
    }
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    collect_references(&json, &mut found);
    found
}

fn collect_references(json: &serde_json::Value, found: &mut Vec<u32>) {
    match json {
        serde_json::Value::String(s) => {
            let id = match format::parse_token(s) {
                Ok(Token::Promise(id)) | Ok(Token::Diagnostic(Some(id))) => id,
                Ok(
                    Token::Reference(r)
                    | Token::Lazy(r)
                    | Token::Map(r)
                    | Token::Set(r)
                    | Token::Error(r)
                    | Token::Server(r)
                    | Token::Iterator(r),
                ) => r.id,
                _ => return,
            };
            if !found.contains(&id) {
                found.push(id);
            }
        }
        serde_json::Value::Array(items) => {
            items.iter().for_each(|item| collect_references(item, found))
        }
        serde_json::Value::Object(fields) => {
            fields.values().for_each(|item| collect_references(item, found))
        }
        _ => {}
    }
}

impl fmt::Display for DebugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FLIGHT INSPECTOR REPORT ===")?;
        writeln!(f, "Total Bytes:    {}", self.total_bytes)?;
        writeln!(f, "Rows:           {} (+{} hints)", self.row_count, self.hint_count)?;
        for problem in &self.malformed {
            writeln!(f, "Malformed:      {problem}")?;
        }
        writeln!(f, "\n[ROW GRAPH]")?;
        match &self.tree {
            Some(tree) => tree.fmt_recursive(f, "", true)?,
            None => writeln!(f, "(no root row)")?,
        }
        if !self.detached.is_empty() {
            writeln!(f, "\n[DETACHED]")?;
            for (i, row) in self.detached.iter().enumerate() {
                row.fmt_recursive(f, "", i == self.detached.len() - 1)?;
            }
        }
        Ok(())
    }
}

impl RowInfo {
    fn fmt_recursive(&self, f: &mut fmt::Formatter<'_>, prefix: &str, is_last: bool) -> fmt::Result {
        let connector = if is_last { "└── " } else { "├── " };
        let child_prefix = if is_last { "    " } else { "│   " };
        if self.seen {
            return writeln!(f, "{prefix}{connector}${:x} (see above)", self.id);
        }
        writeln!(
            f,
            "{}{}${:x} [{}] Size: {}b | Refs: {}",
            prefix,
            connector,
            self.id,
            self.kind,
            self.payload_size,
            self.references.len()
        )?;

        for (i, child) in self.children.iter().enumerate() {
            let is_last_child = i == self.children.len() - 1;
            child.fmt_recursive(f, &format!("{prefix}{child_prefix}"), is_last_child)?;
        }
        Ok(())
    }
}

// --- GRAPH SHAPES ---

/// A materialized, arena-free view of a value.
///
/// Two graphs with the same structure produce equal shapes regardless of the
/// node ids their arenas assigned. A node reached a second time is replaced by
/// a [`Shape::BackRef`] to the preorder index of its first visit, so shared
/// subgraphs and cycles compare structurally. Numbers compare by bit pattern,
/// with every NaN folded to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Shape {
    /// A leaf, rendered to a stable text form.
    Leaf(String),
    /// A number's bits.
    Number(u64),
    /// An array node.
    Array(Vec<Shape>),
    /// An object node.
    Object(Vec<(String, Shape)>),
    /// A map node.
    Map(Vec<(Shape, Shape)>),
    /// A set node.
    Set(Vec<Shape>),
    /// A stream node: its items, then whether it closed.
    Stream(Vec<Shape>, String),
    /// A node seen earlier in preorder.
    BackRef(usize),
}

impl Shape {
    /// Materializes `value` as read from `graph`.
    pub fn of(graph: &Graph, value: &Value) -> Shape {
        let mut seen = HashMap::new();
        Self::build(graph, value, &mut seen)
    }

    fn build(graph: &Graph, value: &Value, seen: &mut HashMap<NodeId, usize>) -> Shape {
        let id = match value {
            Value::Node(id) => *id,
            Value::Number(n) if n.is_nan() => return Shape::Number(f64::NAN.to_bits()),
            Value::Number(n) => return Shape::Number(n.to_bits()),
            other => return Shape::Leaf(leaf_text(other)),
        };
        if let Some(index) = seen.get(&id) {
            return Shape::BackRef(*index);
        }
        let index = seen.len();
        seen.insert(id, index);
        let Some(node) = graph.get(id) else {
            return Shape::Leaf(format!("dangling {id}"));
        };
        match node {
            Node::Array(items) => {
                Shape::Array(items.iter().map(|v| Self::build(graph, v, seen)).collect())
            }
            Node::Object(fields) => Shape::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::build(graph, v, seen)))
                    .collect(),
            ),
            Node::Map(entries) => Shape::Map(
                entries
                    .iter()
                    .map(|(k, v)| (Self::build(graph, k, seen), Self::build(graph, v, seen)))
                    .collect(),
            ),
            Node::Set(members) => {
                Shape::Set(members.iter().map(|v| Self::build(graph, v, seen)).collect())
            }
            Node::Stream(stream) => Shape::Stream(
                stream
                    .items
                    .iter()
                    .map(|item| Self::build(graph, &item.value, seen))
                    .collect(),
                format!("{:?}", stream.state),
            ),
        }
    }
}

fn leaf_text(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::BigInt(n) => format!("{n}n"),
        Value::String(s) => format!("{s:?}"),
        Value::Date(s) => format!("Date({s})"),
        Value::Symbol(s) => format!("Symbol({s})"),
        Value::Bytes(array) => format!("{}{:?}", array.kind().name(), array.bytes().as_ref()),
        Value::Error(info) => format!("{}: {}", info.name, info.message),
        Value::Temporary(key) => format!("Temporary({key})"),
        Value::Client(client) => format!("Client({})", client.key()),
        Value::Server(server) => format!("Server({})", server.id),
        Value::Chunk(id) => format!("Chunk({id:x})"),
        other => other.kind_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_follows_references() {
        let report =
            FlightInspector::inspect(b"1:T3,abc0:{\"a\":\"$1\",\"b\":\"$Q2\"}\n2:[\"$1\"]\n5:E{}\n")
                .unwrap();
        assert_eq!(report.row_count, 4);
        let tree = report.tree.as_ref().unwrap();
        assert_eq!(tree.references, vec![1, 2]);
        assert_eq!(tree.children[0].kind, "Text");
        assert!(tree.children[1].children[0].seen);
        assert_eq!(report.detached.len(), 1);
        assert_eq!(report.detached[0].id, 5);

        let text = report.to_string();
        assert!(text.contains("=== FLIGHT INSPECTOR REPORT ==="));
        assert!(text.contains("└── $0 [Model]"));
    }

    #[test]
    fn shapes_ignore_node_ids() {
        let a = Graph::new();
        a.array([Value::Null]);
        let left = a.array([Value::from(1)]);
        let b = Graph::new();
        let right = b.array([Value::from(1)]);
        assert_eq!(Shape::of(&a, &left), Shape::of(&b, &right));
    }

    #[test]
    fn cycles_become_back_references() {
        let graph = Graph::new();
        let root = graph.object([("self", Value::Null)]);
        let id = root.as_node().unwrap();
        graph.set_slot(id, 0, root.clone()).unwrap();
        assert_eq!(
            Shape::of(&graph, &root),
            Shape::Object(vec![("self".to_string(), Shape::BackRef(0))])
        );
    }
}
