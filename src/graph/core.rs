use super::id::NodeId;
use super::value::Value;
use crate::error::{ErrorDescriptor, FlightError, Result};
use crate::format::StreamKind;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A container stored in the [`Graph`] arena.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// An ordered list.
    Array(Vec<Value>),
    /// String-keyed fields in insertion order.
    Object(Vec<(String, Value)>),
    /// Key/value pairs with arbitrary keys, in insertion order.
    Map(Vec<(Value, Value)>),
    /// Unique members in insertion order.
    Set(Vec<Value>),
    /// A decoded stream (decoder side only).
    Stream(StreamNode),
}

impl Node {
    /// A short name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Array(_) => "array",
            Node::Object(_) => "object",
            Node::Map(_) => "map",
            Node::Set(_) => "set",
            Node::Stream(_) => "stream",
        }
    }

    /// Looks up a path step: an object key or an array/set index.
    pub fn step(&self, key: &str) -> Option<&Value> {
        match self {
            Node::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            Node::Array(items) | Node::Set(items) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            _ => None,
        }
    }

    /// The value slot at a positional index.
    ///
    /// Arrays and sets index their items, objects their fields in insertion
    /// order, maps interleave keys and values (`2i` key, `2i + 1` value),
    /// streams their buffered items.
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Value> {
        match self {
            Node::Array(items) | Node::Set(items) => items.get_mut(index),
            Node::Object(fields) => fields.get_mut(index).map(|(_, v)| v),
            Node::Map(entries) => entries
                .get_mut(index / 2)
                .map(|(k, v)| if index % 2 == 0 { k } else { v }),
            Node::Stream(stream) => stream.items.get_mut(index).map(|item| &mut item.value),
        }
    }
}

/// The buffered view of a decoded stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamNode {
    /// Which flavor of stream the producer opened.
    pub kind: StreamKind,
    /// Items in production order.
    pub items: Vec<StreamItem>,
    /// Open, closed or errored.
    pub state: StreamState,
    /// The value passed when the stream was closed, if any.
    pub final_value: Option<Value>,
}

impl StreamNode {
    /// An open, empty stream.
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
            state: StreamState::Open,
            final_value: None,
        }
    }

    /// The items whose references have all resolved, in order, up to the first
    /// one still waiting.
    pub fn ready_items(&self) -> impl Iterator<Item = &Value> {
        self.items
            .iter()
            .take_while(|item| item.ready)
            .map(|item| &item.value)
    }
}

/// One item of a decoded stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    /// The item; a placeholder until `ready`.
    pub value: Value,
    /// Whether every reference inside the item has resolved.
    pub ready: bool,
}

/// Lifecycle of a decoded stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    /// More items may follow.
    Open,
    /// The producer closed the stream.
    Closed,
    /// The producer (or the connection) failed the stream.
    Errored(ErrorDescriptor),
}

/// The arena that owns every container of a value graph.
///
/// The handle is cheap to clone; clones share the same arena. Producer code on
/// other threads may keep building nodes while a request renders the graph.
#[derive(Clone, Default)]
pub struct Graph {
    nodes: Arc<RwLock<Vec<Node>>>,
}

impl Graph {
    /// Creates a new, empty `Graph`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn alloc(&self, node: Node) -> NodeId {
        let mut nodes = self.nodes.write();
        let id = NodeId::new(nodes.len() as u32);
        nodes.push(node);
        id
    }

    /// Allocates an array and returns it as a value.
    pub fn array(&self, items: impl IntoIterator<Item = Value>) -> Value {
        Value::Node(self.alloc(Node::Array(items.into_iter().collect())))
    }

    /// Allocates an object and returns it as a value.
    pub fn object<K: Into<String>>(&self, fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Node(self.alloc(Node::Object(fields)))
    }

    /// Allocates a map and returns it as a value.
    pub fn map(&self, entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Node(self.alloc(Node::Map(entries.into_iter().collect())))
    }

    /// Allocates a set and returns it as a value.
    pub fn set(&self, members: impl IntoIterator<Item = Value>) -> Value {
        Value::Node(self.alloc(Node::Set(members.into_iter().collect())))
    }

    /// Returns a copy of the node.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.read().get(id.index()).cloned()
    }

    /// Runs `f` against the node without copying it.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.read().get(id.index()).map(f)
    }

    /// Runs `f` against a mutable node.
    pub fn update<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.write().get_mut(id.index()).map(f)
    }

    /// Appends to an array or set.
    pub fn push(&self, id: NodeId, value: Value) -> Result<()> {
        self.update(id, |node| match node {
            Node::Array(items) | Node::Set(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(FlightError::Internal(format!(
                "cannot push into {} node {id}",
                other.kind_name()
            ))),
        })
        .unwrap_or_else(|| Err(dangling(id)))
    }

    /// Sets an object field, replacing an existing key in place.
    pub fn insert(&self, id: NodeId, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        self.update(id, |node| match node {
            Node::Object(fields) => {
                match fields.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, slot)) => *slot = value,
                    None => fields.push((key, value)),
                }
                Ok(())
            }
            other => Err(FlightError::Internal(format!(
                "cannot insert a field into {} node {id}",
                other.kind_name()
            ))),
        })
        .unwrap_or_else(|| Err(dangling(id)))
    }

    /// Overwrites a positional slot (see [`Node::slot_mut`]).
    pub fn set_slot(&self, id: NodeId, index: usize, value: Value) -> Result<()> {
        self.update(id, |node| match node.slot_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(FlightError::Internal(format!(
                "slot {index} out of bounds for node {id}"
            ))),
        })
        .unwrap_or_else(|| Err(dangling(id)))
    }

    /// Follows one path step from a container value.
    pub fn field(&self, value: &Value, key: &str) -> Option<Value> {
        let id = value.as_node()?;
        self.with_node(id, |node| node.step(key).cloned()).flatten()
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns `true` if no node was ever allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles share one arena.
    pub fn same_arena(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }

    /// Converts a plain-data subgraph to JSON.
    ///
    /// Only arrays, objects, strings, numbers, booleans and null/undefined are
    /// accepted; anything else, or a cycle, is a `Format` error. Used to read
    /// back structured payloads such as error descriptors.
    pub fn to_json(&self, value: &Value) -> Result<serde_json::Value> {
        let mut on_path = HashSet::new();
        self.to_json_inner(value, &mut on_path)
    }

    fn to_json_inner(
        &self,
        value: &Value,
        on_path: &mut HashSet<NodeId>,
    ) -> Result<serde_json::Value> {
        use serde_json::Value as Json;
        Ok(match value {
            Value::Undefined | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => match crate::format::serialize_number(*n) {
                number @ Json::Number(_) => number,
                _ => Json::Null,
            },
            Value::String(s) => Json::String(s.clone()),
            Value::Node(id) => {
                if !on_path.insert(*id) {
                    return Err(FlightError::Format(format!(
                        "cycle through {id} in plain data"
                    )));
                }
                let node = self.get(*id).ok_or_else(|| dangling(*id))?;
                let json = match node {
                    Node::Array(items) => Json::Array(
                        items
                            .iter()
                            .map(|v| self.to_json_inner(v, on_path))
                            .collect::<Result<_>>()?,
                    ),
                    Node::Object(fields) => {
                        let mut map = serde_json::Map::new();
                        for (k, v) in &fields {
                            map.insert(k.clone(), self.to_json_inner(v, on_path)?);
                        }
                        Json::Object(map)
                    }
                    other => {
                        return Err(FlightError::Format(format!(
                            "{} node {id} is not plain data",
                            other.kind_name()
                        )));
                    }
                };
                on_path.remove(id);
                json
            }
            other => {
                return Err(FlightError::Format(format!(
                    "{} is not plain data",
                    other.kind_name()
                )));
            }
        })
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph").field("nodes", &self.len()).finish()
    }
}

fn dangling(id: NodeId) -> FlightError {
    FlightError::Internal(format!("node {id} does not exist"))
}
