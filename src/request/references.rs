use crate::deferred::Deferred;
use crate::graph::NodeId;
use crate::source::StreamHandle;
use std::collections::HashMap;

/// Identity to wire reference, for everything a request has already written.
///
/// Nodes map to the full token (`$1f` or a path such as `$1f:items:0`).
/// Deferreds and stream handles are kept alive here so their pointer identity
/// cannot be reused while the request runs.
#[derive(Debug, Default)]
pub struct ReferenceTable {
    nodes: HashMap<NodeId, String>,
    deferreds: HashMap<usize, (Deferred, String)>,
    streams: HashMap<usize, (StreamHandle, String)>,
    symbols: HashMap<String, u32>,
    clients: HashMap<String, u32>,
    servers: HashMap<String, u32>,
}

impl ReferenceTable {
    /// The reference of a node, if it was written.
    pub fn node(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(String::as_str)
    }

    /// Records the row that defines a node, replacing any path alias.
    pub fn define_node(&mut self, id: NodeId, reference: String) {
        self.nodes.insert(id, reference);
    }

    /// Records a path alias; the first path discovered wins.
    pub fn alias_node(&mut self, id: NodeId, reference: String) {
        self.nodes.entry(id).or_insert(reference);
    }

    /// The reference of a deferred value, if it was written.
    pub fn deferred(&self, deferred: &Deferred) -> Option<&str> {
        self.deferreds
            .get(&deferred.identity())
            .map(|(_, reference)| reference.as_str())
    }

    /// Records a deferred value.
    pub fn record_deferred(&mut self, deferred: &Deferred, reference: String) {
        self.deferreds
            .insert(deferred.identity(), (deferred.clone(), reference));
    }

    /// The reference of a stream, if it was opened.
    pub fn stream(&self, stream: &StreamHandle) -> Option<&str> {
        self.streams
            .get(&stream.identity())
            .map(|(_, reference)| reference.as_str())
    }

    /// Records a stream.
    pub fn record_stream(&mut self, stream: &StreamHandle, reference: String) {
        self.streams
            .insert(stream.identity(), (stream.clone(), reference));
    }

    /// The row id of a symbol.
    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    /// Records a symbol row.
    pub fn record_symbol(&mut self, name: &str, id: u32) {
        self.symbols.insert(name.to_string(), id);
    }

    /// The row id of a client reference's import.
    pub fn client(&self, key: &str) -> Option<u32> {
        self.clients.get(key).copied()
    }

    /// Records an import row.
    pub fn record_client(&mut self, key: String, id: u32) {
        self.clients.insert(key, id);
    }

    /// The row id of a server reference's metadata.
    pub fn server(&self, id: &str) -> Option<u32> {
        self.servers.get(id).copied()
    }

    /// Records a server reference row.
    pub fn record_server(&mut self, key: &str, id: u32) {
        self.servers.insert(key.to_string(), id);
    }

    /// Number of recorded identities.
    pub fn len(&self) -> usize {
        self.nodes.len()
            + self.deferreds.len()
            + self.streams.len()
            + self.symbols.len()
            + self.clients.len()
            + self.servers.len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
