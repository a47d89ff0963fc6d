//! The auxiliary diagnostic channel.
//!
//! Values handed to [`Request::defer_diagnostic`] are retained under an id of
//! their own and referenced as `$Y<hex>`. The consumer inspects them lazily by
//! sending commands back over its debug connection:
//!
//! | Command         | Effect                                                  |
//! |-----------------|---------------------------------------------------------|
//! | `R:<hex>,...`   | Release the retained values.                            |
//! | `Q:<hex>,...`   | Write the values as debug model rows.                   |
//! | `P:<hex>,...`   | Write the settled value of retained deferreds.          |
//! | *(empty)*       | Close the channel and release everything.               |
//!
//! Debug rows are written in the diagnostic queue. They never hold the primary
//! channel open once the channel is closed.

use super::{Request, RequestStatus};
use crate::deferred::Settled;
use crate::error::{ErrorDescriptor, FlightError, Result};
use crate::flush::Priority;
use crate::format;
use crate::graph::{Node, NodeId, Value};
use crate::io::Sink;
use crate::request::default_digest;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Containers rendered per materialized value before the rest is retained.
const DEBUG_OBJECT_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Identity {
    Node(NodeId),
    Deferred(usize),
}

impl Identity {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Node(id) => Some(Self::Node(*id)),
            Value::Deferred(deferred) => Some(Self::Deferred(deferred.identity())),
            _ => None,
        }
    }
}

/// Values retained for the consumer's inspection.
#[derive(Debug, Default)]
pub(super) struct Diagnostics {
    retained: BTreeMap<u32, Value>,
    ids: HashMap<Identity, u32>,
    awaiting: BTreeSet<u32>,
    closed: bool,
}

impl Diagnostics {
    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    fn release(&mut self, id: u32) {
        if self.retained.remove(&id).is_some() {
            self.ids.retain(|_, retained| *retained != id);
        }
        self.awaiting.remove(&id);
    }

    fn clear(&mut self) {
        self.retained.clear();
        self.ids.clear();
        self.awaiting.clear();
    }
}

/// Per-materialization budget and the containers on the current path.
struct DebugWalk {
    budget: usize,
    path: Vec<NodeId>,
}

impl Request {
    /// Attaches the diagnostic sink. Debug rows go there from now on.
    pub fn start_flowing_debug(&mut self, sink: impl Sink + 'static) {
        if self.status == RequestStatus::Closed {
            tracing::warn!("debug sink attached to a closed request");
            return;
        }
        self.flow.attach_debug(Box::new(sink));
        self.flush();
    }

    /// Retains `value` for inspection and returns its `$Y<hex>` token.
    ///
    /// Returns a bare `$Y` when diagnostics are disabled or the channel was
    /// closed. Retaining the same node or deferred twice yields the same id.
    pub fn defer_diagnostic(&mut self, value: Value) -> String {
        if !self.options.keep_diagnostics || self.diagnostics.closed {
            return "$Y".to_string();
        }
        self.retain_diagnostic(value)
    }

    fn retain_diagnostic(&mut self, value: Value) -> String {
        let identity = Identity::of(&value);
        if let Some(id) = identity.and_then(|identity| self.diagnostics.ids.get(&identity)) {
            return format::diagnostic_id(*id);
        }
        let id = self.allocate_id();
        if let Some(identity) = identity {
            self.diagnostics.ids.insert(identity, id);
        }
        self.diagnostics.retained.insert(id, value);
        tracing::trace!(id, "diagnostic value retained");
        format::diagnostic_id(id)
    }

    /// Writes a `D` row attaching debug info to row `id`.
    ///
    /// The value is rendered with the debug renderer: containers past the
    /// per-row budget are retained and written as `$Y<hex>`.
    pub fn emit_debug_info(&mut self, id: u32, info: Value) -> Result<()> {
        if self.status == RequestStatus::Closed {
            return Err(FlightError::Render(
                "debug info emitted after the request closed".into(),
            ));
        }
        let json = self.render_debug_root(&info)?;
        self.queues.push(
            Priority::Diagnostic,
            format::tagged_row(id, b'D', &serde_json::to_string(&json)?),
        );
        self.flush();
        Ok(())
    }

    /// Handles one command received on the debug connection.
    pub fn resolve_debug_message(&mut self, message: &str) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            self.close_debug_channel();
            return Ok(());
        }
        let (command, ids) = message.split_once(':').ok_or_else(|| {
            FlightError::Format(format!("debug command '{message}' has no id list"))
        })?;
        let ids = ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(format::parse_hex_id)
            .collect::<Result<Vec<_>>>()?;

        match command {
            "R" => {
                for id in ids {
                    self.diagnostics.release(id);
                }
            }
            "Q" => {
                for id in ids {
                    self.materialize_diagnostic(id)?;
                }
            }
            "P" => {
                for id in ids {
                    self.await_diagnostic(id)?;
                }
            }
            other => {
                return Err(FlightError::Unsupported(format!(
                    "unknown debug command '{other}'"
                )));
            }
        }
        self.flush();
        Ok(())
    }

    /// Releases every retained value and stops retaining new ones.
    pub fn close_debug_channel(&mut self) {
        if self.diagnostics.closed {
            return;
        }
        tracing::debug!(
            retained = self.diagnostics.retained.len(),
            "debug channel closed"
        );
        self.diagnostics.clear();
        self.diagnostics.closed = true;
        self.flush();
    }

    fn materialize_diagnostic(&mut self, id: u32) -> Result<()> {
        let Some(value) = self.diagnostics.retained.get(&id).cloned() else {
            tracing::warn!(id, "materialize request for a value that is not retained");
            return Ok(());
        };
        if let Value::Deferred(_) = value {
            return self.await_diagnostic(id);
        }
        let json = self.render_debug_root(&value)?;
        self.queues.push(
            Priority::Diagnostic,
            format::model_row(id, &serde_json::to_string(&json)?),
        );
        Ok(())
    }

    fn await_diagnostic(&mut self, id: u32) -> Result<()> {
        match self.diagnostics.retained.get(&id) {
            Some(Value::Deferred(deferred)) => {
                let deferred = deferred.clone();
                if self.diagnostics.awaiting.insert(id) && deferred.is_pending() {
                    let pings = self.pings.clone();
                    deferred.subscribe(move || pings.nudge());
                }
                self.poll_diagnostic_deferreds()
            }
            Some(_) => self.materialize_diagnostic(id),
            None => {
                tracing::warn!(id, "await request for a value that is not retained");
                Ok(())
            }
        }
    }

    /// Writes the rows of awaited deferreds that have settled since the last
    /// pass.
    pub(super) fn poll_diagnostic_deferreds(&mut self) -> Result<()> {
        let awaiting: Vec<u32> = self.diagnostics.awaiting.iter().copied().collect();
        for id in awaiting {
            let Some(Value::Deferred(deferred)) = self.diagnostics.retained.get(&id) else {
                self.diagnostics.awaiting.remove(&id);
                continue;
            };
            let row = match deferred.state() {
                Settled::Pending => continue,
                Settled::Fulfilled(value) => {
                    let json = self.render_debug_root(&value)?;
                    format::model_row(id, &serde_json::to_string(&json)?)
                }
                Settled::Rejected(error) => {
                    let digest = default_digest(&error);
                    let json = serde_json::to_string(&ErrorDescriptor::new(digest, error))?;
                    format::tagged_row(id, b'E', &json)
                }
            };
            self.diagnostics.awaiting.remove(&id);
            self.queues.push(Priority::Diagnostic, row);
        }
        Ok(())
    }

    // --- DEBUG RENDERING ---

    fn render_debug_root(&mut self, value: &Value) -> Result<Json> {
        let mut walk = DebugWalk {
            budget: DEBUG_OBJECT_LIMIT,
            path: Vec::new(),
        };
        self.render_debug(&mut walk, value)
    }

    /// Renders a value for the debug channel.
    ///
    /// Shares no identity with the primary channel: every container is
    /// written afresh, and the ones past the budget or on a cycle are retained
    /// instead.
    fn render_debug(&mut self, walk: &mut DebugWalk, value: &Value) -> Result<Json> {
        Ok(match value {
            Value::Undefined => Json::String("$undefined".into()),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => format::serialize_number(*n),
            Value::BigInt(n) => Json::String(format!("$n{n}")),
            Value::String(s) => Json::String(format::escape_string(s).into_owned()),
            Value::Date(iso) => Json::String(format!("$D{iso}")),
            Value::Symbol(name) => Json::String(format!("$S{name}")),
            Value::Temporary(key) => Json::String(format!("$T{key}")),
            Value::Bytes(array) => {
                let id = self.allocate_id();
                self.queues.push(
                    Priority::Diagnostic,
                    format::binary_row(id, array.kind().tag(), array.bytes()),
                );
                Json::String(format::by_value_id(id))
            }
            Value::Error(info) => {
                let id = self.allocate_id();
                let mut info = info.clone();
                if info.env.is_none() {
                    info.env = Some(self.options.environment_name.clone());
                }
                let json = format::escape_json(serde_json::to_value(&info)?);
                self.queues.push(
                    Priority::Diagnostic,
                    format::model_row(id, &serde_json::to_string(&json)?),
                );
                Json::String(format::outlined_id('Z', id))
            }
            Value::Client(reference) => {
                let id = self.allocate_id();
                let metadata = serde_json::to_string(&self.config.client_metadata(reference)?)?;
                self.queues
                    .push(Priority::Diagnostic, format::tagged_row(id, b'I', &metadata));
                Json::String(format::by_value_id(id))
            }
            Value::Server(reference) => {
                let bound = match &reference.bound {
                    Some(args) => Json::Array(
                        args.iter()
                            .map(|arg| self.render_debug(walk, arg))
                            .collect::<Result<_>>()?,
                    ),
                    None => Json::Null,
                };
                let metadata = serde_json::json!({
                    "id": format::escape_string(&reference.id),
                    "bound": bound,
                });
                let id = self.allocate_id();
                self.queues.push(
                    Priority::Diagnostic,
                    format::model_row(id, &serde_json::to_string(&metadata)?),
                );
                Json::String(format::outlined_id('F', id))
            }
            Value::Deferred(_) => Json::String(self.retain_diagnostic(value.clone())),
            Value::Stream(_) | Value::Chunk(_) => Json::String("$Y".into()),
            Value::Node(id) => self.render_debug_node(walk, *id)?,
        })
    }

    fn render_debug_node(&mut self, walk: &mut DebugWalk, id: NodeId) -> Result<Json> {
        if walk.budget == 0 || walk.path.contains(&id) {
            return Ok(Json::String(self.retain_diagnostic(Value::Node(id))));
        }
        let node = self
            .graph
            .get(id)
            .ok_or_else(|| FlightError::Render(format!("node {id} does not exist")))?;
        walk.budget -= 1;
        walk.path.push(id);
        let json = match node {
            Node::Array(items) => Json::Array(
                items
                    .iter()
                    .map(|item| self.render_debug(walk, item))
                    .collect::<Result<_>>()?,
            ),
            Node::Object(fields) => {
                let mut out = serde_json::Map::with_capacity(fields.len());
                for (field, item) in &fields {
                    out.insert(field.clone(), self.render_debug(walk, item)?);
                }
                Json::Object(out)
            }
            Node::Map(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    pairs.push(Json::Array(vec![
                        self.render_debug(walk, key)?,
                        self.render_debug(walk, value)?,
                    ]));
                }
                Json::String(self.debug_outline('Q', Json::Array(pairs))?)
            }
            Node::Set(members) => {
                let members = members
                    .iter()
                    .map(|member| self.render_debug(walk, member))
                    .collect::<Result<_>>()?;
                Json::String(self.debug_outline('W', Json::Array(members))?)
            }
            Node::Stream(_) => Json::String("$Y".into()),
        };
        walk.path.pop();
        Ok(json)
    }

    fn debug_outline(&mut self, prefix: char, json: Json) -> Result<String> {
        let id = self.allocate_id();
        self.queues.push(
            Priority::Diagnostic,
            format::model_row(id, &serde_json::to_string(&json)?),
        );
        Ok(format::outlined_id(prefix, id))
    }
}
