use super::{Request, RequestStatus, Task};
use crate::deferred::{Deferred, Settled};
use crate::error::{FlightError, Result};
use crate::flush::Priority;
use crate::format;
use crate::graph::{ClientReference, Node, NodeId, ServerReference, TypedArray, Value};
use serde_json::Value as Json;

/// Per-row rendering state.
#[derive(Debug)]
pub(super) struct RenderContext {
    /// The task whose row is being rendered.
    pub task: u32,
    /// The node this row defines; exempt from back-referencing itself once.
    pub model_root: Option<NodeId>,
    /// Rendered characters so far.
    pub size: usize,
    /// Current container nesting.
    pub depth: usize,
    pub key_path: Option<String>,
    pub implicit_slot: bool,
}

impl RenderContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task: task.id,
            model_root: task.model.as_node(),
            size: 0,
            depth: 0,
            key_path: task.key_path.clone(),
            implicit_slot: task.implicit_slot,
        }
    }

    fn records_identity(&self) -> bool {
        self.key_path.is_none() && !self.implicit_slot
    }
}

impl Request {
    /// Renders one value into its JSON token.
    ///
    /// `parent` is the reference of the enclosing container (when it has one)
    /// and `key` the property or index under which `value` sits.
    pub(super) fn render_value(
        &mut self,
        cx: &mut RenderContext,
        parent: Option<&str>,
        key: &str,
        value: &Value,
    ) -> Result<Json> {
        Ok(match value {
            Value::Undefined => Json::String("$undefined".into()),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => {
                let json = format::serialize_number(*n);
                cx.size += json.to_string().len();
                json
            }
            Value::BigInt(n) => Json::String(format!("$n{n}")),
            Value::String(s) => self.render_string(cx, s),
            Value::Date(iso) => Json::String(format!("$D{iso}")),
            Value::Symbol(name) => Json::String(self.serialize_symbol(name)?),
            Value::Bytes(array) => Json::String(self.serialize_typed_array(array)),
            Value::Node(id) => self.render_node(cx, parent, key, *id)?,
            Value::Error(info) => Json::String(self.serialize_error_value(info.clone())?),
            Value::Temporary(key) => Json::String(format!("$T{key}")),
            Value::Client(reference) => Json::String(self.serialize_client_reference(reference)),
            Value::Server(reference) => Json::String(self.serialize_server_reference(reference)?),
            Value::Deferred(deferred) => Json::String(self.serialize_deferred(cx, deferred)),
            Value::Stream(handle) => Json::String(self.open_stream(handle)?),
            Value::Chunk(id) => {
                return Err(FlightError::Unsupported(format!(
                    "decoded chunk handle {id:x} cannot be encoded again"
                )));
            }
        })
    }

    fn render_string(&mut self, cx: &mut RenderContext, s: &str) -> Json {
        let chars = s.chars().count();
        cx.size += chars;
        if chars >= self.options.large_string_threshold {
            let id = self.allocate_id();
            self.queues.push(Priority::Regular, format::text_row(id, s));
            return Json::String(format::by_value_id(id));
        }
        Json::String(format::escape_string(s).into_owned())
    }

    fn render_node(
        &mut self,
        cx: &mut RenderContext,
        parent: Option<&str>,
        key: &str,
        id: NodeId,
    ) -> Result<Json> {
        match self.references.node(id) {
            Some(existing) if cx.model_root != Some(id) => {
                return Ok(Json::String(existing.to_string()));
            }
            Some(_) => cx.model_root = None,
            None if cx.records_identity() => match parent {
                Some(parent) if !key.contains(':') => {
                    self.references.alias_node(id, format!("{parent}:{key}"));
                }
                Some(_) => {}
                None => self
                    .references
                    .define_node(id, format::by_value_id(cx.task)),
            },
            None => {}
        }

        if cx.size > self.options.max_row_size || cx.depth >= self.options.max_inline_depth {
            return Ok(Json::String(self.defer_node(cx, id)));
        }

        let node = self
            .graph
            .get(id)
            .ok_or_else(|| FlightError::Render(format!("node {id} does not exist")))?;
        let own_ref = self.references.node(id).map(str::to_string);
        let own_ref = own_ref.as_deref();

        cx.depth += 1;
        let json = match node {
            Node::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    out.push(self.render_value(cx, own_ref, &index.to_string(), item)?);
                }
                Json::Array(out)
            }
            Node::Object(fields) => {
                let mut out = serde_json::Map::with_capacity(fields.len());
                for (field, item) in &fields {
                    cx.size += field.len();
                    let rendered = self.render_value(cx, own_ref, field, item)?;
                    out.insert(field.clone(), rendered);
                }
                Json::Object(out)
            }
            Node::Map(entries) => {
                let pairs: Vec<Value> = entries
                    .into_iter()
                    .map(|(k, v)| self.graph.array([k, v]))
                    .collect();
                let list = self.graph.array(pairs);
                Json::String(format::outlined_id('Q', self.outline_later(list)))
            }
            Node::Set(members) => {
                let list = self.graph.array(members);
                Json::String(format::outlined_id('W', self.outline_later(list)))
            }
            Node::Stream(_) => {
                return Err(FlightError::Unsupported(
                    "decoded streams cannot be encoded again".into(),
                ));
            }
        };
        cx.depth -= 1;
        Ok(json)
    }

    /// Moves a container into a task of its own, rendered on the next pass.
    fn defer_node(&mut self, cx: &RenderContext, id: NodeId) -> String {
        let task = self.create_task(Value::Node(id), cx.key_path.clone(), cx.implicit_slot);
        // The row replaces the path alias recorded just before deferring.
        if cx.records_identity() {
            self.references.define_node(id, format::by_value_id(task));
        }
        self.ping_task(task);
        tracing::trace!(task, parent = cx.task, "container deferred to its own row");
        format::by_value_id(task)
    }

    fn serialize_deferred(&mut self, cx: &RenderContext, deferred: &Deferred) -> String {
        if cx.records_identity()
            && let Some(existing) = self.references.deferred(deferred)
        {
            return existing.to_string();
        }
        let task = self.create_task(
            Value::Deferred(deferred.clone()),
            cx.key_path.clone(),
            cx.implicit_slot,
        );
        if self.status != RequestStatus::Aborting {
            match deferred.state() {
                Settled::Pending => {
                    let ping = self.pings.ping_for(task);
                    deferred.subscribe(move || ping.wake());
                    tracing::trace!(task, "task suspended on deferred value");
                }
                Settled::Fulfilled(_) | Settled::Rejected(_) => self.ping_task(task),
            }
        }
        let reference = format::promise_id(task);
        if cx.records_identity() {
            self.references.record_deferred(deferred, reference.clone());
        }
        reference
    }

    /// Gives a helper value its own task, rendered on a later pass.
    fn outline_later(&mut self, value: Value) -> u32 {
        let task = self.create_task(value, None, false);
        self.ping_task(task);
        task
    }

    fn serialize_typed_array(&mut self, array: &TypedArray) -> String {
        let id = self.allocate_id();
        self.queues.push(
            Priority::Regular,
            format::binary_row(id, array.kind().tag(), array.bytes()),
        );
        format::by_value_id(id)
    }

    fn serialize_symbol(&mut self, name: &str) -> Result<String> {
        if let Some(id) = self.references.symbol(name) {
            return Ok(format::by_value_id(id));
        }
        let id = self.allocate_id();
        let row = format::reference_row(id, &format!("$S{name}"))?;
        self.queues.push(Priority::Import, row);
        self.references.record_symbol(name, id);
        Ok(format::by_value_id(id))
    }

    fn serialize_client_reference(&mut self, reference: &ClientReference) -> String {
        let key = reference.key();
        if let Some(id) = self.references.client(&key) {
            return format::by_value_id(id);
        }
        let id = self.allocate_id();
        let metadata = self
            .config
            .client_metadata(reference)
            .and_then(|json| Ok(serde_json::to_string(&json)?));
        match metadata {
            Ok(json) => self
                .queues
                .push(Priority::Import, format::tagged_row(id, b'I', &json)),
            Err(error) => {
                let info = error.into();
                let digest = self.log_recoverable_error(&info);
                self.emit_error_row(id, digest, info);
            }
        }
        self.references.record_client(key, id);
        format::by_value_id(id)
    }

    fn serialize_server_reference(&mut self, reference: &ServerReference) -> Result<String> {
        if let Some(id) = self.references.server(&reference.id) {
            return Ok(format::outlined_id('F', id));
        }
        let bound = match &reference.bound {
            Some(args) => self.graph.array(args.iter().cloned()),
            None => Value::Null,
        };
        let metadata = self
            .graph
            .object([("id", Value::string(reference.id.clone())), ("bound", bound)]);
        let id = self.outline_later(metadata);
        self.references.record_server(&reference.id, id);
        Ok(format::outlined_id('F', id))
    }

    fn serialize_error_value(&mut self, mut info: crate::error::ErrorInfo) -> Result<String> {
        if info.env.is_none() {
            info.env = Some(self.options.environment_name.clone());
        }
        let id = self.allocate_id();
        let json = serde_json::to_string(&format::escape_json(serde_json::to_value(&info)?))?;
        self.queues.push(Priority::Regular, format::model_row(id, &json));
        Ok(format::outlined_id('Z', id))
    }
}
