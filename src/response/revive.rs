//! The revival walk.
//!
//! Turns the JSON of a model row into graph values. Reference tokens to
//! settled rows are substituted inline; references to rows that are still
//! outstanding leave a `Null` placeholder, register a listener on the target
//! and bump the walk's blocked count. When the last listener delivers, the
//! owner of the walk (a chunk, a stream item or a stream's final value) is
//! completed.
//!
//! Deliveries are processed from an explicit queue so that long dependency
//! chains never recurse.

use super::Response;
use super::chunk::{ChunkState, Handler, HandlerId, Listener, MapKind, Owner, Read, Slot};
use crate::error::{ErrorDescriptor, ErrorInfo, FlightError};
use crate::format::{self, OutlinedRef, Token};
use crate::graph::{Node, ServerReference, Value};
use serde_json::Value as Json;
use std::collections::{HashSet, VecDeque};

pub(super) type WorkQueue = VecDeque<Delivery>;

/// What a settled chunk hands to one of its listeners.
#[derive(Debug, Clone)]
pub(super) enum Outcome {
    Value(Value),
    Error(ErrorDescriptor),
}

#[derive(Debug)]
pub(super) struct Delivery {
    pub source: u32,
    pub listener: Listener,
    pub outcome: Outcome,
}

/// State of one revival pass.
struct Walk {
    /// The chunk being revived; references to it resolve after the walk.
    self_id: Option<u32>,
    handler: HandlerId,
    deps: usize,
    waits: Vec<u32>,
    self_refs: Vec<(Slot, Vec<String>, MapKind)>,
    error: Option<ErrorDescriptor>,
}

impl Walk {
    fn fail(&mut self, error: ErrorDescriptor) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

type Resolved = std::result::Result<Value, ErrorDescriptor>;

impl Response {
    /// Revives the raw payload of chunk `id`.
    pub(super) fn initialize(&mut self, id: u32, work: &mut WorkQueue) {
        let Some(chunk) = self.chunks.get_mut(&id) else {
            return;
        };
        let ChunkState::ResolvedRaw(payload) = std::mem::replace(&mut chunk.state, ChunkState::Cyclic)
        else {
            return;
        };
        match serde_json::from_slice::<Json>(&payload) {
            Ok(json) => self.revive_root(Owner::Chunk(id), Some(id), json, work),
            Err(error) => {
                let error = FlightError::Format(format!("malformed model row: {error}"));
                self.reject(id, ErrorDescriptor::from(&error), work);
            }
        }
    }

    /// Walks `json` on behalf of `owner` and completes, blocks or fails it.
    pub(super) fn revive_root(
        &mut self,
        owner: Owner,
        self_id: Option<u32>,
        json: Json,
        work: &mut WorkQueue,
    ) {
        let handler = self.next_handler;
        self.next_handler = self.next_handler.wrapping_add(1);
        let mut walk = Walk {
            self_id,
            handler,
            deps: 0,
            waits: Vec::new(),
            self_refs: Vec::new(),
            error: None,
        };
        let root = self.revive(&mut walk, json, Slot::Root);

        if let Some(error) = walk.error {
            self.fail_owner(owner, error, work);
            return;
        }
        for (slot, path, map) in std::mem::take(&mut walk.self_refs) {
            match self.follow(&root, &path).and_then(|value| self.apply_map(map, value)) {
                Ok(value) => self.place(slot, value),
                Err(error) => {
                    self.fail_owner(owner, error, work);
                    return;
                }
            }
        }

        if walk.deps == 0 {
            self.complete_owner(owner, root, work);
            return;
        }
        tracing::trace!(?owner, deps = walk.deps, "revival blocked");
        self.handlers.insert(
            handler,
            Handler {
                deps: walk.deps,
                value: root.clone(),
                owner,
                waits: walk.waits,
            },
        );
        if let Owner::Chunk(id) = owner {
            if let Some(chunk) = self.chunks.get_mut(&id) {
                chunk.state = ChunkState::Blocked {
                    handler,
                    partial: root,
                };
            }
            self.resolve_cycles(id, work);
        }
    }

    fn revive(&mut self, walk: &mut Walk, json: Json, slot: Slot) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => self.revive_string(walk, &s, slot),
            Json::Array(items) => {
                let node = self.graph.alloc(Node::Array(Vec::with_capacity(items.len())));
                for (index, item) in items.into_iter().enumerate() {
                    let value = self.revive(walk, item, Slot::Index(node, index));
                    if let Err(error) = self.graph.push(node, value) {
                        walk.fail(ErrorDescriptor::from(&error));
                    }
                }
                Value::Node(node)
            }
            Json::Object(fields) => {
                let node = self.graph.alloc(Node::Object(Vec::with_capacity(fields.len())));
                for (index, (key, item)) in fields.into_iter().enumerate() {
                    let value = self.revive(walk, item, Slot::Index(node, index));
                    if let Err(error) = self.graph.insert(node, key, value) {
                        walk.fail(ErrorDescriptor::from(&error));
                    }
                }
                Value::Node(node)
            }
        }
    }

    fn revive_string(&mut self, walk: &mut Walk, s: &str, slot: Slot) -> Value {
        let token = match format::parse_token(s) {
            Ok(token) => token,
            Err(error) => {
                walk.fail(ErrorDescriptor::from(&error));
                return Value::Null;
            }
        };
        match token {
            Token::Literal(text) => Value::String(text.to_string()),
            Token::Promise(id) => {
                self.ensure_chunk(id);
                Value::Chunk(id)
            }
            Token::Lazy(target) | Token::Reference(target) => {
                self.reference(walk, target, MapKind::Plain, slot)
            }
            Token::Map(target) => self.reference(walk, target, MapKind::Map, slot),
            Token::Set(target) => self.reference(walk, target, MapKind::Set, slot),
            Token::Error(target) => self.reference(walk, target, MapKind::Error, slot),
            Token::Server(target) => self.reference(walk, target, MapKind::Server, slot),
            Token::Iterator(target) => self.reference(walk, target, MapKind::Iterator, slot),
            Token::Temporary(key) => Value::Temporary(key.to_string()),
            Token::Symbol(name) => Value::Symbol(name.to_string()),
            Token::Date(iso) => Value::Date(iso.to_string()),
            Token::BigInt(n) => Value::BigInt(n),
            Token::Undefined => Value::Undefined,
            Token::Infinity => Value::Number(f64::INFINITY),
            Token::NegInfinity => Value::Number(f64::NEG_INFINITY),
            Token::NegZero => Value::Number(-0.0),
            Token::NaN => Value::Number(f64::NAN),
            Token::Diagnostic(Some(id)) => {
                self.ensure_chunk(id);
                Value::Chunk(id)
            }
            Token::Diagnostic(None) => Value::Undefined,
        }
    }

    /// Resolves an outlined reference, or registers a listener for it.
    fn reference(&mut self, walk: &mut Walk, target: OutlinedRef, map: MapKind, slot: Slot) -> Value {
        let OutlinedRef { id, path } = target;
        if walk.self_id == Some(id) {
            walk.self_refs.push((slot, path, map));
            return Value::Null;
        }

        let state = &self.ensure_chunk(id).state;
        match state {
            ChunkState::Fulfilled(value) => {
                let value = value.clone();
                match self.follow(&value, &path).and_then(|v| self.apply_map(map, v)) {
                    Ok(value) => return value,
                    Err(error) => {
                        walk.fail(error);
                        return Value::Null;
                    }
                }
            }
            ChunkState::Rejected(error) => {
                walk.fail(error.clone());
                return Value::Null;
            }
            ChunkState::Blocked { handler, partial } => {
                let (handler, partial) = (*handler, partial.clone());
                let cyclic = match (walk.self_id, self.handlers.get(&handler)) {
                    (Some(me), Some(blocked)) => self.waits_on(&blocked.waits, me),
                    _ => false,
                };
                // Only containers: a scalar there may still be a placeholder.
                if cyclic
                    && let Ok(value) = self.follow(&partial, &path).and_then(|v| self.apply_map(map, v))
                    && value.as_node().is_some()
                {
                    return value;
                }
            }
            ChunkState::Pending | ChunkState::Cyclic | ChunkState::ResolvedRaw(_) => {}
        }

        if let Some(chunk) = self.chunks.get_mut(&id) {
            chunk.listeners.push(Listener::Reference {
                handler: walk.handler,
                slot,
                path,
                map,
            });
        }
        walk.deps += 1;
        walk.waits.push(id);
        Value::Null
    }

    /// Whether a handler waiting on `waits` transitively waits on `target`.
    fn waits_on(&self, waits: &[u32], target: u32) -> bool {
        let mut stack = waits.to_vec();
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(ChunkState::Blocked { handler, .. }) = self.chunks.get(&id).map(|c| &c.state)
                && let Some(blocked) = self.handlers.get(handler)
            {
                stack.extend_from_slice(&blocked.waits);
            }
        }
        false
    }

    /// Breaks dependency cycles that close when chunk `id` blocks.
    ///
    /// A listener on `id` whose own chunk is something `id` transitively waits
    /// on would never fire; it receives `id`'s partial value instead.
    fn resolve_cycles(&mut self, id: u32, work: &mut WorkQueue) {
        let Some(chunk) = self.chunks.get(&id) else {
            return;
        };
        let ChunkState::Blocked { handler, partial } = &chunk.state else {
            return;
        };
        let partial = partial.clone();
        let Some(waits) = self.handlers.get(handler).map(|h| h.waits.clone()) else {
            return;
        };

        let listeners = match self.chunks.get_mut(&id) {
            Some(chunk) => std::mem::take(&mut chunk.listeners),
            None => return,
        };
        let mut kept = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let waiter = match &listener {
                Listener::Reference { handler, .. } => {
                    self.handlers.get(handler).map(|h| h.owner)
                }
                Listener::Consumer(_) => None,
            };
            match waiter {
                Some(Owner::Chunk(other)) if self.waits_on(&waits, other) => {
                    tracing::trace!(id, other, "resolving cyclic reference");
                    work.push_back(Delivery {
                        source: id,
                        listener,
                        outcome: Outcome::Value(partial.clone()),
                    });
                }
                _ => kept.push(listener),
            }
        }
        if let Some(chunk) = self.chunks.get_mut(&id) {
            chunk.listeners = kept;
        }
    }

    /// Processes deliveries until the queue is empty.
    pub(super) fn drain(&mut self, mut work: WorkQueue) {
        while let Some(Delivery {
            source,
            listener,
            outcome,
        }) = work.pop_front()
        {
            match listener {
                Listener::Consumer(hook) => match &outcome {
                    Outcome::Value(value) => hook(Read::Ready(value)),
                    Outcome::Error(error) => hook(Read::Failed(error)),
                },
                Listener::Reference {
                    handler,
                    slot,
                    path,
                    map,
                } => self.deliver(source, handler, slot, &path, map, outcome, &mut work),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        source: u32,
        handler: HandlerId,
        slot: Slot,
        path: &[String],
        map: MapKind,
        outcome: Outcome,
        work: &mut WorkQueue,
    ) {
        // Gone when its owner already failed or the response closed.
        if !self.handlers.contains_key(&handler) {
            return;
        }
        let resolved = match outcome {
            Outcome::Value(value) => self.follow(&value, path).and_then(|v| self.apply_map(map, v)),
            Outcome::Error(error) => Err(error),
        };
        let value = match resolved {
            Ok(value) => value,
            Err(error) => {
                if let Some(failed) = self.handlers.remove(&handler) {
                    self.fail_owner(failed.owner, error, work);
                }
                return;
            }
        };

        self.place(slot, value.clone());
        let Some(entry) = self.handlers.get_mut(&handler) else {
            return;
        };
        if slot == Slot::Root {
            entry.value = value;
        }
        if let Some(position) = entry.waits.iter().position(|id| *id == source) {
            entry.waits.swap_remove(position);
        }
        entry.deps = entry.deps.saturating_sub(1);
        if entry.deps > 0 {
            return;
        }
        if let Some(done) = self.handlers.remove(&handler) {
            self.complete_owner(done.owner, done.value, work);
        }
    }

    fn place(&self, slot: Slot, value: Value) {
        if let Slot::Index(node, index) = slot
            && let Err(error) = self.graph.set_slot(node, index, value)
        {
            tracing::warn!(%error, "cannot patch a revived slot");
        }
    }

    /// Follows a reference path from a value.
    fn follow(&self, value: &Value, path: &[String]) -> Resolved {
        let mut current = value.clone();
        for key in path {
            current = self.graph.field(&current, key).ok_or_else(|| {
                ErrorDescriptor::local(format!(
                    "reference path ':{}' does not exist",
                    path.join(":")
                ))
            })?;
        }
        Ok(current)
    }

    /// Converts the referenced value into what the token stands for.
    fn apply_map(&self, map: MapKind, value: Value) -> Resolved {
        match map {
            MapKind::Plain | MapKind::Iterator => Ok(value),
            MapKind::Map => {
                let pairs = self.array_items(&value)?;
                let mut entries = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    match self.array_items(&pair)?.as_slice() {
                        [key, value] => entries.push((key.clone(), value.clone())),
                        _ => return Err(ErrorDescriptor::local("map entry is not a pair")),
                    }
                }
                Ok(Value::Node(self.graph.alloc(Node::Map(entries))))
            }
            MapKind::Set => {
                let members = self.array_items(&value)?;
                Ok(Value::Node(self.graph.alloc(Node::Set(members))))
            }
            MapKind::Error => {
                let json = self
                    .graph
                    .to_json(&value)
                    .map_err(|error| ErrorDescriptor::from(&error))?;
                let info: ErrorInfo = serde_json::from_value(json)
                    .map_err(|error| ErrorDescriptor::from(&FlightError::from(error)))?;
                Ok(Value::Error(info))
            }
            MapKind::Server => {
                let id = self
                    .graph
                    .field(&value, "id")
                    .and_then(|id| id.as_str().map(str::to_string))
                    .ok_or_else(|| ErrorDescriptor::local("server reference without an id"))?;
                let mut reference = ServerReference::new(id);
                if let Some(bound) = self.graph.field(&value, "bound")
                    && bound.as_node().is_some()
                {
                    reference = reference.bind(self.array_items(&bound)?);
                }
                Ok(Value::Server(reference))
            }
        }
    }

    fn array_items(&self, value: &Value) -> Result<Vec<Value>, ErrorDescriptor> {
        let node = value
            .as_node()
            .and_then(|id| self.graph.get(id))
            .ok_or_else(|| ErrorDescriptor::local(format!("expected an array, found {}", value.kind_name())))?;
        match node {
            Node::Array(items) => Ok(items),
            other => Err(ErrorDescriptor::local(format!(
                "expected an array, found a {}",
                other.kind_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorInfo;
    use crate::graph::{Node, Value};
    use crate::response::{ChunkStatus, Read, Response};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn self_references_resolve_to_the_root() {
        let mut response = Response::new();
        response.ingest(b"0:{\"name\":\"a\",\"me\":\"$0\"}\n");
        let root = response.root().value().cloned().unwrap();
        assert_eq!(response.graph().field(&root, "me"), Some(root));
    }

    #[test]
    fn forward_references_patch_their_slot() {
        let mut response = Response::new();
        response.ingest(b"0:[\"$1\",\"$1:x\"]\n");
        assert_eq!(response.status(0), Some(ChunkStatus::Blocked));
        assert_eq!(response.status(1), Some(ChunkStatus::Pending));

        response.ingest(b"1:{\"x\":7}\n");
        let root = response.root().value().cloned().unwrap();
        let first = response.graph().field(&root, "0").unwrap();
        assert_eq!(response.graph().field(&first, "x"), Some(Value::from(7)));
        assert_eq!(response.graph().field(&root, "1"), Some(Value::from(7)));
    }

    #[test]
    fn mutual_cycles_settle_both_rows() {
        let mut response = Response::new();
        response.ingest(b"0:{\"b\":\"$1\"}\n1:{\"a\":\"$0\"}\n");
        let a = response.root().value().cloned().unwrap();
        let b = response.graph().field(&a, "b").unwrap();
        assert_eq!(response.graph().field(&b, "a"), Some(a));
        assert_eq!(response.status(1), Some(ChunkStatus::Fulfilled));
    }

    #[test]
    fn path_cycles_resolve_against_partial_values() {
        let mut response = Response::new();
        response.ingest(b"1:{\"up\":\"$0:inner\"}\n");
        response.ingest(b"0:{\"inner\":{\"down\":\"$1\"},\"x\":\"$1:up\"}\n");
        let root = response.root().value().cloned().unwrap();
        let inner = response.graph().field(&root, "inner").unwrap();
        assert_eq!(response.graph().field(&root, "x"), Some(inner));
        assert_eq!(response.pending_chunks(), 0);
    }

    #[test]
    fn maps_sets_and_errors_are_rebuilt() {
        let mut response = Response::new();
        response.ingest(b"1:[[\"k\",1]]\n2:[\"a\",\"b\"]\n3:{\"name\":\"TypeError\",\"message\":\"$$bad\",\"stack\":[]}\n");
        response.ingest(b"0:[\"$Q1\",\"$W2\",\"$Z3\"]\n");
        let root = response.root().value().cloned().unwrap();
        let graph = response.graph();

        let map = graph.field(&root, "0").and_then(|v| v.as_node()).unwrap();
        assert_eq!(
            graph.get(map),
            Some(Node::Map(vec![(Value::from("k"), Value::from(1))]))
        );
        let set = graph.field(&root, "1").and_then(|v| v.as_node()).unwrap();
        assert_eq!(
            graph.get(set),
            Some(Node::Set(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(
            graph.field(&root, "2"),
            Some(Value::Error(ErrorInfo::named("TypeError", "$bad")))
        );
    }

    #[test]
    fn rejections_propagate_to_dependents() {
        let mut response = Response::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        response.on_settle(0, move |read| {
            if let Read::Failed(error) = read {
                *sink.borrow_mut() = Some(error.info.message.clone());
            }
        });
        response.ingest(b"0:{\"a\":\"$1\"}\n1:E{\"digest\":\"d\",\"message\":\"boom\"}\n");
        assert_eq!(seen.borrow().as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_tokens_reject_the_row() {
        let mut response = Response::new();
        response.ingest(b"0:\"$?x\"\n");
        assert_eq!(response.status(0), Some(ChunkStatus::Rejected));
    }
}
