//! The encoder: turns a live value graph into rows.
//!
//! A [`Request`] owns the id allocator, the task set, the output queues and the
//! flow controller. Work is cooperative: settling a deferred value or pushing
//! into a stream pings a task id, and the host calls
//! [`Request::perform_work`] to retry every pinged task and flush.
//!
//! ```rust
//! use flightwire::{Graph, MemorySink, Request, Value};
//!
//! let graph = Graph::new();
//! let root = graph.object([("x", Value::from(1)), ("y", Value::from("$escaped"))]);
//! let mut request = Request::new(graph, root);
//! let sink = MemorySink::new();
//! request.start_flowing(sink.clone());
//! request.perform_work();
//! assert_eq!(sink.text(), "0:{\"x\":1,\"y\":\"$$escaped\"}\n");
//! assert!(sink.is_ended());
//! ```

mod diagnostics;
mod references;
mod render;
mod stream;
mod task;

pub use references::ReferenceTable;
pub use task::{Task, TaskStatus};

use crate::config::RequestOptions;
use crate::deferred::Settled;
use crate::error::{ErrorDescriptor, ErrorInfo, FlightError, Result};
use crate::external::{DefaultReferenceConfig, ReferenceConfig};
use crate::flush::{FlowController, OutputQueues, Priority};
use crate::format;
use crate::graph::{Graph, Value};
use crate::io::Sink;
use crate::schedule::PingQueue;
use crate::source::Source;
use diagnostics::Diagnostics;
use render::RenderContext;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hasher;
use std::time::Instant;
use twox_hash::XxHash64;

type ErrorHook = Box<dyn FnMut(&ErrorInfo) -> Option<String>>;
type ReadyHook = Box<dyn FnMut()>;
type FatalHook = Box<dyn FnMut(&FlightError)>;

/// Host callbacks of a request.
#[derive(Default)]
pub struct Callbacks {
    on_error: Option<ErrorHook>,
    on_all_ready: Option<ReadyHook>,
    on_fatal_error: Option<FatalHook>,
}

impl Callbacks {
    /// No callbacks: errors are logged and digested locally.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a recoverable error to the digest written in its error row.
    ///
    /// Returning `None` falls back to the default digest.
    pub fn on_error(mut self, hook: impl FnMut(&ErrorInfo) -> Option<String> + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Called once when no task is outstanding any more.
    pub fn on_all_ready(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_all_ready = Some(Box::new(hook));
        self
    }

    /// Called when the request fails as a whole.
    pub fn on_fatal_error(mut self, hook: impl FnMut(&FlightError) + 'static) -> Self {
        self.on_fatal_error = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_error", &self.on_error.is_some())
            .field("on_all_ready", &self.on_all_ready.is_some())
            .field("on_fatal_error", &self.on_fatal_error.is_some())
            .finish()
    }
}

/// Lifecycle of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Rendering and flushing.
    Open,
    /// `abort` was called; outstanding tasks wait for their fatal reference.
    Aborting,
    /// Failed before a sink was attached; the next sink is destroyed.
    Fatal,
    /// The primary sink was ended or destroyed.
    Closed,
}

/// The digest written for an error when the host supplies none: the xxHash64
/// of name and message, in hex.
pub fn default_digest(error: &ErrorInfo) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(error.name.as_bytes());
    hasher.write(&[0]);
    hasher.write(error.message.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// One serialization of one root value.
pub struct Request {
    graph: Graph,
    options: RequestOptions,
    config: Box<dyn ReferenceConfig>,
    callbacks: Callbacks,
    status: RequestStatus,
    next_id: u32,
    tasks: BTreeMap<u32, Task>,
    abortable: BTreeSet<u32>,
    pings: PingQueue,
    queues: OutputQueues,
    flow: FlowController,
    references: ReferenceTable,
    streams: BTreeMap<u32, Box<dyn Source>>,
    diagnostics: Diagnostics,
    fatal_ref: Option<u32>,
    abort_deadline: Option<Instant>,
    fatal_error: Option<FlightError>,
    all_ready_fired: bool,
}

impl Request {
    /// A request with default options, reference config and callbacks.
    pub fn new(graph: Graph, root: Value) -> Self {
        Self::create(
            graph,
            root,
            RequestOptions::default(),
            DefaultReferenceConfig,
            Callbacks::default(),
        )
    }

    /// Creates a request and pings its root task (id 0).
    pub fn create(
        graph: Graph,
        root: Value,
        options: RequestOptions,
        config: impl ReferenceConfig + 'static,
        callbacks: Callbacks,
    ) -> Self {
        let mut request = Self {
            graph,
            options,
            config: Box::new(config),
            callbacks,
            status: RequestStatus::Open,
            next_id: 0,
            tasks: BTreeMap::new(),
            abortable: BTreeSet::new(),
            pings: PingQueue::new(),
            queues: OutputQueues::default(),
            flow: FlowController::default(),
            references: ReferenceTable::default(),
            streams: BTreeMap::new(),
            diagnostics: Diagnostics::default(),
            fatal_ref: None,
            abort_deadline: None,
            fatal_error: None,
            all_ready_fired: false,
        };
        let root_task = request.create_task(root, None, false);
        request.pings.push(root_task);
        tracing::debug!(root = root_task, "request created");
        request
    }

    // --- ACCESSORS ---

    /// Current lifecycle state.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// The graph being rendered.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The options this request runs with.
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// The status of the task that owns `id`, if a task owns it.
    pub fn task_status(&self, id: u32) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|task| task.status)
    }

    /// Tasks that have not emitted their terminal row.
    pub fn pending_tasks(&self) -> usize {
        self.abortable.len()
    }

    /// Rows rendered but not yet written.
    pub fn queued_rows(&self) -> usize {
        self.queues.len()
    }

    /// The ping queue; hosts install a notify hook on it to schedule work.
    pub fn ping_queue(&self) -> &PingQueue {
        &self.pings
    }

    /// Whether a call to `perform_work` would make progress.
    pub fn has_pending_work(&self) -> bool {
        self.pings.has_work() || self.abort_deadline.is_some()
    }

    /// Identities written so far.
    pub fn references(&self) -> &ReferenceTable {
        &self.references
    }

    /// The error that failed the request, if one did.
    pub fn fatal_error(&self) -> Option<&FlightError> {
        self.fatal_error.as_ref()
    }

    // --- SCHEDULING ---

    /// Retries every pinged task once, then flushes.
    ///
    /// Also finishes a pending abort whose grace delay has passed.
    pub fn perform_work(&mut self) {
        if self.status == RequestStatus::Fatal {
            self.pings.drain();
            return;
        }
        if let Err(error) = self.perform_work_inner() {
            self.fail(error);
        }
    }

    /// Alias of [`Request::perform_work`] for timer-driven hosts.
    pub fn tick(&mut self) {
        self.perform_work();
    }

    fn perform_work_inner(&mut self) -> Result<()> {
        if self.abort_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.finish_abort_inner()?;
        }
        for id in self.pings.drain() {
            self.retry_task(id)?;
        }
        self.poll_diagnostic_deferreds()?;
        self.flush_inner()
    }

    /// Writes queued rows to the sink in priority order.
    pub fn flush(&mut self) {
        if let Err(error) = self.flush_inner() {
            self.fail(error);
        }
    }

    fn flush_inner(&mut self) -> Result<()> {
        if self.status == RequestStatus::Fatal {
            return Ok(());
        }
        self.flow.drain(&mut self.queues)?;
        self.finish_if_complete()
    }

    /// Attaches the primary sink and starts writing.
    pub fn start_flowing(&mut self, sink: impl Sink + 'static) {
        let mut sink: Box<dyn Sink> = Box::new(sink);
        match self.status {
            RequestStatus::Fatal => {
                if let Some(error) = &self.fatal_error {
                    sink.destroy(error);
                }
                self.status = RequestStatus::Closed;
                return;
            }
            RequestStatus::Closed => {
                tracing::warn!("sink attached to a closed request");
                return;
            }
            _ => {}
        }
        if self.flow.has_destination() {
            tracing::warn!("replacing the primary sink of a running request");
        }
        self.flow.attach(sink);
        self.flush();
    }

    /// Resumes writing after the sink reported backpressure.
    pub fn on_drain(&mut self) {
        self.flow.resume();
        self.flush();
    }

    // --- TASKS ---

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_task(&mut self, model: Value, key_path: Option<String>, implicit_slot: bool) -> u32 {
        let id = self.allocate_id();
        let mut task = Task::new(id, model, key_path, implicit_slot);
        if task.records_identity()
            && let Value::Node(node) = &task.model
            && self.references.node(*node).is_none()
        {
            self.references.define_node(*node, format::by_value_id(id));
        }

        if self.status == RequestStatus::Aborting
            && let Some(fatal) = self.fatal_ref
        {
            task.status = TaskStatus::Aborted;
            self.tasks.insert(id, task);
            if self.abort_deadline.is_some() {
                self.abortable.insert(id);
            } else {
                self.finish_aborted_task(id, fatal);
            }
            return id;
        }

        tracing::trace!(task = id, kind = task.model.kind_name(), "task created");
        self.tasks.insert(id, task);
        self.abortable.insert(id);
        id
    }

    fn ping_task(&mut self, id: u32) {
        self.pings.push(id);
    }

    fn retry_task(&mut self, id: u32) -> Result<()> {
        if self.streams.contains_key(&id) {
            return self.pump_stream(id);
        }
        let Some(task) = self.tasks.get_mut(&id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        let model = match &task.model {
            Value::Deferred(deferred) => match deferred.state() {
                Settled::Pending => return Ok(()),
                Settled::Fulfilled(value) => value,
                Settled::Rejected(error) => {
                    self.errored_task(id, error);
                    return Ok(());
                }
            },
            other => other.clone(),
        };
        task.status = TaskStatus::Rendering;
        let mut cx = RenderContext::for_task(task);

        match self.render_value(&mut cx, None, "", &model) {
            Ok(json) => {
                let text = serde_json::to_string(&json)?;
                self.queues
                    .push(Priority::Regular, format::model_row(id, &text));
                self.complete_task(id);
            }
            Err(error) => {
                tracing::debug!(task = id, %error, "render failed");
                self.errored_task(id, ErrorInfo::from(error));
            }
        }
        Ok(())
    }

    fn complete_task(&mut self, id: u32) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Done;
        }
        self.abortable.remove(&id);
        self.call_on_all_ready_if_ready();
    }

    fn errored_task(&mut self, id: u32, error: ErrorInfo) {
        let digest = self.log_recoverable_error(&error);
        self.emit_error_row(id, digest, error);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.status = TaskStatus::Errored;
        }
        self.abortable.remove(&id);
        tracing::debug!(task = id, "task errored");
        self.call_on_all_ready_if_ready();
    }

    fn log_recoverable_error(&mut self, error: &ErrorInfo) -> String {
        if let Some(hook) = self.callbacks.on_error.as_mut() {
            if let Some(digest) = hook(error) {
                return digest;
            }
        } else {
            tracing::error!(name = %error.name, message = %error.message, "render error");
        }
        default_digest(error)
    }

    fn emit_error_row(&mut self, id: u32, digest: String, mut error: ErrorInfo) {
        if error.env.is_none() {
            error.env = Some(self.options.environment_name.clone());
        }
        let descriptor = ErrorDescriptor::new(digest, error);
        match serde_json::to_string(&descriptor) {
            Ok(json) => self
                .queues
                .push(Priority::Error, format::tagged_row(id, b'E', &json)),
            Err(error) => tracing::error!(task = id, %error, "cannot encode error row"),
        }
    }

    fn call_on_all_ready_if_ready(&mut self) {
        if self.abortable.is_empty() && !self.all_ready_fired {
            self.all_ready_fired = true;
            if let Some(hook) = self.callbacks.on_all_ready.as_mut() {
                hook();
            }
        }
    }

    fn finish_if_complete(&mut self) -> Result<()> {
        if self.status == RequestStatus::Fatal
            || !self.abortable.is_empty()
            || !self.flow.has_destination()
            || !self.queues.primary_is_empty()
        {
            return Ok(());
        }
        let diagnostics_settled =
            self.diagnostics.is_empty() && self.queues.diagnostic_is_empty();
        if self.flow.has_debug_destination() {
            if diagnostics_settled {
                self.flow.end_debug()?;
            }
        } else if !diagnostics_settled {
            return Ok(());
        }
        if self.status != RequestStatus::Closed {
            self.flow.end()?;
            self.status = RequestStatus::Closed;
            tracing::debug!(rows = self.next_id, "request closed");
        }
        Ok(())
    }

    // --- OUTLINING ---

    /// Renders an extra value into its own row and returns its id.
    pub fn outline(&mut self, value: Value) -> u32 {
        self.outline_with(value, None, false)
    }

    /// Like [`Request::outline`], under an explicit key path or implicit slot.
    ///
    /// Values outlined this way are not recorded for identity reuse.
    pub fn outline_with(
        &mut self,
        value: Value,
        key_path: Option<String>,
        implicit_slot: bool,
    ) -> u32 {
        if key_path.is_none()
            && !implicit_slot
            && let Value::Node(node) = &value
            && let Some(existing) = self.references.node(*node).map(str::to_string)
        {
            // Already written: the new row only points at it.
            let id = self.allocate_id();
            match format::reference_row(id, &existing) {
                Ok(row) => {
                    self.queues.push(Priority::Regular, row);
                    self.flush();
                }
                Err(error) => self.fail(error),
            }
            return id;
        }
        let id = self.create_task(value, key_path, implicit_slot);
        if let Err(error) = self.retry_task(id).and_then(|_| self.flush_inner()) {
            self.fail(error);
        }
        id
    }

    fn outline_model(&mut self, value: Value) -> Result<u32> {
        let id = self.create_task(value, None, false);
        self.retry_task(id)?;
        Ok(id)
    }

    /// The reference of `value` once it has a row of its own.
    ///
    /// Nodes the request already wrote keep their first reference.
    fn outline_reference(&mut self, value: Value) -> Result<String> {
        if let Value::Node(node) = &value
            && let Some(existing) = self.references.node(*node)
        {
            return Ok(existing.to_string());
        }
        Ok(format::by_value_id(self.outline_model(value)?))
    }

    // --- HINTS ---

    /// Queues a hint row for the consumer's host, ahead of regular rows.
    pub fn emit_hint(&mut self, code: char, model: serde_json::Value) {
        if self.status == RequestStatus::Closed {
            tracing::warn!(%code, "hint emitted after the request closed");
            return;
        }
        match serde_json::to_string(&model) {
            Ok(json) => {
                self.queues.push(Priority::Hint, format::hint_row(code, &json));
                self.flush();
            }
            Err(error) => tracing::warn!(%code, %error, "dropping hint"),
        }
    }

    // --- ABORT & FATAL ---

    /// Aborts the request.
    ///
    /// Open streams are cancelled and error individually. Every other
    /// outstanding task is marked aborted; one error row is written for a
    /// shared fatal id, and once the grace delay passes each aborted task gets
    /// a row referencing it.
    pub fn abort(&mut self, reason: Option<ErrorInfo>) {
        if let Err(error) = self.abort_inner(reason) {
            self.fail(error);
        }
    }

    fn abort_inner(&mut self, reason: Option<ErrorInfo>) -> Result<()> {
        if self.status != RequestStatus::Open {
            return Ok(());
        }
        self.status = RequestStatus::Aborting;
        let error = reason.unwrap_or_else(|| {
            ErrorInfo::new("The render was aborted by the server without a reason.")
        });
        tracing::info!(pending = self.abortable.len(), "aborting request");

        self.cancel_streams(&error);
        if self.abortable.is_empty() {
            self.call_on_all_ready_if_ready();
        } else {
            let digest = self.log_recoverable_error(&error);
            let fatal = self.allocate_id();
            self.fatal_ref = Some(fatal);
            self.emit_error_row(fatal, digest, error);
            for id in &self.abortable {
                if let Some(task) = self.tasks.get_mut(id) {
                    task.status = TaskStatus::Aborted;
                }
            }
            self.abort_deadline = Some(Instant::now() + self.options.abort_grace);
            self.pings.nudge();
        }
        self.flush_inner()
    }

    /// Writes the fatal references of aborted tasks now, without waiting for
    /// the grace delay.
    pub fn finish_abort(&mut self) {
        if let Err(error) = self.finish_abort_inner() {
            self.fail(error);
        }
    }

    fn finish_abort_inner(&mut self) -> Result<()> {
        let Some(fatal) = self.fatal_ref else {
            return Ok(());
        };
        if self.abort_deadline.take().is_none() {
            return Ok(());
        }
        let aborted: Vec<u32> = self.abortable.iter().copied().collect();
        for id in aborted {
            self.finish_aborted_task(id, fatal);
        }
        self.call_on_all_ready_if_ready();
        self.flush_inner()
    }

    fn finish_aborted_task(&mut self, id: u32, fatal: u32) {
        self.abortable.remove(&id);
        let is_aborted = self
            .tasks
            .get(&id)
            .is_some_and(|task| task.status == TaskStatus::Aborted);
        if !is_aborted {
            return;
        }
        match format::reference_row(id, &format::by_value_id(fatal)) {
            Ok(row) => self.queues.push(Priority::Error, row),
            Err(error) => tracing::error!(task = id, %error, "cannot encode fatal reference"),
        }
    }

    fn fail(&mut self, error: FlightError) {
        tracing::error!(%error, "fatal request error");
        if let Some(hook) = self.callbacks.on_fatal_error.as_mut() {
            hook(&error);
        }
        let info = ErrorInfo::from(&error);
        for (_, mut source) in std::mem::take(&mut self.streams) {
            source.cancel(&info);
        }
        for id in std::mem::take(&mut self.abortable) {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Aborted;
            }
        }
        self.abort_deadline = None;
        if self.flow.has_destination() {
            self.flow.destroy(&error);
            self.status = RequestStatus::Closed;
        } else {
            self.status = RequestStatus::Fatal;
        }
        self.fatal_error = Some(error);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("status", &self.status)
            .field("next_id", &self.next_id)
            .field("pending_tasks", &self.abortable.len())
            .field("queued_rows", &self.queues.len())
            .field("flow", &self.flow)
            .finish()
    }
}
