use crate::graph::Value;
use std::time::Instant;

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for a ping.
    Pending,
    /// Being rendered right now.
    Rendering,
    /// Its model row was queued.
    Done,
    /// Its error row was queued.
    Errored,
    /// The request was aborted before it finished.
    Aborted,
}

impl TaskStatus {
    /// Whether the task has emitted (or will only ever emit) its terminal row.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Errored | TaskStatus::Aborted)
    }
}

/// A unit of serialization work bound to one wire id.
#[derive(Debug, Clone)]
pub struct Task {
    /// The row id this task defines.
    pub id: u32,
    /// Where the task is in its lifecycle.
    pub status: TaskStatus,
    /// The value to render (a `Deferred` is unwrapped once it settles).
    pub model: Value,
    /// Set for tasks rendered under an explicit key; disables identity recording.
    pub key_path: Option<String>,
    /// Set for tasks rendered into an implicit slot; disables identity recording.
    pub implicit_slot: bool,
    /// When the task was created.
    pub created: Instant,
}

impl Task {
    pub(crate) fn new(id: u32, model: Value, key_path: Option<String>, implicit_slot: bool) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            model,
            key_path,
            implicit_slot,
            created: Instant::now(),
        }
    }

    /// Whether the task's subgraph may be referenced by identity.
    pub fn records_identity(&self) -> bool {
        self.key_path.is_none() && !self.implicit_slot
    }
}
