//! The ping queue: the cooperative scheduler's run queue.
//!
//! Settling a [`Deferred`](crate::Deferred) or pushing into a stream channel
//! wakes a task by pushing its id here, possibly from another thread. The
//! owning request drains the queue in `perform_work`.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

type Notify = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct PingState {
    tasks: VecDeque<u32>,
    nudged: bool,
    notify: Option<Notify>,
}

/// Shared queue of task ids waiting to be retried.
#[derive(Clone, Default)]
pub struct PingQueue {
    inner: Arc<Mutex<PingState>>,
}

impl PingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a hook called whenever the queue goes from idle to having work.
    ///
    /// Hosts use this to schedule a `perform_work` call on their own executor.
    pub fn set_notify(&self, notify: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().notify = Some(Arc::new(notify));
    }

    /// A waker bound to one task id.
    pub fn ping_for(&self, task: u32) -> Ping {
        Ping {
            queue: self.clone(),
            task,
        }
    }

    /// Queues a task id.
    pub fn push(&self, task: u32) {
        let notify = {
            let mut state = self.inner.lock();
            let was_idle = state.tasks.is_empty() && !state.nudged;
            state.tasks.push_back(task);
            if was_idle { state.notify.clone() } else { None }
        };
        if let Some(notify) = notify {
            notify();
        }
    }

    /// Requests a work pass without waking a particular task.
    pub fn nudge(&self) {
        let notify = {
            let mut state = self.inner.lock();
            let was_idle = state.tasks.is_empty() && !state.nudged;
            state.nudged = true;
            if was_idle { state.notify.clone() } else { None }
        };
        if let Some(notify) = notify {
            notify();
        }
    }

    /// Takes every queued id, in ping order, and clears the nudge flag.
    pub fn drain(&self) -> Vec<u32> {
        let mut state = self.inner.lock();
        state.nudged = false;
        state.tasks.drain(..).collect()
    }

    /// Whether a work pass has been requested.
    pub fn has_work(&self) -> bool {
        let state = self.inner.lock();
        !state.tasks.is_empty() || state.nudged
    }
}

impl fmt::Debug for PingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PingQueue")
            .field("tasks", &state.tasks)
            .field("nudged", &state.nudged)
            .finish()
    }
}

/// Wakes one task of one request. Cheap to clone, safe to send across threads.
#[derive(Clone, Debug)]
pub struct Ping {
    queue: PingQueue,
    task: u32,
}

impl Ping {
    /// Queues the task for another attempt.
    pub fn wake(&self) {
        self.queue.push(self.task);
    }

    /// The task this ping wakes.
    pub fn task(&self) -> u32 {
        self.task
    }
}
