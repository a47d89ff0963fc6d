//! Settle-once asynchronous values.

use crate::error::ErrorInfo;
use crate::graph::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Waiter = Box<dyn FnOnce() + Send>;

enum DeferredState {
    Pending(Vec<Waiter>),
    Fulfilled(Value),
    Rejected(ErrorInfo),
}

/// A snapshot of a [`Deferred`]'s state.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled(Value),
    /// Settled with an error.
    Rejected(ErrorInfo),
}

/// A value that may not be available yet.
///
/// Clones share the same cell. The first `resolve` or `reject` wins; later
/// attempts return `false` and change nothing. Waiters registered with
/// [`Deferred::subscribe`] run exactly once, on the settling thread, after the
/// internal lock is released.
///
/// ```rust
/// use flightwire::{Deferred, Settled, Value};
///
/// let cell = Deferred::new();
/// assert!(cell.resolve(Value::from(1)));
/// assert!(!cell.resolve(Value::from(2)));
/// assert_eq!(cell.state(), Settled::Fulfilled(Value::from(1)));
/// ```
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<Mutex<DeferredState>>,
}

impl Deferred {
    /// A pending cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeferredState::Pending(Vec::new()))),
        }
    }

    /// A cell that is already fulfilled.
    pub fn resolved(value: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeferredState::Fulfilled(value))),
        }
    }

    /// A cell that is already rejected.
    pub fn rejected(error: ErrorInfo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeferredState::Rejected(error))),
        }
    }

    /// Fulfills the cell. Returns `false` if it was already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(DeferredState::Fulfilled(value))
    }

    /// Rejects the cell. Returns `false` if it was already settled.
    pub fn reject(&self, error: ErrorInfo) -> bool {
        self.settle(DeferredState::Rejected(error))
    }

    fn settle(&self, next: DeferredState) -> bool {
        let previous = {
            let mut state = self.inner.lock();
            if !matches!(*state, DeferredState::Pending(_)) {
                return false;
            }
            std::mem::replace(&mut *state, next)
        };
        let DeferredState::Pending(waiters) = previous else {
            return false;
        };
        for waiter in waiters {
            waiter();
        }
        true
    }

    /// The current state.
    pub fn state(&self) -> Settled {
        match &*self.inner.lock() {
            DeferredState::Pending(_) => Settled::Pending,
            DeferredState::Fulfilled(value) => Settled::Fulfilled(value.clone()),
            DeferredState::Rejected(error) => Settled::Rejected(error.clone()),
        }
    }

    /// Whether the cell is still pending.
    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.lock(), DeferredState::Pending(_))
    }

    /// Runs `waiter` once the cell settles; immediately if it already has.
    pub fn subscribe(&self, waiter: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.lock();
            if let DeferredState::Pending(waiters) = &mut *state {
                waiters.push(Box::new(waiter));
                return;
            }
        }
        waiter();
    }

    /// A stable identity for deduplication; equal for clones of one cell.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &*self.inner.lock() {
            DeferredState::Pending(_) => "pending",
            DeferredState::Fulfilled(_) => "fulfilled",
            DeferredState::Rejected(_) => "rejected",
        };
        write!(f, "Deferred({status})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waiters_run_once_on_settle() {
        let cell = Deferred::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        cell.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        cell.reject(ErrorInfo::new("boom"));
        cell.resolve(Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(cell.state(), Settled::Rejected(_)));
    }

    #[test]
    fn late_subscribers_run_immediately() {
        let cell = Deferred::resolved(Value::Bool(true));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        cell.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
