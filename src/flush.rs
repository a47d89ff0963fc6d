//! Output queues and the flush/backpressure controller.
//!
//! Rendered rows wait in one of five append-only queues. Every flush drains
//! them in fixed priority order (imports, hints, regular rows, errors,
//! diagnostics) until the sink pushes back.

use crate::error::{FlightError, Result};
use crate::io::Sink;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

/// Queue priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Client reference imports and symbols.
    Import,
    /// Host hints.
    Hint,
    /// Model, text, binary and stream rows.
    Regular,
    /// Error rows and fatal references.
    Error,
    /// Debug rows.
    Diagnostic,
}

impl Priority {
    const PRIMARY: [Priority; 4] = [
        Priority::Import,
        Priority::Hint,
        Priority::Regular,
        Priority::Error,
    ];
}

/// Rows waiting to be written, by priority.
#[derive(Debug, Default)]
pub struct OutputQueues {
    import: VecDeque<Bytes>,
    hint: VecDeque<Bytes>,
    regular: VecDeque<Bytes>,
    error: VecDeque<Bytes>,
    diagnostic: VecDeque<Bytes>,
}

impl OutputQueues {
    /// Appends a row.
    pub fn push(&mut self, priority: Priority, row: Bytes) {
        self.queue_mut(priority).push_back(row);
    }

    /// Whether the primary queues are empty.
    pub fn primary_is_empty(&self) -> bool {
        Priority::PRIMARY.iter().all(|p| self.queue(*p).is_empty())
    }

    /// Whether the diagnostic queue is empty.
    pub fn diagnostic_is_empty(&self) -> bool {
        self.diagnostic.is_empty()
    }

    /// Rows waiting in every queue.
    pub fn len(&self) -> usize {
        self.import.len()
            + self.hint.len()
            + self.regular.len()
            + self.error.len()
            + self.diagnostic.len()
    }

    /// Whether nothing is waiting anywhere.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows waiting at one priority.
    pub fn queued(&self, priority: Priority) -> usize {
        self.queue(priority).len()
    }

    fn queue(&self, priority: Priority) -> &VecDeque<Bytes> {
        match priority {
            Priority::Import => &self.import,
            Priority::Hint => &self.hint,
            Priority::Regular => &self.regular,
            Priority::Error => &self.error,
            Priority::Diagnostic => &self.diagnostic,
        }
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Bytes> {
        match priority {
            Priority::Import => &mut self.import,
            Priority::Hint => &mut self.hint,
            Priority::Regular => &mut self.regular,
            Priority::Error => &mut self.error,
            Priority::Diagnostic => &mut self.diagnostic,
        }
    }
}

/// How a drain attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every eligible queue is empty.
    Drained,
    /// The sink pushed back; the rest waits for `on_drain`.
    Backpressure,
    /// No sink is attached yet.
    NoDestination,
}

/// One sink plus its pause flag.
struct Outlet {
    sink: Box<dyn Sink>,
    paused: bool,
}

impl Outlet {
    fn drain(&mut self, queue: &mut VecDeque<Bytes>) -> Result<bool> {
        while let Some(row) = queue.pop_front() {
            if !self.sink.write(&row)? {
                self.paused = true;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Moves queued rows into the primary sink and the optional debug sink.
#[derive(Default)]
pub struct FlowController {
    primary: Option<Outlet>,
    debug: Option<Outlet>,
    primary_ended: bool,
    debug_ended: bool,
}

impl FlowController {
    /// Attaches the primary sink.
    pub fn attach(&mut self, sink: Box<dyn Sink>) {
        self.primary = Some(Outlet {
            sink,
            paused: false,
        });
    }

    /// Attaches the diagnostic sink.
    pub fn attach_debug(&mut self, sink: Box<dyn Sink>) {
        self.debug = Some(Outlet {
            sink,
            paused: false,
        });
    }

    /// Whether a primary sink is attached.
    pub fn has_destination(&self) -> bool {
        self.primary.is_some()
    }

    /// Whether a diagnostic sink is attached.
    pub fn has_debug_destination(&self) -> bool {
        self.debug.is_some()
    }

    /// Whether the primary sink is waiting for `on_drain`.
    pub fn is_paused(&self) -> bool {
        self.primary.as_ref().is_some_and(|outlet| outlet.paused)
    }

    /// Clears the pause flags.
    pub fn resume(&mut self) {
        for outlet in [self.primary.as_mut(), self.debug.as_mut()].into_iter().flatten() {
            outlet.paused = false;
        }
    }

    /// Writes as much as the sinks accept.
    ///
    /// Diagnostic rows go to the debug sink when one is attached, otherwise
    /// they trail the primary queues on the primary sink.
    pub fn drain(&mut self, queues: &mut OutputQueues) -> Result<FlushOutcome> {
        if let Some(debug) = self.debug.as_mut()
            && !debug.paused
            && !self.debug_ended
            && !debug.drain(&mut queues.diagnostic)?
        {
            tracing::trace!(queued = queues.diagnostic.len(), "debug sink backpressure");
        }

        let route_diagnostics = self.debug.is_none();
        let Some(primary) = self.primary.as_mut() else {
            return Ok(FlushOutcome::NoDestination);
        };
        if primary.paused || self.primary_ended {
            return Ok(FlushOutcome::Backpressure);
        }
        for priority in Priority::PRIMARY {
            if !primary.drain(queues.queue_mut(priority))? {
                tracing::trace!(queued = queues.len(), "sink backpressure");
                return Ok(FlushOutcome::Backpressure);
            }
        }
        if route_diagnostics && !primary.drain(&mut queues.diagnostic)? {
            return Ok(FlushOutcome::Backpressure);
        }
        Ok(FlushOutcome::Drained)
    }

    /// Ends the primary sink.
    pub fn end(&mut self) -> Result<()> {
        if self.primary_ended {
            return Ok(());
        }
        if let Some(outlet) = self.primary.as_mut() {
            outlet.sink.end()?;
            self.primary_ended = true;
        }
        Ok(())
    }

    /// Ends the diagnostic sink.
    pub fn end_debug(&mut self) -> Result<()> {
        if self.debug_ended {
            return Ok(());
        }
        if let Some(outlet) = self.debug.as_mut() {
            outlet.sink.end()?;
            self.debug_ended = true;
        }
        Ok(())
    }

    /// Whether the primary sink was ended.
    pub fn is_ended(&self) -> bool {
        self.primary_ended
    }

    /// Tears down both sinks after a fatal error.
    pub fn destroy(&mut self, error: &FlightError) {
        if let Some(outlet) = self.primary.as_mut()
            && !self.primary_ended
        {
            outlet.sink.destroy(error);
            self.primary_ended = true;
        }
        if let Some(outlet) = self.debug.as_mut()
            && !self.debug_ended
        {
            outlet.sink.destroy(error);
            self.debug_ended = true;
        }
    }
}

impl fmt::Debug for FlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowController")
            .field("attached", &self.primary.is_some())
            .field("paused", &self.is_paused())
            .field("ended", &self.primary_ended)
            .field("debug_attached", &self.debug.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySink;

    #[test]
    fn drains_in_priority_order() {
        let mut queues = OutputQueues::default();
        queues.push(Priority::Error, Bytes::from_static(b"e"));
        queues.push(Priority::Regular, Bytes::from_static(b"r"));
        queues.push(Priority::Import, Bytes::from_static(b"i"));
        queues.push(Priority::Hint, Bytes::from_static(b"h"));
        queues.push(Priority::Diagnostic, Bytes::from_static(b"d"));

        let sink = MemorySink::new();
        let mut flow = FlowController::default();
        flow.attach(Box::new(sink.clone()));
        assert_eq!(flow.drain(&mut queues).unwrap(), FlushOutcome::Drained);
        assert_eq!(sink.contents(), b"ihred");
        assert!(queues.is_empty());
    }

    #[test]
    fn backpressure_keeps_the_suffix() {
        let mut queues = OutputQueues::default();
        for row in [b"a", b"b", b"c"] {
            queues.push(Priority::Regular, Bytes::from_static(row));
        }
        let sink = MemorySink::with_budget(2);
        let mut flow = FlowController::default();
        flow.attach(Box::new(sink.clone()));
        assert_eq!(flow.drain(&mut queues).unwrap(), FlushOutcome::Backpressure);
        assert_eq!(sink.contents(), b"ab");
        assert_eq!(queues.queued(Priority::Regular), 1);

        // Still paused: nothing moves until resume.
        assert_eq!(flow.drain(&mut queues).unwrap(), FlushOutcome::Backpressure);
        sink.unbounded();
        flow.resume();
        assert_eq!(flow.drain(&mut queues).unwrap(), FlushOutcome::Drained);
        assert_eq!(sink.contents(), b"abc");
    }
}
