use super::render::RenderContext;
use super::{Request, RequestStatus, TaskStatus};
use crate::constants::ITEMS_PER_PASS;
use crate::error::{ErrorInfo, Result};
use crate::flush::Priority;
use crate::format;
use crate::graph::Value;
use crate::source::{Pull, SourceEvent, StreamHandle};

impl Request {
    /// Opens a stream task for `handle` and returns its reference.
    pub(super) fn open_stream(&mut self, handle: &StreamHandle) -> Result<String> {
        if let Some(existing) = self.references.stream(handle) {
            return Ok(existing.to_string());
        }
        let Some(mut source) = handle.take() else {
            return Err(crate::error::FlightError::Render(
                "stream source was already consumed by another request".into(),
            ));
        };
        let id = self.create_task(Value::Stream(handle.clone()), None, false);
        let reference = format::by_value_id(id);
        self.references.record_stream(handle, reference.clone());
        if self.status == RequestStatus::Aborting {
            source.cancel(&ErrorInfo::new("The render was aborted before the stream opened."));
            return Ok(reference);
        }

        self.queues.push(
            Priority::Regular,
            format::empty_tagged_row(id, handle.kind().tag()),
        );
        self.streams.insert(id, source);
        self.ping_task(id);
        tracing::trace!(task = id, kind = ?handle.kind(), "stream opened");
        Ok(reference)
    }

    /// Pulls items until the source is pending, done or failed.
    pub(super) fn pump_stream(&mut self, id: u32) -> Result<()> {
        for _ in 0..ITEMS_PER_PASS {
            let ping = self.pings.ping_for(id);
            let Some(source) = self.streams.get_mut(&id) else {
                return Ok(());
            };
            match source.poll_item(&ping) {
                Pull::Pending => return Ok(()),
                Pull::Ready(SourceEvent::Item(value)) => {
                    if let Err(error) = self.emit_stream_item(id, &value) {
                        self.error_stream(id, ErrorInfo::from(error));
                        return Ok(());
                    }
                }
                Pull::Ready(SourceEvent::End(final_value)) => {
                    self.streams.remove(&id);
                    let row = match final_value {
                        None => format::empty_tagged_row(id, b'C'),
                        Some(value) => {
                            let outlined = self.outline_reference(value)?;
                            let json = serde_json::to_string(&outlined)?;
                            format::tagged_row(id, b'C', &json)
                        }
                    };
                    self.queues.push(Priority::Regular, row);
                    tracing::trace!(task = id, "stream closed");
                    self.complete_task(id);
                    return Ok(());
                }
                Pull::Ready(SourceEvent::Failed(error)) => {
                    self.streams.remove(&id);
                    self.errored_task(id, error);
                    return Ok(());
                }
            }
        }
        // Budget spent: give other tasks a turn and continue on the next pass.
        self.ping_task(id);
        Ok(())
    }

    /// Appends one item row to the stream's id.
    ///
    /// Text goes in a `T` row and binary payloads in a binary row with their
    /// own tag. Containers are outlined so that identity and cycles inside
    /// the item resolve against a row of their own.
    fn emit_stream_item(&mut self, id: u32, value: &Value) -> Result<()> {
        let row = match value {
            Value::String(text) => format::text_row(id, text),
            Value::Bytes(array) => format::binary_row(id, array.kind().tag(), array.bytes()),
            Value::Node(_) => {
                let outlined = self.outline_reference(value.clone())?;
                let json = serde_json::to_string(&outlined)?;
                format::model_row(id, &json)
            }
            other => {
                let Some(task) = self.tasks.get(&id) else {
                    return Ok(());
                };
                let mut cx = RenderContext::for_task(task);
                cx.model_root = None;
                let json = self.render_value(&mut cx, None, "", other)?;
                format::model_row(id, &serde_json::to_string(&json)?)
            }
        };
        self.queues.push(Priority::Regular, row);
        Ok(())
    }

    fn error_stream(&mut self, id: u32, error: ErrorInfo) {
        if let Some(mut source) = self.streams.remove(&id) {
            source.cancel(&error);
        }
        self.errored_task(id, error);
    }

    /// Cancels every open source; each stream gets its own error row.
    pub(super) fn cancel_streams(&mut self, reason: &ErrorInfo) {
        let open: Vec<u32> = self.streams.keys().copied().collect();
        for id in open {
            if let Some(mut source) = self.streams.remove(&id) {
                source.cancel(reason);
            }
            if self.task_status(id) == Some(TaskStatus::Pending) {
                self.errored_task(id, reason.clone());
            }
        }
    }
}
