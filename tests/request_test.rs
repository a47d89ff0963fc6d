#![allow(missing_docs)]

use flightwire::{
    Callbacks, Deferred, ErrorInfo, FlightError, Graph, MemorySink, Read, Request, RequestOptions,
    RequestStatus, Response, Sink, TaskStatus, Value,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// --- HELPERS ---

fn request_with(graph: &Graph, root: Value, callbacks: Callbacks) -> Request {
    Request::create(
        graph.clone(),
        root,
        RequestOptions::default(),
        flightwire::external::DefaultReferenceConfig,
        callbacks,
    )
}

fn decode(text: &str) -> Response {
    let mut response = Response::new();
    response.ingest(text.as_bytes());
    response
}

/// A sink whose writes always fail.
struct BrokenSink {
    destroyed: Arc<AtomicUsize>,
}

impl Sink for BrokenSink {
    fn write(&mut self, _chunk: &[u8]) -> flightwire::Result<bool> {
        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer went away").into())
    }

    fn end(&mut self) -> flightwire::Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _error: &FlightError) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// --- DEFERRED VALUES ---

#[test]
fn test_deferred_value_is_written_when_it_settles() {
    let graph = Graph::new();
    let later = Deferred::new();
    let root = graph.object([("a", Value::Deferred(later.clone()))]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();

    assert_eq!(sink.text(), "0:{\"a\":\"$@1\"}\n");
    assert_eq!(request.task_status(1), Some(TaskStatus::Pending));
    assert!(!sink.is_ended());
    assert!(!request.has_pending_work());

    assert!(later.resolve(Value::from("hi")));
    assert!(request.has_pending_work());
    request.perform_work();

    assert_eq!(sink.text(), "0:{\"a\":\"$@1\"}\n1:\"hi\"\n");
    assert_eq!(request.task_status(1), Some(TaskStatus::Done));
    assert!(sink.is_ended());
    assert_eq!(request.status(), RequestStatus::Closed);
}

#[test]
fn test_same_deferred_is_referenced_once() {
    let graph = Graph::new();
    let shared = Deferred::resolved(Value::from(5));
    let root = graph.array([Value::Deferred(shared.clone()), Value::Deferred(shared)]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    request.perform_work();

    assert_eq!(sink.text(), "0:[\"$@1\",\"$@1\"]\n1:5\n");

    let response = decode(&sink.text());
    let root = response.root().value().cloned().expect("root settled");
    assert_eq!(response.graph().field(&root, "0"), Some(Value::Chunk(1)));
    assert_eq!(response.read(1), Read::Ready(&Value::from(5)));
}

#[test]
fn test_rejected_deferred_becomes_error_row() {
    let graph = Graph::new();
    let failing = Deferred::rejected(ErrorInfo::named("TypeError", "no such user"));
    let root = graph.array([Value::Deferred(failing)]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    request.perform_work();

    let text = sink.text();
    assert!(text.contains("1:E{\"digest\":\""), "{text}");
    assert!(sink.is_ended());

    let response = decode(&text);
    let Read::Failed(error) = response.read(1) else {
        panic!("row 1 should be rejected");
    };
    assert_eq!(error.info.name, "TypeError");
    assert_eq!(error.info.message, "no such user");
    assert_eq!(error.info.env.as_deref(), Some("Server"));
    assert_eq!(error.digest.len(), 16);
}

// --- OUTLINING ---

#[test]
fn test_outlining_a_written_node_points_at_it() {
    let graph = Graph::new();
    let shared = graph.object([("v", Value::from(1))]);
    let later = Deferred::new();
    let root = graph.object([("a", shared.clone()), ("later", Value::Deferred(later.clone()))]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    assert_eq!(sink.text(), "0:{\"a\":{\"v\":1},\"later\":\"$@1\"}\n");

    assert_eq!(request.outline(shared.clone()), 2);
    later.resolve(shared);
    request.perform_work();
    assert_eq!(
        sink.text(),
        "0:{\"a\":{\"v\":1},\"later\":\"$@1\"}\n2:\"$0:a\"\n1:\"$0:a\"\n"
    );
    assert_eq!(request.status(), RequestStatus::Closed);

    let response = decode(&sink.text());
    let root = response.root().value().cloned().expect("root settled");
    let shared = response.graph().field(&root, "a");
    assert!(shared.is_some());
    for id in [1, 2] {
        assert_eq!(response.read(id).value().cloned(), shared);
    }
}

// --- CALLBACKS ---

#[test]
fn test_error_hook_supplies_digest() {
    let graph = Graph::new();
    let root = graph.array([Value::Deferred(Deferred::rejected(ErrorInfo::new("secret")))]);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let ready = Rc::new(Cell::new(0));
    let callbacks = Callbacks::new()
        .on_error({
            let seen = seen.clone();
            move |error| {
                seen.borrow_mut().push(error.message.clone());
                Some("d1".to_string())
            }
        })
        .on_all_ready({
            let ready = ready.clone();
            move || ready.set(ready.get() + 1)
        });
    let mut request = request_with(&graph, root, callbacks);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    request.perform_work();

    assert_eq!(*seen.borrow(), vec!["secret".to_string()]);
    assert_eq!(ready.get(), 1);
    assert!(sink.text().contains("1:E{\"digest\":\"d1\""));
}

#[test]
fn test_fatal_sink_error_destroys_the_sink() {
    let graph = Graph::new();
    let fatal = Rc::new(Cell::new(0));
    let callbacks = Callbacks::new().on_fatal_error({
        let fatal = fatal.clone();
        move |_| fatal.set(fatal.get() + 1)
    });
    let mut request = request_with(&graph, Value::Null, callbacks);
    let destroyed = Arc::new(AtomicUsize::new(0));
    request.start_flowing(BrokenSink {
        destroyed: destroyed.clone(),
    });
    request.perform_work();

    assert_eq!(fatal.get(), 1);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(request.status(), RequestStatus::Closed);
    assert!(matches!(request.fatal_error(), Some(FlightError::Io(_))));
}

// --- FLOW CONTROL ---

#[test]
fn test_backpressure_pauses_until_drained() {
    let graph = Graph::new();
    let root = graph.array([
        Value::Bytes(flightwire::TypedArray::uint8(vec![1u8])),
        Value::Bytes(flightwire::TypedArray::uint8(vec![2u8])),
    ]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::with_budget(1);
    request.start_flowing(sink.clone());
    request.perform_work();

    assert_eq!(sink.write_count(), 1);
    assert_eq!(request.queued_rows(), 2);
    assert!(!sink.is_ended());

    // Paused: more work does not write.
    request.perform_work();
    assert_eq!(sink.write_count(), 1);

    sink.unbounded();
    request.on_drain();
    assert_eq!(sink.contents(), b"1:o1,\x012:o1,\x020:[\"$1\",\"$2\"]\n".to_vec());
    assert!(sink.is_ended());
}

#[test]
fn test_rows_queue_until_a_sink_attaches() {
    let graph = Graph::new();
    let root = graph.object([("n", Value::from(1))]);
    let mut request = Request::new(graph, root);
    request.perform_work();
    assert_eq!(request.queued_rows(), 1);
    assert_eq!(request.status(), RequestStatus::Open);

    request.emit_hint('D', serde_json::json!("https://cdn.example"));
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());

    assert_eq!(
        sink.text(),
        ":HD\"https://cdn.example\"\n0:{\"n\":1}\n"
    );
    assert!(sink.is_ended());
}

#[test]
fn test_hints_reach_the_response() {
    let graph = Graph::new();
    let mut request = Request::new(graph, Value::Null);
    request.emit_hint('S', serde_json::json!(["style.css", "high"]));
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();

    let mut response = decode(&sink.text());
    let hints = response.take_hints();
    assert_eq!(hints.len(), 1);
    assert_eq!(hints[0].code, 'S');
    assert_eq!(hints[0].model, serde_json::json!(["style.css", "high"]));
    assert!(response.take_hints().is_empty());
}

// --- ABORT ---

#[test]
fn test_abort_writes_one_fatal_row() {
    let graph = Graph::new();
    let a = Deferred::new();
    let b = Deferred::new();
    let root = graph.object([
        ("a", Value::Deferred(a.clone())),
        ("b", Value::Deferred(b)),
    ]);
    let mut request = Request::new(graph, root);
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    assert_eq!(request.pending_tasks(), 2);

    request.abort(Some(ErrorInfo::new("user left")));
    assert_eq!(request.status(), RequestStatus::Aborting);
    assert_eq!(request.task_status(1), Some(TaskStatus::Aborted));
    request.perform_work();

    let text = sink.text();
    assert_eq!(text.matches(":E{").count(), 1, "{text}");
    assert!(text.contains("3:E{"));
    assert!(text.ends_with("1:\"$3\"\n2:\"$3\"\n"), "{text}");
    assert!(sink.is_ended());

    // Settling after the abort writes nothing.
    a.resolve(Value::from(1));
    request.perform_work();
    assert_eq!(sink.text(), text);

    let response = decode(&text);
    for id in [1, 2] {
        let Read::Failed(error) = response.read(id) else {
            panic!("row {id} should be rejected");
        };
        assert_eq!(error.info.message, "user left");
    }
}

#[test]
fn test_abort_without_pending_work_just_closes() {
    let graph = Graph::new();
    let ready = Rc::new(Cell::new(0));
    let callbacks = Callbacks::new().on_all_ready({
        let ready = ready.clone();
        move || ready.set(ready.get() + 1)
    });
    let mut request = request_with(&graph, Value::from(1), callbacks);
    request.perform_work();
    request.abort(None);

    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    assert_eq!(sink.text(), "0:1\n");
    assert!(sink.is_ended());
    assert_eq!(ready.get(), 1);
}

#[test]
fn test_abort_grace_delays_fatal_references() {
    let graph = Graph::new();
    let root = graph.array([Value::Deferred(Deferred::new())]);
    let options = RequestOptions {
        abort_grace: std::time::Duration::from_secs(3600),
        ..RequestOptions::default()
    };
    let mut request = Request::create(
        graph,
        root,
        options,
        flightwire::external::DefaultReferenceConfig,
        Callbacks::new(),
    );
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());
    request.perform_work();
    request.abort(None);
    request.perform_work();

    assert!(sink.text().contains("2:E{"));
    assert!(!sink.text().contains("1:\"$2\""));
    assert!(!sink.is_ended());

    request.finish_abort();
    assert!(sink.text().ends_with("1:\"$2\"\n"));
    assert!(sink.is_ended());
}
