#![allow(missing_docs)]

use flightwire::{
    ChunkStatus, Deferred, Flight, Graph, Read, Response, ResponseOptions, Shape, TypedArray, Value,
};
use std::cell::RefCell;
use std::rc::Rc;

// --- HELPERS ---

fn sample_stream() -> Vec<u8> {
    let graph = Graph::new();
    let shared = graph.object([("v", Value::from(1))]);
    let root = graph.object([
        ("text", Value::from("x".repeat(40))),
        ("raw", Value::Bytes(TypedArray::uint8(vec![10u8, 13, 58]))),
        ("a", shared.clone()),
        ("b", shared),
        ("later", Value::Deferred(Deferred::resolved(Value::from("done")))),
    ]);
    Flight::builder()
        .large_string_threshold(16)
        .encode(&graph, root)
        .expect("encode failed")
}

fn shape_of(response: &Response) -> Shape {
    let root = response.root().value().cloned().expect("root settled");
    Shape::of(response.graph(), &root)
}

// --- FRAMING ---

#[test]
fn test_byte_by_byte_ingest_matches_whole_ingest() {
    let bytes = sample_stream();

    let mut whole = Response::new();
    whole.ingest(&bytes);

    let mut split = Response::new();
    for byte in &bytes {
        split.ingest(std::slice::from_ref(byte));
    }

    assert_eq!(shape_of(&whole), shape_of(&split));
    assert_eq!(split.pending_chunks(), 0);
}

#[test]
fn test_uneven_pieces_match_whole_ingest() {
    let bytes = sample_stream();
    let mut whole = Response::new();
    whole.ingest(&bytes);

    for size in [2, 3, 7, 13] {
        let mut split = Response::new();
        for piece in bytes.chunks(size) {
            split.ingest(piece);
        }
        assert_eq!(shape_of(&whole), shape_of(&split), "piece size {size}");
    }
}

#[test]
fn test_oversized_rows_reject_their_id() {
    let options = ResponseOptions {
        max_row_length: 4,
        ..ResponseOptions::default()
    };
    let mut response = Response::with_options(options, flightwire::external::DefaultModuleResolver);
    response.ingest(b"0:[\"$1\"]\n1:o10,\n");
    assert_eq!(response.status(1), Some(ChunkStatus::Rejected));
    assert_eq!(response.status(0), Some(ChunkStatus::Rejected));
}

#[test]
fn test_malformed_json_rejects_the_row() {
    let mut response = Response::new();
    response.ingest(b"0:{\"a\":\n");
    let Read::Failed(error) = response.root() else {
        panic!("root should be rejected");
    };
    assert!(error.info.message.contains("malformed model row"));
}

#[test]
fn test_unknown_tags_reject_the_row() {
    let mut response = Response::new();
    response.ingest(b"0:[\"$1\"]\n1:Z{}\n");
    let Read::Failed(error) = response.read(1) else {
        panic!("row 1 should be rejected");
    };
    assert!(error.info.message.contains("unknown row tag 'Z'"));
    assert!(matches!(response.root(), Read::Failed(_)));
}

// --- REFERENCES ---

#[test]
fn test_forward_references_patch_in_later() {
    let mut response = Response::new();
    response.ingest(b"0:{\"a\":\"$1\",\"b\":\"$1\"}\n");
    assert_eq!(response.status(0), Some(ChunkStatus::Blocked));
    assert_eq!(response.status(1), Some(ChunkStatus::Pending));
    assert_eq!(response.pending_chunks(), 2);

    response.ingest(b"1:[1,2]\n");
    assert_eq!(response.status(0), Some(ChunkStatus::Fulfilled));
    let root = response.root().value().cloned().expect("root settled");
    let a = response.graph().field(&root, "a");
    assert!(a.as_ref().is_some_and(|a| a.as_node().is_some()));
    assert_eq!(a, response.graph().field(&root, "b"));
}

#[test]
fn test_dependents_of_blocked_rows_reject_with_them() {
    let mut response = Response::new();
    response.ingest(b"1:{\"a\":\"$2\"}\n0:[\"$1\"]\n");
    assert_eq!(response.status(1), Some(ChunkStatus::Blocked));
    assert_eq!(response.status(0), Some(ChunkStatus::Blocked));

    response.ingest(b"2:E{\"digest\":\"d\",\"message\":\"gone\"}\n");
    assert_eq!(response.status(1), Some(ChunkStatus::Rejected));
    let Read::Failed(error) = response.root() else {
        panic!("root should be rejected");
    };
    assert_eq!(error.info.message, "gone");
}

#[test]
fn test_dependents_of_blocked_rows_wait_for_them() {
    let mut response = Response::new();
    response.ingest(b"1:{\"a\":\"$2\"}\n0:[\"$1\"]\n");
    response.ingest(b"2:\"ok\"\n");
    assert_eq!(response.status(0), Some(ChunkStatus::Fulfilled));

    let root = response.root().value().cloned().expect("root settled");
    let first = response.graph().field(&root, "0").expect("first item");
    assert_eq!(response.graph().field(&first, "a"), Some(Value::from("ok")));
}

#[test]
fn test_rows_may_arrive_out_of_order() {
    let mut response = Response::new();
    response.ingest(b"2:\"two\"\n1:{\"next\":\"$2\"}\n0:[\"$1\",\"$1:next\"]\n");
    let root = response.root().value().cloned().expect("root settled");
    assert_eq!(response.graph().field(&root, "1"), Some(Value::from("two")));
    let first = response.graph().field(&root, "0").expect("first item");
    assert_eq!(response.graph().field(&first, "next"), Some(Value::from("two")));
}

#[test]
fn test_promise_tokens_stay_as_chunk_handles() {
    let mut response = Response::new();
    response.ingest(b"0:{\"p\":\"$@1\"}\n");
    let root = response.root().value().cloned().expect("root settled");
    assert_eq!(response.graph().field(&root, "p"), Some(Value::Chunk(1)));
    assert_eq!(response.read(1), Read::Pending);

    response.ingest(b"1:{\"ok\":true}\n");
    let Read::Ready(value) = response.read(1) else {
        panic!("row 1 should be ready");
    };
    assert_eq!(response.graph().field(value, "ok"), Some(Value::Bool(true)));
}

#[test]
fn test_rejections_propagate_to_dependents() {
    let mut response = Response::new();
    response.ingest(b"0:{\"a\":\"$1\"}\n1:E{\"digest\":\"abc\",\"name\":\"Error\",\"message\":\"boom\"}\n");
    let Read::Failed(error) = response.root() else {
        panic!("root should be rejected");
    };
    assert_eq!(error.digest, "abc");
    assert_eq!(error.info.message, "boom");
}

// --- LIFECYCLE ---

#[test]
fn test_close_rejects_outstanding_rows() {
    let mut response = Response::new();
    response.ingest(b"0:\"$1\"\n");
    assert!(!response.is_closed());
    response.close();

    assert!(response.is_closed());
    for id in [0, 1, 9] {
        let Read::Failed(error) = response.read(id) else {
            panic!("row {id} should be rejected");
        };
        assert_eq!(error.info.message, "Connection closed.");
    }
}

#[test]
fn test_abandon_uses_the_given_reason() {
    let mut response = Response::new();
    response.ingest(b"0:[\"$@1\"]\n");
    response.abandon("navigation");

    assert!(matches!(response.root(), Read::Ready(_)));
    let Read::Failed(error) = response.read(1) else {
        panic!("row 1 should be rejected");
    };
    assert_eq!(error.info.message, "navigation");
}

#[test]
fn test_rows_after_settlement_are_ignored() {
    let mut response = Response::new();
    response.ingest(b"0:1\n0:2\n");
    assert_eq!(response.root(), Read::Ready(&Value::from(1)));
}

#[test]
fn test_settle_listeners_fire_once() {
    let mut response = Response::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    response.on_settle(1, {
        let seen = seen.clone();
        move |read| seen.borrow_mut().push(read.value().cloned())
    });
    assert!(seen.borrow().is_empty());

    response.ingest(b"1:\"hello\"\n");
    response.ingest(b"1:\"again\"\n");
    assert_eq!(*seen.borrow(), vec![Some(Value::from("hello"))]);

    response.on_settle(1, {
        let seen = seen.clone();
        move |read| seen.borrow_mut().push(read.value().cloned())
    });
    assert_eq!(seen.borrow().len(), 2);
}

// --- SIDE CHANNELS ---

#[test]
fn test_debug_info_rows_are_kept_per_id() {
    let mut response = Response::new();
    response.ingest(b"0:D{\"name\":\"Page\",\"env\":\"Server\"}\n0:D{\"name\":\"Layout\"}\n0:null\n");
    let info = response.debug_info(0);
    assert_eq!(info.len(), 2);
    assert_eq!(info[1]["name"], "Layout");
    assert_eq!(response.root(), Read::Ready(&Value::Null));
    assert!(response.debug_info(1).is_empty());
}

#[test]
fn test_debug_channel_shares_the_id_space() {
    let mut response = Response::new();
    response.ingest(b"0:{\"owner\":\"$1\"}\n");
    response.ingest_debug(b"1:{\"name\":\"App\"}\n");
    let root = response.root().value().cloned().expect("root settled");
    let owner = response.graph().field(&root, "owner").expect("owner");
    assert_eq!(response.graph().field(&owner, "name"), Some(Value::from("App")));
}

#[test]
fn test_hint_rows_are_queued_in_order() {
    let mut response = Response::new();
    response.ingest(b":HD\"a.example\"\n:HS[\"b.css\"]\n0:null\n");
    let hints = response.take_hints();
    assert_eq!(
        hints.iter().map(|hint| hint.code).collect::<Vec<_>>(),
        vec!['D', 'S']
    );
    assert_eq!(hints[0].model, serde_json::json!("a.example"));
}
