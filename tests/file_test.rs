#![allow(missing_docs)]

use flightwire::{Deferred, Flight, FlightInspector, Graph, Shape, TypedArray, Value};
use tempfile::NamedTempFile;

fn sample(graph: &Graph) -> Value {
    let inner = graph.object([("ok", Value::Bool(true))]);
    graph.object([
        ("raw", Value::Bytes(TypedArray::uint8(vec![1u8, 2, 3]))),
        ("later", Value::Deferred(Deferred::resolved(inner))),
    ])
}

// --- SAVE & LOAD ---

#[test]
fn test_save_and_load_roundtrip() {
    let graph = Graph::new();
    let root = sample(&graph);
    let file = NamedTempFile::new().expect("Failed to create temp file");

    Flight::save(file.path(), &graph, root.clone()).expect("Failed to save recording");
    let (loaded, loaded_root) = Flight::load(file.path()).expect("Failed to load recording");

    let raw = loaded.field(&loaded_root, "raw");
    assert_eq!(raw, Some(Value::Bytes(TypedArray::uint8(vec![1u8, 2, 3]))));
    assert_eq!(loaded.field(&loaded_root, "later"), Some(Value::Chunk(2)));
}

#[test]
fn test_saved_bytes_match_encode() {
    let graph = Graph::new();
    let root = graph.array((0..20).map(|i| graph.object([("i", Value::from(i))])));
    let file = NamedTempFile::new().expect("Failed to create temp file");

    Flight::builder()
        .max_row_size(40)
        .save(file.path(), &graph, root.clone())
        .expect("Failed to save recording");
    let expected = Flight::builder()
        .max_row_size(40)
        .encode(&graph, root.clone())
        .expect("encode failed");
    let on_disk = std::fs::read(file.path()).expect("Failed to read recording");
    assert_eq!(on_disk, expected);

    let (loaded, loaded_root) = Flight::load(file.path()).expect("Failed to load recording");
    assert_eq!(Shape::of(&graph, &root), Shape::of(&loaded, &loaded_root));
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let err = Flight::load(dir.path().join("missing.flight")).unwrap_err();
    assert!(matches!(err, flightwire::FlightError::Io(_)));
}

// --- INSPECTOR ---

#[test]
fn test_inspect_saved_recording() {
    let graph = Graph::new();
    let root = sample(&graph);
    let file = NamedTempFile::new().expect("Failed to create temp file");
    Flight::save(file.path(), &graph, root).expect("Failed to save recording");

    let report = Flight::inspect(file.path()).expect("Failed to inspect recording");
    assert_eq!(report.row_count, 3);
    assert!(report.malformed.is_empty());
    assert!(report.detached.is_empty());

    let tree = report.tree.as_ref().expect("root row missing");
    assert_eq!(tree.id, 0);
    assert_eq!(tree.references, vec![1, 2]);
    assert_eq!(tree.children[0].kind, "Uint8Array");
    assert_eq!(tree.children[0].payload_size, 3);

    let text = report.to_string();
    assert!(text.starts_with("=== FLIGHT INSPECTOR REPORT ==="));
    assert!(text.contains("$1 [Uint8Array] Size: 3b | Refs: 0"), "{text}");
    assert!(text.contains("└── $2 [Model]"), "{text}");
}

#[test]
fn test_inspector_reports_shared_detached_and_malformed_rows() {
    let bytes = b"0:[\"$1\",\"$2\"]\n1:{\"x\":\"$2\"}\n2:[]\n5:\"orphan\"\n:HD\"x\"\nzz:1\n";
    let report = FlightInspector::inspect(bytes).expect("inspect failed");

    assert_eq!(report.row_count, 4);
    assert_eq!(report.hint_count, 1);
    assert_eq!(report.malformed.len(), 1);
    assert_eq!(report.detached.len(), 1);
    assert_eq!(report.detached[0].id, 5);

    let tree = report.tree.as_ref().expect("root row missing");
    let shared = &tree.children[0].children[0];
    assert_eq!(shared.id, 2);
    assert!(!shared.seen);
    assert!(tree.children[1].seen);

    let text = report.to_string();
    assert!(text.contains("$2 (see above)"), "{text}");
    assert!(text.contains("[DETACHED]"));
    assert!(text.contains("Malformed:"));

    let json = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(json["row_count"], 4);
}
