#![allow(missing_docs)]

use flightwire::{
    ClientReference, ErrorInfo, Flight, Graph, Node, Result, ServerReference, Shape, TypedArray,
    Value,
};

// --- HELPERS ---

fn roundtrip(graph: &Graph, root: Value) -> Result<(Shape, Shape)> {
    let expected = Shape::of(graph, &root);
    let bytes = Flight::encode(graph, root)?;
    let (decoded, root) = Flight::decode(&bytes)?;
    Ok((expected, Shape::of(&decoded, &root)))
}

fn encode_text(graph: &Graph, root: Value) -> String {
    let bytes = Flight::encode(graph, root).expect("encode failed");
    String::from_utf8(bytes).expect("rows are not utf-8")
}

// --- SCALARS ---

#[test]
fn test_plain_object_is_one_row() {
    let graph = Graph::new();
    let root = graph.object([
        ("id", Value::from(7)),
        ("name", Value::from("ada")),
        ("ok", Value::Bool(true)),
        ("none", Value::Null),
    ]);
    assert_eq!(
        encode_text(&graph, root),
        "0:{\"id\":7,\"name\":\"ada\",\"ok\":true,\"none\":null}\n"
    );
}

#[test]
fn test_dollar_strings_are_escaped() -> Result<()> {
    let graph = Graph::new();
    let root = graph.array([
        Value::from("$1"),
        Value::from("$$"),
        Value::from("$"),
        Value::from("a$"),
    ]);
    assert_eq!(
        encode_text(&graph, root.clone()),
        "0:[\"$$1\",\"$$$\",\"$$\",\"a$\"]\n"
    );

    let (decoded, root) = Flight::decode(&Flight::encode(&graph, root)?)?;
    let Some(Node::Array(items)) = decoded.get(root.as_node().expect("root is an array")) else {
        panic!("root did not decode to an array");
    };
    assert_eq!(
        items,
        vec![Value::from("$1"), Value::from("$$"), Value::from("$"), Value::from("a$")]
    );
    Ok(())
}

#[test]
fn test_numeric_edges() -> Result<()> {
    let graph = Graph::new();
    let root = graph.array([
        Value::Number(f64::NAN),
        Value::Number(-0.0),
        Value::Number(0.0),
        Value::Number(f64::INFINITY),
        Value::Number(f64::NEG_INFINITY),
        Value::Number(1.5),
        Value::Number(1e300),
        Value::BigInt(i128::MAX),
        Value::BigInt(-12),
    ]);
    let text = encode_text(&graph, root.clone());
    assert!(text.starts_with("0:[\"$NaN\",\"$-0\",0,\"$Infinity\",\"$-Infinity\",1.5,"));
    assert!(text.contains("\"$n170141183460469231731687303715884105727\",\"$n-12\"]"));

    let (expected, actual) = roundtrip(&graph, root)?;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn test_leaf_kinds_survive() -> Result<()> {
    let graph = Graph::new();
    let root = graph.object([
        ("missing", Value::Undefined),
        ("when", Value::Date("2024-05-01T10:00:00.000Z".into())),
        ("sym", Value::Symbol("iterator".into())),
        ("tmp", Value::Temporary("t1".into())),
        ("client", Value::Client(ClientReference::new("./button.js", "Button"))),
        ("lazy", Value::Client(ClientReference::new("./chart.js", "default").asynchronous())),
        ("action", Value::Server(ServerReference::new("save").bind(vec![Value::from(1)]))),
        ("oops", Value::Error(ErrorInfo::named("TypeError", "$bad").with_frame("f", "a.js", 1, 2))),
    ]);
    let (expected, actual) = roundtrip(&graph, root)?;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn test_error_values_keep_their_fields() -> Result<()> {
    let graph = Graph::new();
    let error = ErrorInfo::named("RangeError", "$out of range")
        .with_frame("render", "page.js", 10, 4)
        .with_cause(ErrorInfo::new("inner"));
    let root = graph.array([Value::Error(error.clone())]);
    let (decoded, root) = Flight::decode(&Flight::encode(&graph, root)?)?;
    let item = decoded.field(&root, "0").expect("item missing");
    let Value::Error(info) = &item else {
        panic!("expected an error value, got {item:?}");
    };
    assert_eq!(info.name, "RangeError");
    assert_eq!(info.message, "$out of range");
    assert_eq!(info.stack, error.stack);
    assert_eq!(info.env.as_deref(), Some("Server"));
    assert_eq!(
        info.cause.as_ref().map(|cause| cause.message.as_str()),
        Some("inner")
    );
    Ok(())
}

#[test]
fn test_server_reference_bound_arguments() -> Result<()> {
    let graph = Graph::new();
    let root = graph.array([Value::Server(
        ServerReference::new("$action").bind(vec![Value::from("x"), Value::from(2)]),
    )]);
    let (decoded, root) = Flight::decode(&Flight::encode(&graph, root)?)?;
    let Some(Value::Server(reference)) = decoded.field(&root, "0") else {
        panic!("expected a server reference");
    };
    assert_eq!(reference.id, "$action");
    assert_eq!(reference.bound, Some(vec![Value::from("x"), Value::from(2)]));
    Ok(())
}

// --- IDENTITY ---

#[test]
fn test_self_cycle() -> Result<()> {
    let graph = Graph::new();
    let root = graph.object([("name", Value::from("loop")), ("me", Value::Null)]);
    let id = root.as_node().expect("object node");
    graph.set_slot(id, 1, root.clone())?;

    assert_eq!(
        encode_text(&graph, root.clone()),
        "0:{\"name\":\"loop\",\"me\":\"$0\"}\n"
    );
    let (expected, actual) = roundtrip(&graph, root)?;
    assert_eq!(
        actual,
        Shape::Object(vec![
            ("name".to_string(), Shape::Leaf("\"loop\"".to_string())),
            ("me".to_string(), Shape::BackRef(0)),
        ])
    );
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn test_shared_nodes_are_written_once() -> Result<()> {
    let graph = Graph::new();
    let shared = graph.object([("v", Value::from(1))]);
    let root = graph.object([("a", shared.clone()), ("b", shared)]);
    assert_eq!(
        encode_text(&graph, root.clone()),
        "0:{\"a\":{\"v\":1},\"b\":\"$0:a\"}\n"
    );

    let (decoded, root) = Flight::decode(&Flight::encode(&graph, root.clone())?)?;
    assert_eq!(decoded.field(&root, "a"), decoded.field(&root, "b"));
    Ok(())
}

#[test]
fn test_mutual_cycle_through_a_set() -> Result<()> {
    let graph = Graph::new();
    let parent = graph.object([("children", Value::Null)]);
    let child = graph.object([("parent", parent.clone())]);
    let children = graph.set([child]);
    graph.set_slot(parent.as_node().expect("node"), 0, children)?;

    let (expected, actual) = roundtrip(&graph, parent)?;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn test_maps_with_structured_keys() -> Result<()> {
    let graph = Graph::new();
    let key = graph.array([Value::from(1), Value::from(2)]);
    let root = graph.map([
        (key.clone(), Value::from("point")),
        (Value::Number(f64::NAN), key),
        (Value::Null, Value::Undefined),
    ]);
    let (expected, actual) = roundtrip(&graph, root)?;
    assert_eq!(expected, actual);
    Ok(())
}

// --- OUTLINING ---

#[test]
fn test_binary_payloads_use_their_own_rows() -> Result<()> {
    let graph = Graph::new();
    let root = graph.object([
        ("raw", Value::Bytes(TypedArray::uint8(vec![0u8, 10, 255]))),
        ("floats", Value::Bytes(TypedArray::float64(&[1.5, -2.0]))),
    ]);
    let bytes = Flight::encode(&graph, root.clone())?;
    assert!(bytes.starts_with(b"1:o3,\x00\x0a\xff2:g10,"));

    let (expected, actual) = roundtrip(&graph, root)?;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn test_large_strings_become_text_rows() -> Result<()> {
    let graph = Graph::new();
    let long = "é".repeat(1100);
    let root = graph.array([Value::from(long.clone()), Value::from(long.clone())]);
    let text = encode_text(&graph, root.clone());
    assert!(text.starts_with("1:T898,"));
    assert!(text.ends_with("0:[\"$1\",\"$2\"]\n"));

    let (decoded, root) = Flight::decode(text.as_bytes())?;
    assert_eq!(decoded.field(&root, "1"), Some(Value::from(long)));
    Ok(())
}

#[test]
fn test_string_threshold_counts_characters() {
    let graph = Graph::new();
    let text = "é".repeat(600);
    let root = graph.array([Value::from(text.clone())]);
    assert_eq!(encode_text(&graph, root), format!("0:[\"{text}\"]\n"));
}

#[test]
fn test_deep_and_wide_graphs_are_split() -> Result<()> {
    let graph = Graph::new();
    let mut deep = Value::from("leaf");
    for level in 0..12 {
        deep = graph.object([("level", Value::from(level)), ("next", deep)]);
    }
    let wide = graph.array((0..50).map(|i| graph.object([("i", Value::from(i))])));
    let root = graph.array([deep, wide]);

    let bytes = Flight::builder()
        .max_inline_depth(3)
        .max_row_size(64)
        .encode(&graph, root.clone())?;
    let rows = bytes.iter().filter(|b| **b == b'\n').count();
    assert!(rows > 5, "expected several rows, got {rows}");

    let (decoded, decoded_root) = Flight::decode(&bytes)?;
    assert_eq!(Shape::of(&graph, &root), Shape::of(&decoded, &decoded_root));
    Ok(())
}

#[test]
fn test_unencodable_root_becomes_error_row() {
    let graph = Graph::new();
    let root = graph.array([Value::Chunk(3)]);
    let text = encode_text(&graph, root.clone());
    assert!(text.starts_with("0:E{"), "{text}");

    let bytes = Flight::encode(&graph, root).expect("encode failed");
    let err = Flight::decode(&bytes).unwrap_err();
    assert!(matches!(err, flightwire::FlightError::Rejected(_)));
}

#[test]
fn test_deeply_nested_maps_and_sets() -> Result<()> {
    let graph = Graph::new();
    let mut value = Value::from("bottom");
    for level in 0..1_000 {
        value = if level % 2 == 0 {
            graph.map([(Value::from("k"), value)])
        } else {
            graph.set([value])
        };
    }
    let bytes = Flight::encode(&graph, value)?;

    let (decoded, mut current) = Flight::decode(&bytes)?;
    let mut depth = 0;
    while let Some(node) = current.as_node() {
        current = match decoded.get(node) {
            Some(Node::Map(entries)) => entries[0].1.clone(),
            Some(Node::Set(members)) => members[0].clone(),
            other => panic!("unexpected node at depth {depth}: {other:?}"),
        };
        depth += 1;
    }
    assert_eq!(depth, 1_000);
    assert_eq!(current, Value::from("bottom"));
    Ok(())
}
