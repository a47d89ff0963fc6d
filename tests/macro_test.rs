#![allow(missing_docs)]

use flightwire::{Flight, FlightModel, Graph, IntoModel, Shape, Value};
use std::collections::BTreeMap;

#[derive(FlightModel)]
struct User {
    id: u32,
    #[flight(rename = "displayName")]
    name: String,
    #[flight(skip)]
    #[allow(dead_code)]
    cache: Vec<u8>,
    #[flight(bytes)]
    avatar: Vec<u8>,
    tags: Vec<String>,
    manager: Option<Box<User>>,
}

#[derive(FlightModel)]
struct Pair(i32, &'static str);

#[derive(FlightModel)]
struct Marker;

#[derive(FlightModel)]
struct Labeled<T: IntoModel> {
    r#type: &'static str,
    inner: T,
}

#[derive(FlightModel)]
struct Scores {
    by_name: BTreeMap<String, i64>,
    total: Option<f64>,
}

#[test]
fn test_macro_ergonomics() {
    let user = User {
        id: 1,
        name: "ada".into(),
        cache: vec![0xAA; 64],
        avatar: vec![1, 2],
        tags: vec!["admin".into()],
        manager: None,
    };
    let graph = Graph::new();
    let root = user.into_model(&graph);
    let bytes = Flight::encode(&graph, root).expect("encode failed");
    assert_eq!(
        bytes,
        b"1:o2,\x01\x020:{\"id\":1,\"displayName\":\"ada\",\"avatar\":\"$1\",\"tags\":[\"admin\"],\"manager\":null}\n"
            .to_vec()
    );
}

#[test]
fn test_nested_models_roundtrip() {
    let boss = User {
        id: 1,
        name: "grace".into(),
        cache: Vec::new(),
        avatar: Vec::new(),
        tags: Vec::new(),
        manager: None,
    };
    let user = User {
        id: 2,
        name: "ada".into(),
        cache: Vec::new(),
        avatar: vec![7],
        tags: vec!["a".into(), "b".into()],
        manager: Some(Box::new(boss)),
    };
    let graph = Graph::new();
    let root = user.into_model(&graph);
    let expected = Shape::of(&graph, &root);

    let (decoded, decoded_root) =
        Flight::decode(&Flight::encode(&graph, root).expect("encode failed")).expect("decode failed");
    assert_eq!(expected, Shape::of(&decoded, &decoded_root));

    let manager = decoded.field(&decoded_root, "manager").expect("manager");
    assert_eq!(decoded.field(&manager, "displayName"), Some(Value::from("grace")));
}

#[test]
fn test_tuple_and_unit_structs() {
    let graph = Graph::new();
    let pair = Pair(4, "four").into_model(&graph);
    assert_eq!(
        Flight::encode(&graph, pair).expect("encode failed"),
        b"0:[4,\"four\"]\n".to_vec()
    );

    let marker = Marker.into_model(&graph);
    assert_eq!(
        Flight::encode(&graph, marker).expect("encode failed"),
        b"0:{}\n".to_vec()
    );
}

#[test]
fn test_generic_and_raw_identifier_fields() {
    let graph = Graph::new();
    let labeled = Labeled {
        r#type: "pair",
        inner: Pair(1, "one"),
    }
    .into_model(&graph);
    assert_eq!(
        Flight::encode(&graph, labeled).expect("encode failed"),
        b"0:{\"type\":\"pair\",\"inner\":[1,\"one\"]}\n".to_vec()
    );
}

#[test]
fn test_collections_become_maps() {
    let mut by_name = BTreeMap::new();
    by_name.insert("ada".to_string(), 3);
    by_name.insert("bob".to_string(), -1);
    let scores = Scores {
        by_name,
        total: Some(2.5),
    };
    let graph = Graph::new();
    let root = scores.into_model(&graph);
    let expected = Shape::of(&graph, &root);

    let (decoded, decoded_root) =
        Flight::decode(&Flight::encode(&graph, root).expect("encode failed")).expect("decode failed");
    assert_eq!(expected, Shape::of(&decoded, &decoded_root));
    assert_eq!(decoded.field(&decoded_root, "total"), Some(Value::Number(2.5)));
}
