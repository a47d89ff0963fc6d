#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use flightwire::{Flight, FlightModel, Graph, IntoModel, Response, Value};
use std::hint::black_box;

#[derive(FlightModel)]
struct BenchItem {
    id: u32,
    name: String,
    #[flight(bytes)]
    payload: Vec<u8>,
    scores: Vec<f64>,
}

fn generate_graph(count: usize) -> (Graph, Value) {
    let graph = Graph::new();
    let shared = graph.object([("kind", Value::from("shared"))]);
    let items: Vec<Value> = (0..count)
        .map(|i| {
            let item = BenchItem {
                id: i as u32,
                name: format!("item-{i}"),
                payload: vec![i as u8; 256],
                scores: vec![i as f64 * 0.5; 16],
            }
            .into_model(&graph);
            graph.array([item, shared.clone()])
        })
        .collect();
    let root = graph.array(items);
    (graph, root)
}

// --- BENCHMARKS ---

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Encode");
    for count in [100, 1_000, 10_000] {
        let (graph, root) = generate_graph(count);
        let size = Flight::encode(&graph, root.clone()).map(|b| b.len()).unwrap_or(0);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| Flight::encode(black_box(&graph), root.clone()).expect("encode failed"))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Decode");
    for count in [100, 1_000, 10_000] {
        let (graph, root) = generate_graph(count);
        let bytes = Flight::encode(&graph, root).expect("encode failed");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole", count), &bytes, |b, bytes| {
            b.iter(|| Flight::decode(black_box(bytes)).expect("decode failed"))
        });
        // Transport-sized pieces exercise the framing state machine.
        group.bench_with_input(BenchmarkId::new("4k_pieces", count), &bytes, |b, bytes| {
            b.iter(|| {
                let mut response = Response::new();
                for piece in bytes.chunks(4096) {
                    response.ingest(black_box(piece));
                }
                response.close();
                response.pending_chunks()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
