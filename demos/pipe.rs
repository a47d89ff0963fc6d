//! Example: Piping a Live Graph Between a Request and a Response
//!
//! A producer thread settles a deferred value and pushes stream items while
//! the main thread drives the request. Every batch of rows is handed to a
//! response as soon as it is written, the way a transport would deliver it.
//!
//! Run with `RUST_LOG=flightwire=trace` to watch the scheduler.

#![allow(missing_docs)]

use flightwire::{
    Deferred, ErrorInfo, Graph, MemorySink, Read, Request, RequestStatus, Response, StreamKind,
    Value, stream_channel,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("--- flightwire Pipe Example ---");

    // 1. Build a graph with a value that is not ready yet and a stream.
    let graph = Graph::new();
    let profile = Deferred::new();
    let (feed, handle) = stream_channel(StreamKind::Readable);
    let missing = Deferred::new();
    let root = graph.object([
        ("title", Value::from("dashboard")),
        ("profile", Value::Deferred(profile.clone())),
        ("feed", Value::Stream(handle)),
        ("missing", Value::Deferred(missing.clone())),
    ]);

    // 2. Wake the main loop whenever a task is pinged.
    let mut request = Request::new(graph.clone(), root);
    let (wake, woken) = mpsc::channel::<()>();
    request.ping_queue().set_notify(move || {
        let _ = wake.send(());
    });
    let sink = MemorySink::new();
    request.start_flowing(sink.clone());

    // 3. Produce from another thread.
    let producer = thread::spawn({
        let graph = graph.clone();
        move || -> flightwire::Result<()> {
            thread::sleep(Duration::from_millis(20));
            profile.resolve(graph.object([("name", Value::from("Ada"))]));
            for i in 0..3 {
                thread::sleep(Duration::from_millis(10));
                feed.send(Value::from(format!("event {i}")))?;
            }
            feed.close()?;
            missing.reject(ErrorInfo::named("NotFound", "no such widget"));
            Ok(())
        }
    });

    // 4. Drive the request and decode as rows arrive.
    let mut response = Response::new();
    let mut delivered = 0;
    loop {
        request.perform_work();
        let written = sink.contents();
        if written.len() > delivered {
            println!("<- {:?}", String::from_utf8_lossy(&written[delivered..]));
            response.ingest(&written[delivered..]);
            delivered = written.len();
        }
        if request.status() == RequestStatus::Closed {
            break;
        }
        if !request.has_pending_work() {
            woken.recv_timeout(Duration::from_secs(1))?;
        }
    }
    producer.join().map_err(|_| "producer thread panicked")??;
    response.close();

    // 5. Inspect what the consumer saw.
    let root = response.root_value()?;
    let decoded = response.graph();
    println!("title:   {:?}", decoded.field(&root, "title"));

    if let Some(Value::Chunk(id)) = decoded.field(&root, "profile")
        && let Read::Ready(profile) = response.read(id)
    {
        println!("profile: {:?}", decoded.field(profile, "name"));
    }
    if let Some(Value::Chunk(id)) = decoded.field(&root, "missing")
        && let Read::Failed(error) = response.read(id)
    {
        println!("missing: {error}");
    }
    if let Some(stream) = decoded
        .field(&root, "feed")
        .and_then(|feed| feed.as_node())
        .and_then(|node| decoded.get(node))
    {
        println!("feed:    {stream:?}");
    }
    Ok(())
}
