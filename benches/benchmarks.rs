use criterion::{black_box, criterion_group, criterion_main, Criterion};
use guestlink::bridge::{EndpointId, Envelope, ObservableValue};
use guestlink::transport::Buffer;
use serde_json::json;

/// Envelope encode/decode, the per-message cost of byte-stream transports
fn benchmark_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    let envelope = Envelope::request(
        "guestlinkStateChanged",
        42,
        EndpointId::new(),
        json!({"name": "panelState", "value": {"kind": "floating", "width": 400, "height": 600}}),
    );
    let encoded = envelope.to_json().unwrap();

    group.bench_function("to_json", |b| b.iter(|| black_box(&envelope).to_json().unwrap()));
    group.bench_function("from_json", |b| {
        b.iter(|| Envelope::from_json(black_box(&encoded)).unwrap())
    });

    let screenshot = Buffer::from(vec![0x5au8; 64 * 1024]);
    group.bench_function("buffer_payload_64k", |b| {
        b.iter(|| serde_json::to_value(black_box(&screenshot)).unwrap())
    });

    group.finish();
}

/// Broadcast to many subscribers
fn benchmark_observable(c: &mut Criterion) {
    let mut group = c.benchmark_group("observable");

    let value = ObservableValue::with_value(0u64);
    for _ in 0..100 {
        value.subscribe(|v| {
            black_box(v);
        });
    }
    let mut next = 0u64;
    group.bench_function("assign_and_signal_100", |b| {
        b.iter(|| {
            next += 1;
            value.assign_and_signal(next)
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_envelope, benchmark_observable);
criterion_main!(benches);
