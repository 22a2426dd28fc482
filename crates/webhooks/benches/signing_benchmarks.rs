use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use serde_json::json;
use streamhook_core::{EventId, StreamId};
use streamhook_events::{Event, NewEvent, Payload};
use streamhook_webhooks::{sign, WebhookPayload};

fn event_with_fields(fields: usize) -> Event {
    let mut data = Payload::new();
    for i in 0..fields {
        data.insert(format!("field_{i}"), json!({"value": i, "label": "x".repeat(16)}));
    }
    let new = NewEvent::new(StreamId::new("bench").unwrap(), "bench.event", "criterion", data);
    Event::committed(new, EventId::new(), Utc::now(), 1)
}

fn bench_payload_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_encoding");
    for fields in [1usize, 16, 256] {
        let event = event_with_fields(fields);
        group.bench_with_input(BenchmarkId::from_parameter(fields), &event, |b, event| {
            b.iter(|| WebhookPayload::from_event(black_box(event)).to_bytes().unwrap())
        });
    }
    group.finish();
}

fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hmac_sha256_signing");
    for size in [256usize, 4 * 1024, 64 * 1024] {
        let body = vec![b'a'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| sign(black_box(body), black_box("whsec_benchmark")).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_payload_encoding, bench_signing);
criterion_main!(benches);
