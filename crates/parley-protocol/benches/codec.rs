//! Codec benchmarks for parley-protocol.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use parley_protocol::{codec, MessageView, ServerEvent};

fn bench_decode_send_message(c: &mut Criterion) {
    let frame = format!(r#"{{"type":"send_message","message":"{}"}}"#, "x".repeat(64));

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("send_message_64B", |b| {
        b.iter(|| codec::decode(black_box(&frame)))
    });
    group.finish();
}

fn bench_encode_new_message(c: &mut Criterion) {
    let event = ServerEvent::NewMessage {
        message: MessageView {
            id: "6f1c2e4a-0000-4000-8000-000000000000".into(),
            user_id: "user-1".into(),
            username: "alice".into(),
            content: "x".repeat(256),
            timestamp: Utc::now(),
        },
    };

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(256));
    group.bench_function("new_message_256B", |b| {
        b.iter(|| codec::encode(black_box(&event)))
    });
    group.finish();
}

criterion_group!(benches, bench_decode_send_message, bench_encode_new_message);
criterion_main!(benches);
