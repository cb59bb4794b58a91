use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::time::Instant;
use stomp_load_test::stomp::formatter::{encode_connect, encode_send_at, encode_subscribe};
use stomp_load_test::stomp::message::{extract_key, make_key, probe_content};
use stomp_load_test::stomp::parser::{decode_notification, parse_frame};
use stomp_load_test::tracker::LatencyTracker;

/// ブローカーから届く MESSAGE フレームのサンプル
const NOTIFICATION: &str = "MESSAGE\n\
destination:/topic/chat/room/42\n\
content-type:application/json\n\
subscription:sub-1\n\
message-id:abc-1\n\
\n\
{\"roomId\":42,\"senderId\":7,\"type\":\"TEXT\",\"content\":\"[W3-N7] Test message from worker 3\",\"fileUrl\":null,\"fileName\":null,\"fileSize\":null,\"createdAt\":\"2025-01-01T00:00:00.123456789Z\"}\0";

/// CONNECTED フレームのサンプル
const CONNECTED: &str = "CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0";

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_frame");

    group.bench_function("parse_connected", |b| {
        b.iter(|| parse_frame(criterion::black_box(CONNECTED)))
    });

    group.bench_function("parse_message", |b| {
        b.iter(|| parse_frame(criterion::black_box(NOTIFICATION)))
    });

    group.bench_function("decode_notification", |b| {
        b.iter(|| decode_notification(criterion::black_box(NOTIFICATION)))
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    group.bench_function("encode_connect", |b| {
        b.iter(|| encode_connect(criterion::black_box("token-abc")))
    });

    group.bench_function("encode_subscribe", |b| {
        b.iter(|| encode_subscribe(criterion::black_box(3), "token-abc", 42))
    });

    group.bench_function("encode_send", |b| {
        let content = probe_content(&make_key(3, 7), 3);
        b.iter(|| encode_send_at("token-abc", 42, 7, criterion::black_box(&content), created_at))
    });

    group.finish();
}

fn bench_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation");
    let content = probe_content(&make_key(3, 7), 3);

    group.bench_function("make_key", |b| {
        b.iter(|| make_key(criterion::black_box(12345), criterion::black_box(678)))
    });

    group.bench_function("extract_key", |b| {
        b.iter(|| extract_key(criterion::black_box(&content)))
    });

    group.bench_function("tracker_record_resolve", |b| {
        let tracker = LatencyTracker::new();
        let mut nonce = 0u64;
        b.iter(|| {
            nonce += 1;
            let key = make_key(1, nonce);
            tracker.record(key.clone(), Instant::now());
            tracker.resolve(&key)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode, bench_correlation);
criterion_main!(benches);
