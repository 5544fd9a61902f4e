// Criterion benchmarks for the remoting-common codec
//
// Run benchmarks with:
//   cargo bench -p remoting-common
//
// For detailed output with plots:
//   cargo bench -p remoting-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use remoting_common::transport::JsonCodec;
use remoting_common::{EventPacket, MethodCall, Packet, Ping};
use serde_json::json;

fn small_call() -> Packet {
    Packet::from(MethodCall::new(1, "echo", vec![json!({"value": 42})]))
}

fn large_call() -> Packet {
    let data: Vec<String> = (0..100).map(|i| format!("item_{}", i)).collect();
    Packet::from(MethodCall::new(1, "store", vec![json!({ "data": data })]))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");

    let small = small_call();
    let large = large_call();
    let event = Packet::from(EventPacket::compute_args("price", 7, json!({"v": 10, "ccy": "USD"})));
    let ping = Packet::from(Ping::now());

    group.bench_function("method_call_small", |b| {
        b.iter(|| JsonCodec::encode(black_box(&small)));
    });

    group.bench_function("method_call_large", |b| {
        b.iter(|| JsonCodec::encode(black_box(&large)));
    });

    group.bench_function("compute_args", |b| {
        b.iter(|| JsonCodec::encode(black_box(&event)));
    });

    group.bench_function("ping", |b| {
        b.iter(|| JsonCodec::encode(black_box(&ping)));
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    let small = JsonCodec::encode(&small_call()).unwrap();
    let large = JsonCodec::encode(&large_call()).unwrap();
    let broadcast =
        JsonCodec::encode(&Packet::from(EventPacket::broadcast("price", json!({"v": 10})))).unwrap();

    group.bench_function("method_call_small", |b| {
        b.iter(|| JsonCodec::decode(black_box(&small)));
    });

    group.bench_function("method_call_large", |b| {
        b.iter(|| JsonCodec::decode(black_box(&large)));
    });

    group.bench_function("broadcast", |b| {
        b.iter(|| JsonCodec::decode(black_box(&broadcast)));
    });

    group.finish();
}

fn bench_packet_cloning(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_cloning");

    let small = small_call();
    let large = large_call();

    group.bench_function("clone_small", |b| {
        b.iter(|| black_box(&small).clone());
    });

    group.bench_function("clone_large", |b| {
        b.iter(|| black_box(&large).clone());
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_packet_cloning);
criterion_main!(benches);
