//! Criterion benchmark untuk codec dan framing
//!
//! Run dengan: cargo bench --bench codec_bench

use bytes::Bytes;
use courier::network::{FrameDecoder, OutgoingFrame};
use courier::protocol::{decode_value, encode_value, Message, Type, Value};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn sample_value() -> Value {
    Value::list(vec![
        Value::map(vec![
            (Value::from("id"), Value::Int64(42)),
            (Value::from("price"), Value::Int64(1_000_000)),
        ]),
        Value::map(vec![
            (Value::from("id"), Value::Int64(43)),
            (Value::from("price"), Value::Int64(999_999)),
        ]),
    ])
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    let value = sample_value();
    group.bench_function("encode", |b| {
        b.iter(|| encode_value(black_box(&value)));
    });

    let (buffer, signature) = encode_value(&value).unwrap();
    let ty = Type::parse(signature.as_str()).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| decode_value(black_box(&buffer), &ty));
    });

    // Raw besar: sub-buffer vs copy
    for size in [1024usize, 64 * 1024] {
        let raw = Value::Raw(Bytes::from(vec![0xABu8; size]));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_raw_{}", size), |b| {
            b.iter(|| encode_value(black_box(&raw)));
        });
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let mut message = Message::call(1, 2, 3);
    message.set_value(&sample_value()).unwrap();
    let wire = message.to_bytes();

    for batch_size in [1usize, 100] {
        let stream: Vec<u8> = wire.repeat(batch_size);
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("reassemble_{}", batch_size), |b| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new(1024 * 1024);
                decoder.feed(black_box(&stream));
                let mut count = 0;
                while let Ok(Some(msg)) = decoder.next_message() {
                    black_box(msg);
                    count += 1;
                }
                count
            });
        });
    }

    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("write_frame", |b| {
        let mut out = Vec::with_capacity(wire.len());
        b.iter(|| {
            out.clear();
            let mut frame = OutgoingFrame::new(message.clone());
            while !frame.is_complete() {
                let _ = frame.write_to(&mut out);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_framing);
criterion_main!(benches);
