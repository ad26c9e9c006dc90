//! Frame encoding/decoding benchmarks.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stompgate_protocol::{Command, Decoder, Encoder, Frame};

fn create_send_frame(payload_size: usize, with_length: bool) -> Frame {
    let body = Bytes::from("x".repeat(payload_size));
    let frame = Frame::new(Command::Send)
        .header("destination", "/queue/bench")
        .header("persistent", "true")
        .header("correlation-id", "bench-1");
    let frame = if with_length {
        frame.header("content-length", payload_size.to_string())
    } else {
        frame
    };
    frame.body(body)
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [100, 1000, 10000] {
        let frame = create_send_frame(size, true);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(Encoder::encode(frame)));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    for (name, with_length) in [
        ("frame_decode_content_length", true),
        ("frame_decode_null_terminated", false),
    ] {
        let mut group = c.benchmark_group(name);

        for size in [100, 1000, 10000] {
            let encoded = Encoder::encode(&create_send_frame(size, with_length));

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
                b.iter(|| {
                    let mut decoder = Decoder::new();
                    decoder.extend(encoded);
                    black_box(decoder.decode_frame().unwrap())
                });
            });
        }

        group.finish();
    }
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_chunked");
    let encoded = Encoder::encode(&create_send_frame(10000, false));

    for chunk in [16, 256, 4096] {
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                let mut decoded = None;
                for piece in encoded.chunks(chunk) {
                    decoder.extend(piece);
                    if let Some(frame) = decoder.decode_frame().unwrap() {
                        decoded = Some(frame);
                    }
                }
                black_box(decoded)
            });
        });
    }

    group.finish();
}

fn bench_batch_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode_batch");

    for count in [10, 100] {
        let mut batch = Vec::new();
        for _ in 0..count {
            batch.extend_from_slice(&Encoder::encode(&create_send_frame(100, true)));
            // heart-beat between frames
            batch.push(b'\n');
        }

        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &batch, |b, batch| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(batch);
                let mut frames = 0;
                while let Some(frame) = decoder.decode_frame().unwrap() {
                    black_box(frame);
                    frames += 1;
                }
                frames
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_chunked_decode,
    bench_batch_decode,
);
criterion_main!(benches);
