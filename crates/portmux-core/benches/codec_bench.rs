//! Criterion benchmarks for the PortMux binary codec.
//!
//! Measures encoding and reassembly throughput for the frame shapes the
//! tunnel produces in steady state: small control frames and DATA frames at
//! typical socket-read sizes.
//!
//! Run with:
//! ```bash
//! cargo bench --package portmux-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use portmux_core::{encode_frame, Frame, FrameDecoder};

// ── Frame fixtures ────────────────────────────────────────────────────────────

fn make_connect() -> Frame {
    Frame::connect(42)
}

fn make_disconnect() -> Frame {
    Frame::disconnect(42)
}

fn make_data(len: usize) -> Frame {
    Frame::data(42, &vec![0xA5; len]).expect("fixture within frame limit")
}

fn make_link_up() -> Frame {
    Frame::link_up(8000)
}

// ── Encode benchmarks ─────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    group.bench_function("connect", |b| {
        let frame = make_connect();
        b.iter(|| encode_frame(black_box(&frame)).unwrap());
    });
    group.bench_function("disconnect", |b| {
        let frame = make_disconnect();
        b.iter(|| encode_frame(black_box(&frame)).unwrap());
    });
    group.bench_function("link_up", |b| {
        let frame = make_link_up();
        b.iter(|| encode_frame(black_box(&frame)).unwrap());
    });

    for len in [64usize, 1024, 8192, 65000] {
        group.bench_with_input(BenchmarkId::new("data", len), &len, |b, &len| {
            let frame = make_data(len);
            b.iter(|| encode_frame(black_box(&frame)).unwrap());
        });
    }

    group.finish();
}

// ── Reassembly benchmarks ─────────────────────────────────────────────────────

/// Feeds a pre-serialized burst of DATA frames in transport-read-sized
/// chunks, mimicking the reader loop's steady state.
fn bench_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed");

    let mut stream = Vec::new();
    for _ in 0..100 {
        stream.extend(encode_frame(&make_data(1024)).unwrap());
    }

    for chunk_size in [512usize, 4096, 16384] {
        group.bench_with_input(
            BenchmarkId::new("data_burst", chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut decoder = FrameDecoder::new();
                    let mut count = 0;
                    for chunk in stream.chunks(chunk_size) {
                        count += decoder.feed(black_box(chunk)).len();
                    }
                    count
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_feed);
criterion_main!(benches);
