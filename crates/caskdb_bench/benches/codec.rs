//! Entry and hint codec benchmarks.

use caskdb_bench::random_data;
use caskdb_core::codec::{
    decode_entry, decode_entry_header, decode_hint, encode_entry, encode_hint, HEADER_SIZE,
    HINT_HEADER_SIZE,
};
use caskdb_core::Timestamp;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark entry encoding.
fn bench_encode_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_entry");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let value = random_data(size);
            b.iter(|| {
                let bytes =
                    encode_entry(black_box(b"user:12345"), black_box(&value), Timestamp::new(1))
                        .unwrap();
                black_box(bytes);
            });
        });
    }
    group.finish();
}

/// Benchmark entry decoding, checksum verification included.
fn bench_decode_entry(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_entry");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let bytes = encode_entry(b"user:12345", &random_data(size), Timestamp::new(1)).unwrap();
            b.iter(|| {
                let entry = decode_entry(black_box(&bytes)).unwrap();
                black_box(entry);
            });
        });
    }
    group.finish();
}

/// Benchmark header-only decoding.
fn bench_decode_headers(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_header");

    group.bench_function("entry", |b| {
        let bytes = encode_entry(b"user:12345", b"value", Timestamp::new(1)).unwrap();
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        b.iter(|| black_box(decode_entry_header(black_box(&header))));
    });

    group.bench_function("hint", |b| {
        let bytes = encode_hint(Timestamp::new(1), b"user:12345", 5, false, 4096).unwrap();
        let mut header = [0u8; HINT_HEADER_SIZE];
        header.copy_from_slice(&bytes[..HINT_HEADER_SIZE]);
        b.iter(|| black_box(decode_hint(black_box(&header))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_entry,
    bench_decode_entry,
    bench_decode_headers,
);

criterion_main!(benches);
