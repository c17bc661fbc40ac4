// benches/dispatch_bench.rs
//! Benchmarks for the response hot path: end-marker scanning and classification

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sandbox_pool::runtime::dispatch::find_end_marker;
use sandbox_pool::runtime::executor::classify;

fn response_of_len(len: usize) -> Vec<u8> {
    let mut payload = b"RUN_RESULT\n".to_vec();
    payload.extend(std::iter::repeat(b'x').take(len));
    payload.extend_from_slice(b"\n__END__\n");
    payload
}

fn bench_find_end_marker(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_end_marker");

    for size in [64usize, 4096, 65536] {
        let payload = response_of_len(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(find_end_marker(black_box(payload))));
        });
    }

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    let cases = [
        ("run_result", "RUN_RESULT\nOVERALL_RESULT: PASSED\n"),
        ("compile_error", "COMPILE_ERROR\nMain.java:3: error: ';' expected\n"),
        ("runtime_error", "RUNTIME_ERROR\njava.lang.NullPointerException\n"),
        ("timeout", "TIMEOUT"),
        ("garbage", "something unexpected"),
    ];

    for (name, raw) in cases {
        group.bench_function(name, |b| {
            b.iter(|| black_box(classify(black_box(raw))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_find_end_marker, bench_classify);
criterion_main!(benches);
