// SPDX-License-Identifier: MIT
//
// Shared-memory copy benchmarks.
//
// Run with:
//   cargo bench --bench segment_rw
//
// Groups:
//   segment_write — source slice into the mapped region
//   segment_read  — mapped region into a caller buffer
//   mutex_cycle   — uncontended wait/release round trip

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use filemap::{wait, NamedMutex, SharedMemorySegment};

const SIZES: &[(&str, usize)] = &[
    ("small_64", 64),
    ("medium_4k", 4096),
    ("large_256k", 256 * 1024),
];

const REGION: u32 = 512 * 1024;

fn unique_name(prefix: &str) -> String {
    format!("bench_{prefix}_{}", std::process::id())
}

fn bench_write(c: &mut Criterion) {
    let name = unique_name("write");
    SharedMemorySegment::remove(&name);
    let mut seg = SharedMemorySegment::new();
    seg.create(None, &name, REGION).expect("create");

    let mut group = c.benchmark_group("segment_write");
    for &(label, size) in SIZES {
        let src = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                seg.write(0, black_box(&src), 0, sz as u32).expect("write");
            });
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let name = unique_name("read");
    SharedMemorySegment::remove(&name);
    let mut seg = SharedMemorySegment::new();
    seg.create(None, &name, REGION).expect("create");
    let fill = vec![0xCDu8; REGION as usize];
    seg.write(0, &fill, 0, REGION).expect("fill");

    let mut group = c.benchmark_group("segment_read");
    for &(label, size) in SIZES {
        let mut dst = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                seg.read(0, sz as u32, black_box(&mut dst)).expect("read");
            });
        });
    }
    group.finish();
}

fn bench_mutex_cycle(c: &mut Criterion) {
    let name = unique_name("cycle");
    NamedMutex::remove(&name);
    let mut m = NamedMutex::new();
    m.create(&name).expect("create");

    let mut group = c.benchmark_group("mutex_cycle");
    group.bench_function("wait_release", |b| {
        b.iter(|| {
            let outcome = m.wait(wait::INFINITE).expect("wait");
            black_box(outcome);
            m.release().expect("release");
        });
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_read, bench_mutex_cycle);
criterion_main!(benches);
