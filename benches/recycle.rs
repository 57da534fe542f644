use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::BytesMut;
use recycler::{Pool, PoolConfig};

/// Benchmark single-threaded get/recycle churn
fn bench_same_thread_churn(c: &mut Criterion) {
    let pool = Pool::new(|| 0u64);

    let mut group = c.benchmark_group("same_thread_churn");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_recycle", |b| {
        b.iter(|| {
            let mut item = pool.get();
            *item += 1;
            black_box(*item);
        })
    });

    group.finish();
}

/// Benchmark the disabled-pool baseline (every get allocates)
fn bench_pool_disabled(c: &mut Criterion) {
    let pool = Pool::with_config(PoolConfig::disabled(), || 0u64);

    let mut group = c.benchmark_group("pool_disabled");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_alloc", |b| {
        b.iter(|| {
            let mut item = pool.get();
            *item += 1;
            black_box(*item);
        })
    });

    group.finish();
}

/// Benchmark buffer reuse, the pool's typical payload
fn bench_buffer_churn(c: &mut Criterion) {
    let pool = Pool::new(|| BytesMut::with_capacity(8192));

    let mut group = c.benchmark_group("buffer_churn");
    group.throughput(Throughput::Elements(1));

    group.bench_function("pooled_buffer", |b| {
        b.iter(|| {
            let mut buf = pool.get();
            buf.clear();
            buf.extend_from_slice(b"PING\r\n");
            black_box(buf.len());
        })
    });

    group.bench_function("fresh_buffer", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(8192);
            buf.extend_from_slice(b"PING\r\n");
            black_box(buf.len());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_same_thread_churn,
    bench_pool_disabled,
    bench_buffer_churn
);
criterion_main!(benches);
