//! Criterion benchmark untuk Strand
//!
//! Run dengan: cargo bench --bench strand_bench

use std::sync::Arc;

use courier::core::{ExecutionContext, Strand, ThreadPool};
use courier::StrandConfig;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn bench_strand(c: &mut Criterion) {
    let mut group = c.benchmark_group("strand");
    let pool: Arc<dyn ExecutionContext> = Arc::new(ThreadPool::new(4).unwrap());

    group.throughput(Throughput::Elements(1));
    group.bench_function("async_call_wait", |b| {
        let strand = Strand::with_config(pool.clone(), StrandConfig::default());
        b.iter(|| strand.async_call(|| {}).wait());
    });

    for batch_size in [100usize, 10_000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("post_batch_{}", batch_size), |b| {
            let strand = Strand::with_config(pool.clone(), StrandConfig::default());
            b.iter(|| {
                for _ in 0..batch_size - 1 {
                    strand.post(|| {});
                }
                // FIFO: task terakhir selesai berarti semua selesai
                strand.async_call(|| {}).wait()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_strand);
criterion_main!(benches);
