use core::{hint::black_box, num::NonZeroUsize};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::StreamExt;
use orbiter::{
    ComputeError, ComputeProvider, DispatchOptions, Pipeline, PoolConfig, PoolKind, ResultBatcher,
    WorkerPool,
};
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

/// Burns a fixed number of floating point iterations per item.
struct Spin;

impl ComputeProvider for Spin {
    type Input = u64;
    type Params = u32;
    type Output = f64;

    fn compute(&self, input: &u64, rounds: &u32) -> Result<f64, ComputeError> {
        let mut x = *input as f64;
        for _ in 0..*rounds {
            x = (x * 1.000_001).sin().mul_add(0.5, x.cos());
        }
        Ok(x)
    }
}

#[derive(Clone, Copy, Debug)]
struct DispatchBenchParams {
    items: u64,
    concurrency: usize,
    batch: usize,
    kind: PoolKind,
}

fn dispatch_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    let mut cases = Vec::new();
    for kind in [PoolKind::Fixed, PoolKind::Elastic] {
        for concurrency in [8, 32, 64] {
            for batch in [50, 200] {
                cases.push(DispatchBenchParams {
                    items: 10_000,
                    concurrency,
                    batch,
                    kind,
                });
            }
        }
    }

    for params in &cases {
        let pool = rt.block_on(async {
            Arc::new(
                WorkerPool::new(PoolConfig {
                    kind: params.kind,
                    admission_timeout: None,
                    ..PoolConfig::default()
                })
                .unwrap(),
            )
        });
        let pipeline = Pipeline::new(
            Arc::new(Spin),
            Arc::clone(&pool),
            DispatchOptions::default()
                .with_max_concurrency(NonZeroUsize::new(params.concurrency).unwrap()),
        );
        let batcher = ResultBatcher::fixed(NonZeroUsize::new(params.batch).unwrap());

        let mut group = c.benchmark_group("dispatch/stream_bulk");
        group.throughput(Throughput::Elements(params.items));
        group.bench_function(
            format!(
                "kind/{:?}/conc/{}/batch/{}",
                params.kind, params.concurrency, params.batch
            ),
            |b| {
                b.to_async(&rt).iter(|| {
                    let pipeline = pipeline.clone();
                    async move {
                        let mut batches = pipeline.stream_bulk(
                            (0..params.items).collect(),
                            64,
                            batcher,
                            CancellationToken::new(),
                        );
                        while let Some(batch) = batches.next().await {
                            black_box(batch.unwrap());
                        }
                    }
                });
            },
        );
        group.finish();

        rt.block_on(pool.shutdown()).unwrap();
    }
}

criterion_group!(dispatch_benches, dispatch_bench);
criterion_main!(dispatch_benches);
