//! Flow throughput benchmark.
//!
//! Measures instigation-to-completion latency for chains of jobs, and
//! compares the inline passive team against a worker pool, using Criterion.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;
use tokio::runtime::Runtime;

use foreman_core::kernel::{
    FnFunction, FunctionMeta, KernelBuilder, PassiveTeamFactory, TeamFactory, WorkerTeamFactory,
};
use foreman_core::types::{FunctionId, TeamId};
use foreman_core::{Kernel, ProcessHandle};

/// Build an opened kernel holding a `depth`-long chain of no-op functions.
fn chain_kernel(
    rt: &Runtime,
    team_factory: Arc<dyn TeamFactory>,
    size: usize,
    depth: usize,
) -> (Kernel, ProcessHandle) {
    rt.block_on(async {
        let mut builder =
            KernelBuilder::new().add_team(TeamId::must("bench"), size, team_factory);
        for index in 0..depth {
            let mut meta = FunctionMeta::new(FunctionId::must(&format!("step{index}")));
            if index + 1 < depth {
                meta = meta.then(FunctionId::must(&format!("step{}", index + 1)));
            }
            builder = builder.add_function(meta, FnFunction::new(|_| Ok(())));
        }
        let kernel = builder.build().unwrap();
        kernel.open().await.unwrap();
        let process = kernel.create_process();
        (kernel, process)
    })
}

async fn run_chain(process: &ProcessHandle, argument: Value) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    process
        .instigate_with_callback(
            FunctionId::must("step0"),
            argument,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await
        .unwrap();
    rx.await.unwrap().unwrap();
}

fn bench_chain_depth(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let depths: &[usize] = &[1, 4, 16];

    let mut group = c.benchmark_group("passive_chain");
    for &depth in depths {
        let (_kernel, process) = chain_kernel(&rt, Arc::new(PassiveTeamFactory), 1, depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &process, |b, p| {
            b.iter(|| rt.block_on(run_chain(p, black_box(Value::Null))));
        });
    }
    group.finish();
}

fn bench_team_models(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    const DEPTH: usize = 8;

    let mut group = c.benchmark_group("team_models");
    let (_passive, process) = chain_kernel(&rt, Arc::new(PassiveTeamFactory), 1, DEPTH);
    group.bench_function("passive", |b| {
        b.iter(|| rt.block_on(run_chain(&process, black_box(Value::Null))));
    });
    let (_pool, process) = chain_kernel(&rt, Arc::new(WorkerTeamFactory), 4, DEPTH);
    group.bench_function("worker_pool_4", |b| {
        b.iter(|| rt.block_on(run_chain(&process, black_box(Value::Null))));
    });
    group.finish();
}

fn bench_sequential_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    const CHILDREN: usize = 16;

    let (_kernel, process) = rt.block_on(async {
        let mut builder =
            KernelBuilder::new().add_team(TeamId::must("bench"), 1, Arc::new(PassiveTeamFactory));
        builder = builder.add_function(
            FunctionMeta::new(FunctionId::must("child")),
            FnFunction::new(|_| Ok(())),
        );
        builder = builder.add_function(
            FunctionMeta::new(FunctionId::must("fanout")),
            FnFunction::new(|ctx| {
                for _ in 0..CHILDREN {
                    ctx.instigate_sequential(FunctionId::must("child"), Value::Null);
                }
                Ok(())
            }),
        );
        let kernel = builder.build().unwrap();
        kernel.open().await.unwrap();
        let process = kernel.create_process();
        (kernel, process)
    });

    c.bench_function("sequential_fanout_16", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (tx, rx) = tokio::sync::oneshot::channel();
                process
                    .instigate_with_callback(
                        FunctionId::must("fanout"),
                        black_box(Value::Null),
                        Box::new(move |result| {
                            let _ = tx.send(result);
                        }),
                    )
                    .await
                    .unwrap();
                rx.await.unwrap().unwrap()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_chain_depth,
    bench_team_models,
    bench_sequential_fanout
);
criterion_main!(benches);
