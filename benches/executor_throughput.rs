// benches/executor_throughput.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Throughput of the fork-join executor's two dispatch primitives under a
//! trivial compute function, isolating rendezvous/stealing overhead from
//! GEMM cost.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use numa_moe_exec::executor::{Executor, WorkerCount};
use numa_moe_exec::topology::Topology;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bench_do_work(c: &mut Criterion) {
    let topology = Topology::detect_or_abort();
    let mut group = c.benchmark_group("do_work");
    for &task_count in &[1_000usize, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(task_count), &task_count, |b, &n| {
            let executor = Executor::new(&topology).expect("executor construction");
            let counter = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                let counter = Arc::clone(&counter);
                executor.do_work(n, executor.num_workers(), move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            });
        });
    }
    group.finish();
}

fn bench_do_k_work_stealing_job(c: &mut Criterion) {
    let topology = Topology::detect_or_abort();
    let mut group = c.benchmark_group("do_k_work_stealing_job");
    for &nth in &[16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(nth), &nth, |b, &nth| {
            let executor = Executor::new(&topology).expect("executor construction");
            let counter = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                let counter = Arc::clone(&counter);
                executor.do_k_work_stealing_job(4, nth, move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            });
        });
    }
    group.finish();
}

fn bench_worker_count(c: &mut Criterion) {
    let topology = Topology::detect_or_abort();
    c.bench_function("worker_count_from_env", |b| {
        b.iter(|| {
            std::hint::black_box(WorkerCount::from_env());
        });
    });
    std::hint::black_box(&topology);
}

criterion_group!(
    benches,
    bench_do_work,
    bench_do_k_work_stealing_job,
    bench_worker_count
);
criterion_main!(benches);
