// tests/executor_stress.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executor stress tests against the real probed topology (skipped if the
//! sandbox has no NUMA facility), exercising both dispatch primitives under
//! many repeated back-to-back jobs of varying size -- the pattern a hot
//! inference loop drives them with, as opposed to the single-dispatch unit
//! tests colocated in `src/executor.rs`.

use numa_moe_exec::{Executor, Topology};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn detect_topology() -> Option<Topology> {
    match Topology::detect() {
        Ok(t) => Some(t),
        Err(e) => {
            eprintln!("skipping: topology probe unavailable in test sandbox: {e}");
            None
        }
    }
}

#[test]
fn do_work_covers_every_task_exactly_once_across_many_repeated_dispatches() {
    let Some(topo) = detect_topology() else { return };
    let executor = Executor::new(&topo).expect("executor construction");

    for round in 0..200usize {
        let task_count = 1 + (round * 37) % 500;
        let hits: Vec<AtomicUsize> = (0..task_count).map(|_| AtomicUsize::new(0)).collect();
        let hits = Arc::new(hits);
        let hits_job = Arc::clone(&hits);
        executor.do_work(task_count, executor.num_workers(), move |idx| {
            hits_job[idx].fetch_add(1, Ordering::Relaxed);
        });
        for (idx, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::Relaxed), 1, "task {idx} hit {} times in round {round}", h.load(Ordering::Relaxed));
        }
    }
}

#[test]
fn do_k_work_stealing_job_covers_every_task_exactly_once_across_many_repeated_dispatches() {
    let Some(topo) = detect_topology() else { return };
    let executor = Executor::new(&topo).expect("executor construction");

    for round in 0..200usize {
        let k = 1 + round % 5;
        let nth = 1 + (round * 13) % 64;
        let total = k * nth;
        let hits: Vec<AtomicUsize> = (0..total).map(|_| AtomicUsize::new(0)).collect();
        let hits = Arc::new(hits);
        let hits_job = Arc::clone(&hits);
        executor.do_k_work_stealing_job(k, nth, move |task_id| {
            hits_job[task_id].fetch_add(1, Ordering::Relaxed);
        });
        for (idx, h) in hits.iter().enumerate() {
            assert_eq!(h.load(Ordering::Relaxed), 1, "task {idx} hit {} times in round {round}", h.load(Ordering::Relaxed));
        }
    }
}

#[test]
fn interleaved_do_work_and_stealing_job_dispatches_stay_independent() {
    let Some(topo) = detect_topology() else { return };
    let executor = Executor::new(&topo).expect("executor construction");

    for round in 0..50usize {
        let flat_count = 1 + round * 3;
        let flat_hits: Vec<AtomicUsize> = (0..flat_count).map(|_| AtomicUsize::new(0)).collect();
        let flat_hits = Arc::new(flat_hits);
        let fh = Arc::clone(&flat_hits);
        executor.do_work(flat_count, executor.num_workers(), move |idx| {
            fh[idx].fetch_add(1, Ordering::Relaxed);
        });

        let k = 2;
        let nth = 1 + round % 16;
        let total = k * nth;
        let sharded_hits: Vec<AtomicUsize> = (0..total).map(|_| AtomicUsize::new(0)).collect();
        let sharded_hits = Arc::new(sharded_hits);
        let sh = Arc::clone(&sharded_hits);
        executor.do_k_work_stealing_job(k, nth, move |task_id| {
            sh[task_id].fetch_add(1, Ordering::Relaxed);
        });

        assert!(flat_hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
        assert!(sharded_hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }
}
