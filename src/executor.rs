// src/executor.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fork-join executor: a fixed pool of pinned worker threads, a
//! cache-line-padded atomic state machine per worker, and two dispatch
//! primitives -- [`Executor::do_work`] (flat fan-out across all workers) and
//! [`Executor::do_k_work_stealing_job`] (NUMA-node-sharded fan-out with
//! intra-node work stealing only).
//!
//! Each worker has a `status` (WAITING/WORKING/EXIT) and a `[curr, end)`
//! task range it drains via `fetch_add`, then steals from same-node peers
//! still `WORKING`. Workers busy-wait for [`BUSY_WAIT_MILLIS`] before
//! backing off to a [`IDLE_SLEEP_MILLIS`] sleep, so a rapid sequence of
//! small jobs doesn't pay a syscall per dispatch.

use crate::constants::{BUSY_WAIT_MILLIS, IDLE_SLEEP_MILLIS, THREADS_ENV_VAR};
use crate::error::EngineError;
use crate::topology::Topology;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const STATUS_WAITING: u8 = 0;
const STATUS_WORKING: u8 = 1;
const STATUS_EXIT: u8 = 2;

thread_local! {
    static WORKER_NODE: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
}

/// The NUMA node the calling thread is pinned to, if it is one of the
/// executor's workers. Published once at worker startup and read-only for
/// the remainder of the worker's life.
pub fn current_worker_node() -> Option<usize> {
    WORKER_NODE.with(|n| n.get())
}

/// One worker's rendezvous state. `#[repr(align(64))]` pads the struct up to
/// a full cache line so adjacent workers' `status`/`curr`/`end` never share
/// a line.
#[repr(align(64))]
struct ThreadState {
    status: AtomicU8,
    curr: AtomicUsize,
    end: AtomicUsize,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(STATUS_WAITING),
            curr: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
        }
    }
}

type TaskFn = dyn Fn(usize) + Send + Sync;

/// The number of workers to spawn, resolved from `LK_THREADS` or the host's
/// logical/physical core counts.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCount(pub usize);

impl WorkerCount {
    /// Reads `LK_THREADS`: a valid positive integer pins the pool to that
    /// size; anything else (unset, empty, non-digit, zero) falls back to
    /// `num_cpus::get().saturating_sub(2)`, matching the reference
    /// backend's `validate env var or default to num_cpus - 2` rule.
    pub fn from_env() -> Self {
        if let Ok(raw) = std::env::var(THREADS_ENV_VAR) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(n) = trimmed.parse::<usize>() {
                    if n > 0 {
                        return WorkerCount(n);
                    }
                }
            }
            tracing::warn!(value = %raw, "ignoring invalid {THREADS_ENV_VAR}, falling back");
        }
        let fallback = num_cpus::get().saturating_sub(2).max(1);
        WorkerCount(fallback)
    }
}

/// A pool of pinned worker threads distributed across NUMA nodes, with two
/// fan-out primitives. Dropping the executor joins every worker thread
/// after signalling `EXIT`.
pub struct Executor {
    states: Vec<Arc<ThreadState>>,
    /// Worker indices belonging to each NUMA node, in submission order.
    node_workers: Vec<Vec<usize>>,
    job: Arc<Mutex<Option<Arc<TaskFn>>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl Executor {
    /// Build a pool sized by [`WorkerCount::from_env`], distributing workers
    /// across `topology`'s NUMA nodes proportionally (`base` per node plus
    /// one extra each for the first `remain` nodes), and pinning each
    /// worker to a distinct CPU within its node when the `thread-pinning`
    /// feature is enabled.
    pub fn new(topology: &Topology) -> Result<Self, EngineError> {
        Self::with_worker_count(topology, WorkerCount::from_env())
    }

    /// `count` is clamped into `[num_nodes, num_cpus - 2]` before anything
    /// else happens, so every node gets at least one worker and workers
    /// never outnumber the CPUs left over once 2 are reserved for the host
    /// and I/O; without this clamp, more workers than `node_cpus.len()` on
    /// some node wrap around and hard-pin two workers to the same CPU.
    pub fn with_worker_count(topology: &Topology, count: WorkerCount) -> Result<Self, EngineError> {
        let num_nodes = topology.num_nodes().max(1);
        // Clamp into [num_nodes, num_cpus - 2]: below num_nodes some node
        // gets zero workers and can never make progress on its own tiles;
        // above num_cpus - 2 there aren't enough distinct CPUs left for one
        // worker per chosen CPU once host and I/O threads are accounted for.
        let min_workers = num_nodes;
        let max_workers = topology.num_cpus().saturating_sub(2).max(min_workers);
        let total = count.0.clamp(min_workers, max_workers);
        let base = total / num_nodes;
        let remain = total % num_nodes;

        let mut states = Vec::with_capacity(total);
        let mut node_workers: Vec<Vec<usize>> = vec![Vec::new(); num_nodes];
        let mut cpu_assignment: Vec<usize> = Vec::with_capacity(total);

        let mut worker_id = 0usize;
        for node in 0..num_nodes {
            let node_cpus: &[usize] = topology.nodes.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
            let share = base + if node < remain { 1 } else { 0 };
            for i in 0..share {
                states.push(Arc::new(ThreadState::new()));
                node_workers[node].push(worker_id);
                let cpu = node_cpus.get(i % node_cpus.len().max(1)).copied();
                cpu_assignment.push(cpu.unwrap_or(worker_id));
                worker_id += 1;
            }
        }

        let job: Arc<Mutex<Option<Arc<TaskFn>>>> = Arc::new(Mutex::new(None));
        let mut handles = Vec::with_capacity(total);

        for (id, state) in states.iter().enumerate() {
            let state = Arc::clone(state);
            let job = Arc::clone(&job);
            let owning_node = node_workers.iter().position(|ws| ws.contains(&id)).unwrap_or(0);
            let peers: Vec<Arc<ThreadState>> = node_workers
                .get(owning_node)
                .map(|ws| ws.iter().map(|&w| Arc::clone(&states[w])).collect())
                .unwrap_or_default();
            let cpu = cpu_assignment[id];

            let builder = std::thread::Builder::new().name(format!("numa-moe-worker-{id}"));
            let handle = builder
                .spawn(move || {
                    pin_current_thread(cpu);
                    WORKER_NODE.with(|n| n.set(Some(owning_node)));
                    worker_loop(id, state, peers, job);
                })
                .map_err(|e| EngineError::EnvUnavailable(format!("spawning worker {id} failed: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            states,
            node_workers,
            job,
            handles,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.states.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_workers.len()
    }

    /// Flat fan-out: `task_count` tasks distributed evenly across the first
    /// `nth` workers (base + remainder split, same formula the block
    /// planner uses for tiles). Blocks until every dispatched worker has
    /// drained its range and any work it could steal from siblings.
    pub fn do_work<F>(&self, task_count: usize, nth: usize, func: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if task_count == 0 {
            return;
        }
        let nth = nth.min(self.states.len()).max(1);
        let base = task_count / nth;
        let remain = task_count % nth;

        *self.job.lock().unwrap() = Some(Arc::new(func));

        let mut start = 0usize;
        for i in 0..nth {
            let len = base + if i < remain { 1 } else { 0 };
            self.states[i].curr.store(start, Ordering::Relaxed);
            self.states[i].end.store(start + len, Ordering::Relaxed);
            start += len;
        }
        // Release fence before flipping status: curr/end must be visible to
        // the worker once it observes WORKING.
        for i in 0..nth {
            self.states[i].status.store(STATUS_WORKING, Ordering::Release);
        }
        self.wait_for_idle(&self.states[..nth]);
    }

    /// NUMA-sharded fan-out: the logical task space has size `k * nth`.
    /// `nth` "tiles" are first partitioned across the topology's real NUMA
    /// nodes (`base = nth/N`, `remain = nth mod N`); each node's
    /// `k * count(n)` tasks are then split across that node's own workers
    /// with the same base/remainder rule `do_work` uses, and offered for
    /// intra-node stealing. Task ids passed to `func` are assigned node by
    /// node, contiguously, matching [`crate::block_plan::decode_task_id`].
    pub fn do_k_work_stealing_job<F>(&self, k: usize, nth: usize, func: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if k == 0 || nth == 0 {
            return;
        }
        let num_nodes = self.node_workers.len().max(1);
        let base = nth / num_nodes;
        let remain = nth % num_nodes;

        *self.job.lock().unwrap() = Some(Arc::new(func));

        let mut start_tile = 0usize;
        let mut touched = Vec::new();
        for node in 0..num_nodes {
            let count = base + if node < remain { 1 } else { 0 };
            let workers = &self.node_workers[node];
            if workers.is_empty() || count == 0 {
                start_tile += count;
                continue;
            }
            let node_task_start = start_tile * k;
            let node_task_count = count * k;
            let w = workers.len();
            let wbase = node_task_count / w;
            let wremain = node_task_count % w;
            let mut offset = node_task_start;
            for (wi, &worker_id) in workers.iter().enumerate() {
                let len = wbase + if wi < wremain { 1 } else { 0 };
                self.states[worker_id].curr.store(offset, Ordering::Relaxed);
                self.states[worker_id].end.store(offset + len, Ordering::Relaxed);
                offset += len;
                touched.push(worker_id);
            }
            start_tile += count;
        }
        for &w in &touched {
            self.states[w].status.store(STATUS_WORKING, Ordering::Release);
        }
        let states: Vec<Arc<ThreadState>> = touched.iter().map(|&w| Arc::clone(&self.states[w])).collect();
        self.wait_for_idle(&states);
    }

    fn wait_for_idle(&self, states: &[Arc<ThreadState>]) {
        loop {
            if states.iter().all(|s| s.status.load(Ordering::Acquire) == STATUS_WAITING) {
                return;
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        for state in &self.states {
            state.status.store(STATUS_EXIT, Ordering::Release);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    _id: usize,
    state: Arc<ThreadState>,
    peers: Vec<Arc<ThreadState>>,
    job: Arc<Mutex<Option<Arc<TaskFn>>>>,
) {
    let mut idle_since: Option<Instant> = None;
    loop {
        match state.status.load(Ordering::Acquire) {
            STATUS_EXIT => return,
            STATUS_WORKING => {
                idle_since = None;
                process_tasks(&state, &peers, &job);
                state.status.store(STATUS_WAITING, Ordering::Release);
            }
            _ => {
                let since = idle_since.get_or_insert_with(Instant::now);
                if since.elapsed().as_millis() < BUSY_WAIT_MILLIS as u128 {
                    std::hint::spin_loop();
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(IDLE_SLEEP_MILLIS));
                }
            }
        }
    }
}

/// Drain this worker's own `[curr, end)` range, then steal from same-node
/// peers that are still `WORKING`, one task at a time each, until none have
/// remaining work. Never touches a peer outside `peers` (cross-node
/// stealing is out of scope by construction -- `peers` only ever contains
/// same-node workers).
fn process_tasks(state: &ThreadState, peers: &[Arc<ThreadState>], job: &Mutex<Option<Arc<TaskFn>>>) {
    let func = match job.lock().unwrap().clone() {
        Some(f) => f,
        None => return,
    };

    loop {
        let idx = state.curr.fetch_add(1, Ordering::AcqRel);
        if idx >= state.end.load(Ordering::Acquire) {
            break;
        }
        func(idx);
    }

    loop {
        let mut did_work = false;
        for peer in peers {
            if std::ptr::eq(peer.as_ref(), state) {
                continue;
            }
            if peer.status.load(Ordering::Acquire) != STATUS_WORKING {
                continue;
            }
            let idx = peer.curr.fetch_add(1, Ordering::AcqRel);
            if idx < peer.end.load(Ordering::Acquire) {
                func(idx);
                did_work = true;
            }
        }
        if !did_work {
            break;
        }
    }
}

#[cfg(feature = "thread-pinning")]
fn pin_current_thread(cpu_id: usize) {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if let Some(id) = core_ids.into_iter().find(|c| c.id == cpu_id) {
            if !core_affinity::set_for_current(id) {
                tracing::warn!(cpu_id, "failed to pin worker thread");
            }
            return;
        }
    }
    tracing::warn!(cpu_id, "cpu id not found among core_affinity core ids");
}

#[cfg(not(feature = "thread-pinning"))]
fn pin_current_thread(_cpu_id: usize) {}
