// src/constants.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tuning constants for the executor and operators.
//!
//! These are fixed contract values (busy-wait hysteresis, cache line size)
//! rather than values a caller is expected to retune per deployment.

/// Cache line size used to pad `ThreadState` so `status`, `curr` and `end`
/// never share a line across workers.
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment, in bytes, used by both the heap-local and NUMA-local
/// allocators.
pub const ALLOC_ALIGN: usize = 64;

/// How long (in milliseconds) a worker busy-waits after going idle before
/// it starts sleeping between polls.
pub const BUSY_WAIT_MILLIS: u64 = 50;

/// Sleep granularity once a worker has been idle past [`BUSY_WAIT_MILLIS`].
pub const IDLE_SLEEP_MILLIS: u64 = 1;

/// Default upper bound on tokens processed per `forward_many` chunk.
pub const DEFAULT_GROUP_MAX_LEN: usize = 1024;

/// Default lower bound (minimum qlen) below which MoE falls back to
/// per-token `forward_one`.
pub fn default_group_min_len(num_nodes: usize) -> usize {
    num_nodes.max(8)
}

/// Name of the environment variable overriding the worker count.
pub const THREADS_ENV_VAR: &str = "LK_THREADS";
