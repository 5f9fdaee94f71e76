// src/lib.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A NUMA-aware CPU execution engine for quantized Mixture-of-Experts
//! feed-forward layers.
//!
//! This crate provides:
//! - A hard-pinned fork-join executor with intra-node work stealing
//! - A block-sharded, NUMA-replicated quantized weight layout
//! - `Linear`, `Mlp` and `Moe` operators built purely from those two
//!   primitives plus an external [`quant::GemmKernel`]

pub mod alloc;
pub mod block_plan;
pub mod constants;
pub mod error;
pub mod executor;
pub mod ops;
pub mod quant;
pub mod topology;

pub use block_plan::BlockPlan;
pub use error::{EngineError, Result};
pub use executor::{current_worker_node, Executor, WorkerCount};
pub use ops::{Linear, Mlp, Moe};
pub use quant::{Fp32Identity, GemmKernel, QuantKind};
pub use topology::Topology;

/// Installs a [`tracing_subscriber`] `fmt` layer from `RUST_LOG` (or
/// `info` if unset). Call once at process startup; safe to call multiple
/// times (later calls are no-ops).
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
