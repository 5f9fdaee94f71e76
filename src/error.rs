// src/error.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error kinds for the executor and operators.
//!
//! `EnvUnavailable` and `AllocationFailure` are fatal: the caller is expected
//! to log and abort on NUMA unavailability or allocation failure.
//! `ConfigurationError` is recoverable policy the caller decides on (e.g.
//! the MoE `qlen < num_nodes` fallback). `HostContractViolation` marks a
//! broken caller invariant and is only ever raised from a
//! `debug_assert!`-guarded path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// NUMA facility unavailable, or the topology probe could not read the
    /// OS's sysfs-like interface. Fatal: the process must abort.
    #[error("environment unavailable: {0}")]
    EnvUnavailable(String),

    /// An aligned or NUMA-local allocation failed. Fatal: the process must
    /// abort.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// Invalid shape, `stride` not dividing a dimension, or other
    /// caller-supplied configuration the core cannot satisfy. Recoverable:
    /// the caller decides policy (e.g. MoE falls back to `forward_one`).
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The host violated the executor's contract (submission after
    /// shutdown, overlapping jobs). Undefined behavior by contract; surfaced
    /// here only so debug builds can report it before the assertion fires.
    #[error("host contract violation: {0}")]
    HostContractViolation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Log a fatal [`EngineError`] and abort the process. Used for
/// `EnvUnavailable`/`AllocationFailure`, which have no recovery path.
pub fn abort_fatal(err: EngineError) -> ! {
    tracing::error!("{err}");
    std::process::abort();
}

/// Funnels the two fatal kinds (`EnvUnavailable`, `AllocationFailure`)
/// through [`abort_fatal`]; any other kind is returned unchanged so the
/// caller can still propagate it as a recoverable `Result`. Intended for
/// `.map_err(abort_if_fatal)?` at the shared constructor paths
/// ([`crate::block_plan::BlockPlan::build`], [`crate::topology::Topology::detect_or_abort`])
/// every operator and production entry point goes through.
pub fn abort_if_fatal(err: EngineError) -> EngineError {
    match err {
        EngineError::EnvUnavailable(_) | EngineError::AllocationFailure(_) => abort_fatal(err),
        other => other,
    }
}
