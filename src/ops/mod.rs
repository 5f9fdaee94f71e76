// src/ops/mod.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operators: pure compositions of [`crate::executor`] task primitives,
//! [`crate::block_plan`] shards, and an external [`crate::quant::GemmKernel`].

pub mod linear;
pub mod mlp;
pub mod moe;

pub use linear::Linear;
pub use mlp::Mlp;
pub use moe::Moe;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::quant::GemmKernel;
use std::sync::Arc;

/// SiLU-gated activation, `f(up, gate) = up * gate * sigmoid(gate)`. The
/// exponent is clamped before `exp` so large negative gates can't overflow
/// to infinity.
pub fn silu_gated(up: f32, gate: f32) -> f32 {
    const EXP_CLAMP: f32 = 88.0;
    let g = gate.clamp(-EXP_CLAMP, EXP_CLAMP);
    up * gate / (1.0 + (-g).exp())
}

/// Wraps a raw byte-buffer pointer so it can be captured by a
/// `Send + Sync` executor closure; safe wherever every dispatched task
/// writes a disjoint byte range, same contract as the per-operator
/// `f32` `OutPtr` wrappers.
pub(crate) struct OutBytesPtr(pub *mut u8, pub usize);
unsafe impl Send for OutBytesPtr {}
unsafe impl Sync for OutBytesPtr {}

/// Whether a `tile_size`-wide output slice can be requantized on its own,
/// i.e. `tile_size` is a whole number of the kernel's output blocks. When
/// `false`, tiles must accumulate into an `f32` scratch buffer and the
/// whole output requantizes in one pass afterward.
pub(crate) fn requant_per_tile(kernel: &dyn GemmKernel, tile_size: usize) -> bool {
    tile_size % kernel.kind().block_size() == 0
}

/// Requantizes one row's `tile_size`-wide `f32` slice directly into its
/// slot in a row-major quantized output buffer of `row_stride_bytes` bytes
/// per row, at column `col_start`. Only valid when
/// [`requant_per_tile`] holds for this kernel/`tile_size`.
pub(crate) fn requantize_tile_row(
    kernel: &dyn GemmKernel,
    tile_fp32: &[f32],
    col_start: usize,
    row_stride_bytes: usize,
    row: usize,
    out: &mut [u8],
) -> Result<(), EngineError> {
    let tile_start = row * row_stride_bytes + kernel.quantized_len(1, col_start);
    let tile_len = kernel.quantized_len(1, tile_fp32.len());
    kernel.from_float(tile_fp32, 1, tile_fp32.len(), &mut out[tile_start..tile_start + tile_len])
}

/// Second fork-join pass for the case [`requant_per_tile`] doesn't hold:
/// requantizes an entire `rows x cols` `f32` scratch buffer into `out` in
/// one `do_work` dispatch, one row per task.
pub(crate) fn requantize_rows_job(
    executor: &Executor,
    kernel: Arc<dyn GemmKernel>,
    scratch: Vec<f32>,
    rows: usize,
    cols: usize,
    out: OutBytesPtr,
) {
    if rows == 0 {
        return;
    }
    let row_stride_bytes = kernel.quantized_len(1, cols);
    let scratch = Arc::new(scratch);
    let nth = executor.num_workers().max(1).min(rows);
    executor.do_work(rows, nth, move |row| {
        let out = unsafe { std::slice::from_raw_parts_mut(out.0, out.1) };
        let dst = row * row_stride_bytes;
        kernel
            .from_float(&scratch[row * cols..(row + 1) * cols], 1, cols, &mut out[dst..dst + row_stride_bytes])
            .expect("row requantize shape invariants hold by construction");
    });
}
