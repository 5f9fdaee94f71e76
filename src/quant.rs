// src/quant.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quantized GEMM kernel abstraction. The engine never encodes a specific
//! quantization format itself; instead it is generic over a [`GemmKernel`]
//! implementation tagged by a [`QuantKind`], treating the actual quant
//! kernels (e.g. ggml's) as an opaque linked library.
//!
//! [`Fp32Identity`] is the reference/test kernel: it treats "quantized"
//! blocks as plain `f32` with a block size of 1, so its `gemm` is an
//! ordinary dense matmul. It exists so executor, block-planner and operator
//! tests can assert exact numeric results without depending on a real
//! quantization format.

use crate::error::EngineError;

/// Which on-disk/in-memory quantization format a [`GemmKernel`] implements.
/// Mirrors the small closed set of ggml quant types (`GGML_TYPE_Q4_0`,
/// `Q4_K`, `Q6_K`, ...); new entries are additive and never change the
/// meaning of an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantKind {
    /// Plain `f32`, block size 1. Used for tests and as an interpreter
    /// reference implementation.
    Fp32Identity,
    /// 4-bit symmetric, 32-element blocks (ggml `Q4_0`-shaped).
    Q4_0,
    /// 8-bit symmetric, 32-element blocks (ggml `Q8_0`-shaped).
    Q8_0,
}

impl QuantKind {
    pub fn block_size(self) -> usize {
        match self {
            QuantKind::Fp32Identity => 1,
            QuantKind::Q4_0 | QuantKind::Q8_0 => 32,
        }
    }
}

/// A quantized GEMM kernel: the engine's only dependency on a specific
/// quantization format. Implementations are expected to be `Send + Sync`
/// so the same kernel instance can be shared read-only across worker
/// threads, since kernels are typically stateless functions called from
/// every worker.
pub trait GemmKernel: Send + Sync {
    fn kind(&self) -> QuantKind;

    /// Size in bytes of one quantized row element's storage unit (a block),
    /// used by the block planner to size replicated weight buffers.
    fn type_size(&self) -> usize;

    /// Quantize `src` (row-major, `rows x cols` of `f32`) into `dst`.
    /// `dst` must be sized by the caller via [`Self::quantized_len`].
    fn from_float(&self, src: &[f32], rows: usize, cols: usize, dst: &mut [u8]) -> Result<(), EngineError>;

    /// Dequantize `src` into `dst` (`rows x cols` of `f32`).
    fn to_float(&self, src: &[u8], rows: usize, cols: usize, dst: &mut [f32]) -> Result<(), EngineError>;

    /// Number of bytes needed to store `rows x cols` values in this format.
    fn quantized_len(&self, rows: usize, cols: usize) -> usize;

    /// `out[m, n] = sum_k a[m, k] * b[n, k]`, i.e. `b` is stored
    /// transposed (row-major "weight" layout), matching llamafile's
    /// `forward_one`/`forward_many` convention where the weight matrix's
    /// rows are the output features.
    ///
    /// `a` is `m x k` quantized input, `b` is `n x k` quantized weight,
    /// `out` is `m x n` in `f32`.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        &self,
        a: &[u8],
        m: usize,
        b: &[u8],
        n: usize,
        k: usize,
        out: &mut [f32],
    ) -> Result<(), EngineError>;
}

/// Reference kernel used by tests and benches: "quantized" storage is just
/// `f32` bytes, block size 1, `gemm` is a naive triple loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fp32Identity;

impl GemmKernel for Fp32Identity {
    fn kind(&self) -> QuantKind {
        QuantKind::Fp32Identity
    }

    fn type_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    fn from_float(&self, src: &[f32], rows: usize, cols: usize, dst: &mut [u8]) -> Result<(), EngineError> {
        let need = self.quantized_len(rows, cols);
        if src.len() != rows * cols || dst.len() != need {
            return Err(EngineError::ConfigurationError(format!(
                "from_float: shape mismatch (src={}, dst={}, need={need})",
                src.len(),
                dst.len()
            )));
        }
        for (chunk, &v) in dst.chunks_exact_mut(4).zip(src.iter()) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    fn to_float(&self, src: &[u8], rows: usize, cols: usize, dst: &mut [f32]) -> Result<(), EngineError> {
        let need = self.quantized_len(rows, cols);
        if src.len() != need || dst.len() != rows * cols {
            return Err(EngineError::ConfigurationError(format!(
                "to_float: shape mismatch (src={}, need={need}, dst={})",
                src.len(),
                dst.len()
            )));
        }
        for (chunk, out) in src.chunks_exact(4).zip(dst.iter_mut()) {
            *out = f32::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(())
    }

    fn quantized_len(&self, rows: usize, cols: usize) -> usize {
        rows * cols * self.type_size()
    }

    fn gemm(&self, a: &[u8], m: usize, b: &[u8], n: usize, k: usize, out: &mut [f32]) -> Result<(), EngineError> {
        if a.len() != self.quantized_len(m, k)
            || b.len() != self.quantized_len(n, k)
            || out.len() != m * n
        {
            return Err(EngineError::ConfigurationError(
                "gemm: shape mismatch between a/b/out".into(),
            ));
        }
        let af: Vec<f32> = a
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let bf: Vec<f32> = b
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += af[i * k + l] * bf[j * k + l];
                }
                out[i * n + j] = acc;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_gemm_matches_naive_matmul() {
        let kernel = Fp32Identity;
        let a = vec![1.0f32, 2.0, 3.0, 4.0]; // 2x2
        let b = vec![1.0f32, 0.0, 0.0, 1.0]; // 2x2 identity weight
        let mut aq = vec![0u8; kernel.quantized_len(2, 2)];
        let mut bq = vec![0u8; kernel.quantized_len(2, 2)];
        kernel.from_float(&a, 2, 2, &mut aq).unwrap();
        kernel.from_float(&b, 2, 2, &mut bq).unwrap();
        let mut out = vec![0.0f32; 4];
        kernel.gemm(&aq, 2, &bq, 2, 2, &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn roundtrip_to_float_from_float() {
        let kernel = Fp32Identity;
        let a = vec![1.5f32, -2.25, 0.0, 42.0];
        let mut q = vec![0u8; kernel.quantized_len(2, 2)];
        kernel.from_float(&a, 2, 2, &mut q).unwrap();
        let mut back = vec![0.0f32; 4];
        kernel.to_float(&q, 2, 2, &mut back).unwrap();
        assert_eq!(a, back);
    }
}
