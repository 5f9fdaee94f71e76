// src/block_plan.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Block-sharded weight layout planner.
//!
//! A weight tensor of shape `(E experts, M output rows, K input cols)` is
//! tiled along `M` into `nth = M / S` row-tiles of `S` rows each, and the
//! `nth` tiles are distributed across NUMA nodes (`base = nth / N`,
//! `remain = nth mod N`, node `n` gets `count(n) = base + (n < remain)`
//! tiles starting at `start_tile(n)`). Each node gets one NUMA-local buffer
//! holding `E * count(n)` tiles in `(expert, local_tile)` row-major order.
//!
//! [`decode_task_id`] inverts the same split for a `do_k_work_stealing_job`
//! dispatch, so operators decode a flat task id into `(node, expert,
//! local_tile)` without re-deriving the partition math.

use crate::alloc::{allocate_aligned_numa, AlignedBlock};
use crate::error::{abort_if_fatal, EngineError};
use crate::quant::GemmKernel;

/// `(start_tile, tile_count)` per node for `nth` tiles split across
/// `num_nodes` nodes.
pub fn tile_distribution(nth: usize, num_nodes: usize) -> Vec<(usize, usize)> {
    let num_nodes = num_nodes.max(1);
    let base = nth / num_nodes;
    let remain = nth % num_nodes;
    let mut out = Vec::with_capacity(num_nodes);
    let mut start = 0usize;
    for n in 0..num_nodes {
        let count = base + if n < remain { 1 } else { 0 };
        out.push((start, count));
        start += count;
    }
    out
}

/// Decode a flat `do_k_work_stealing_job(k, nth, ..)` task id into
/// `(node, k_index, local_tile)`:
/// `x = task_id - start_tile(n)*k; k_index = x/count(n); local_tile = x mod count(n)`.
pub fn decode_task_id(task_id: usize, k: usize, nth: usize, num_nodes: usize) -> (usize, usize, usize) {
    let dist = tile_distribution(nth, num_nodes);
    for (node, &(start_tile, count)) in dist.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let node_start = start_tile * k;
        let node_len = count * k;
        if task_id >= node_start && task_id < node_start + node_len {
            let x = task_id - node_start;
            return (node, x / count, x % count);
        }
    }
    (0, 0, 0)
}

/// One NUMA node's replica: `num_experts * tile_count` quantized tiles of
/// `tile_rows x cols` each, stored back-to-back.
pub struct NodeBlock {
    pub node_id: usize,
    pub start_tile: usize,
    pub tile_count: usize,
    pub tile_bytes: usize,
    pub data: AlignedBlock,
}

impl NodeBlock {
    /// Byte slice for tile `(expert, local_tile)` within this node's block.
    pub fn tile_bytes_for(&self, expert: usize, local_tile: usize) -> &[u8] {
        let slot = expert * self.tile_count + local_tile;
        let start = slot * self.tile_bytes;
        &self.data.as_slice()[start..start + self.tile_bytes]
    }

    /// Whether `ptr` falls within this node's buffer, used by tests that
    /// check a worker never touched another node's weight replica.
    pub fn contains_ptr(&self, ptr: *const u8) -> bool {
        let start = self.data.as_ptr() as usize;
        let end = start + self.data.len();
        let p = ptr as usize;
        p >= start && p < end
    }
}

/// A weight tensor of shape `(E, M, K)`, tiled along `M` by `S` rows and
/// replicated once per NUMA node.
pub struct BlockPlan {
    pub num_experts: usize,
    pub m_rows: usize,
    pub k_cols: usize,
    pub tile_size: usize,
    pub nth: usize,
    pub nodes: Vec<NodeBlock>,
}

impl BlockPlan {
    /// `weights` is `E` experts of `M x K` row-major `f32`, concatenated
    /// expert-major (`weights[e*M*K + m*K + k]`). `tile_size` (`S`) must
    /// divide `m_rows`.
    pub fn build(
        weights: &[f32],
        num_experts: usize,
        m_rows: usize,
        k_cols: usize,
        tile_size: usize,
        num_nodes: usize,
        kernel: &dyn GemmKernel,
    ) -> Result<Self, EngineError> {
        if tile_size == 0 || m_rows % tile_size != 0 {
            return Err(EngineError::ConfigurationError(format!(
                "tile_size {tile_size} must evenly divide m_rows {m_rows}"
            )));
        }
        if weights.len() != num_experts * m_rows * k_cols {
            return Err(EngineError::ConfigurationError(format!(
                "weights has {} elements, expected {num_experts}x{m_rows}x{k_cols}",
                weights.len()
            )));
        }

        let nth = m_rows / tile_size;
        let dist = tile_distribution(nth, num_nodes);
        let tile_bytes = kernel.quantized_len(tile_size, k_cols);

        let mut nodes = Vec::with_capacity(dist.len());
        for (node_id, &(start_tile, count)) in dist.iter().enumerate() {
            let total_tiles = num_experts * count;
            // Every operator builds its weight layout through this path, so
            // this is where the fatal `AllocationFailure` contract is
            // actually enforced rather than just documented.
            let mut block = allocate_aligned_numa(total_tiles * tile_bytes, node_id).map_err(abort_if_fatal)?;
            for e in 0..num_experts {
                for g in 0..count {
                    let global_tile = start_tile + g;
                    let row_start = global_tile * tile_size;
                    let src_start = e * m_rows * k_cols + row_start * k_cols;
                    let src = &weights[src_start..src_start + tile_size * k_cols];
                    let slot = e * count + g;
                    let dst = &mut block.as_mut_slice()[slot * tile_bytes..(slot + 1) * tile_bytes];
                    kernel.from_float(src, tile_size, k_cols, dst)?;
                }
            }
            nodes.push(NodeBlock {
                node_id,
                start_tile,
                tile_count: count,
                tile_bytes,
                data: block,
            });
        }

        Ok(Self {
            num_experts,
            m_rows,
            k_cols,
            tile_size,
            nth,
            nodes,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::Fp32Identity;

    fn identity_weight(experts: usize, m: usize, k: usize) -> Vec<f32> {
        let mut w = vec![0.0f32; experts * m * k];
        for e in 0..experts {
            for i in 0..m.min(k) {
                w[e * m * k + i * k + i] = 1.0;
            }
        }
        w
    }

    #[test]
    fn build_covers_every_tile_exactly_once_across_nodes() {
        let kernel = Fp32Identity;
        let (e, m, k, s, n) = (2usize, 16usize, 8usize, 4usize, 3usize);
        let weights = identity_weight(e, m, k);
        let plan = BlockPlan::build(&weights, e, m, k, s, n, &kernel).unwrap();

        assert_eq!(plan.nth, m / s);
        let mut covered = vec![false; plan.nth];
        for node in &plan.nodes {
            for g in 0..node.tile_count {
                let global = node.start_tile + g;
                assert!(!covered[global], "tile {global} covered twice");
                covered[global] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn decode_task_id_matches_tile_distribution() {
        let (k, nth, num_nodes) = (3usize, 17usize, 4usize);
        let dist = tile_distribution(nth, num_nodes);
        let total = k * nth;
        for task_id in 0..total {
            let (node, k_idx, local_tile) = decode_task_id(task_id, k, nth, num_nodes);
            let (start_tile, count) = dist[node];
            assert!(k_idx < k);
            assert!(local_tile < count);
            let reconstructed = start_tile * k + k_idx * count + local_tile;
            assert_eq!(reconstructed, task_id);
        }
    }

    #[test]
    fn tile_round_trips_through_quantization() {
        let kernel = Fp32Identity;
        let (e, m, k, s, n) = (1usize, 8usize, 4usize, 4usize, 2usize);
        let weights: Vec<f32> = (0..e * m * k).map(|i| i as f32).collect();
        let plan = BlockPlan::build(&weights, e, m, k, s, n, &kernel).unwrap();
        let node0 = &plan.nodes[0];
        let bytes = node0.tile_bytes_for(0, 0);
        let mut back = vec![0.0f32; s * k];
        kernel.to_float(bytes, s, k, &mut back).unwrap();
        assert_eq!(back, weights[0..s * k]);
    }
}
