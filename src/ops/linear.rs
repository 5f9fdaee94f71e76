// src/ops/linear.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Linear operator: a single dense projection driven by the executor and a
//! column-tiled, NUMA-replicated weight ([`BlockPlan`]). Batches larger than
//! `group_max_len` are chunked; each chunk requantizes its input once, then
//! dispatches one `do_k_work_stealing_job(1, nth, ..)` tiling the output
//! columns across nodes.

use super::{requant_per_tile, requantize_rows_job, requantize_tile_row, OutBytesPtr};
use crate::block_plan::{decode_task_id, BlockPlan};
use crate::constants::DEFAULT_GROUP_MAX_LEN;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::quant::GemmKernel;
use std::sync::{Arc, Mutex};

pub struct Linear {
    executor: Arc<Executor>,
    kernel: Arc<dyn GemmKernel>,
    plan: BlockPlan,
    input_size: usize,
    output_size: usize,
    tile_size: usize,
    group_max_len: usize,
}

impl Linear {
    pub fn new(
        executor: Arc<Executor>,
        kernel: Arc<dyn GemmKernel>,
        weight: &[f32],
        input_size: usize,
        output_size: usize,
        tile_size: usize,
    ) -> Result<Self, EngineError> {
        let plan = BlockPlan::build(
            weight,
            1,
            output_size,
            input_size,
            tile_size,
            executor.num_nodes(),
            kernel.as_ref(),
        )?;
        Ok(Self {
            executor,
            kernel,
            plan,
            input_size,
            output_size,
            tile_size,
            group_max_len: DEFAULT_GROUP_MAX_LEN,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Prime the executor and weight buffers with a zero-length dispatch.
    pub fn warm_up(&self) -> Result<(), EngineError> {
        let input = vec![0.0f32; self.input_size];
        let mut output = vec![0u8; self.kernel.quantized_len(1, self.output_size)];
        self.forward(1, &input, &mut output)
    }

    /// `input` is `qlen x input_size` row-major `f32`; `output` is
    /// `qlen x output_size` in the kernel's quantized format. A no-op when
    /// `qlen == 0`.
    pub fn forward(&self, qlen: usize, input: &[f32], output: &mut [u8]) -> Result<(), EngineError> {
        if qlen == 0 {
            return Ok(());
        }
        let out_row_bytes = self.kernel.quantized_len(1, self.output_size);
        if input.len() != qlen * self.input_size || output.len() != qlen * out_row_bytes {
            return Err(EngineError::ConfigurationError(format!(
                "Linear::forward: shape mismatch for qlen={qlen}"
            )));
        }

        let mut offset = 0usize;
        while offset < qlen {
            let chunk_len = (qlen - offset).min(self.group_max_len);
            let in_start = offset * self.input_size;
            let out_start = offset * out_row_bytes;
            self.forward_chunk(
                chunk_len,
                &input[in_start..in_start + chunk_len * self.input_size],
                &mut output[out_start..out_start + chunk_len * out_row_bytes],
            )?;
            offset += chunk_len;
        }
        Ok(())
    }

    /// Dispatches one `do_k_work_stealing_job(1, nth, ..)` tiling the
    /// output columns across nodes. When `tile_size` is a multiple of the
    /// output format's block size, each task requantizes its own output
    /// slice directly; otherwise results land in an `f32` scratch buffer
    /// and a second fork-join requantizes the whole chunk in one pass.
    fn forward_chunk(&self, qlen: usize, input: &[f32], output: &mut [u8]) -> Result<(), EngineError> {
        let kernel = Arc::clone(&self.kernel);
        let mut q_input = vec![0u8; kernel.quantized_len(qlen, self.input_size)];
        kernel.from_float(input, qlen, self.input_size, &mut q_input)?;
        let q_input = Arc::new(q_input);

        let nth = self.plan.nth;
        let num_nodes = self.plan.num_nodes();
        let tile_size = self.tile_size;
        let input_size = self.input_size;
        let output_size = self.output_size;
        let row_stride_bytes = kernel.quantized_len(1, output_size);
        let per_tile = requant_per_tile(kernel.as_ref(), tile_size);

        // Safety net rather than an `unsafe impl` on `BlockPlan`: node
        // tiles live in `NodeBlock`s owned by `self.plan`, but
        // `do_k_work_stealing_job` spawns the closure across threads that
        // outlive this stack frame's borrow checker view. We extend the
        // plan's lifetime via a raw pointer, valid because `forward_chunk`
        // blocks (via the executor's rendezvous) until every task has run.
        let plan_ptr: *const BlockPlan = &self.plan;

        if per_tile {
            let out_ptr = OutBytesPtr(output.as_mut_ptr(), output.len());
            self.executor.do_k_work_stealing_job(1, nth, move |task_id| {
                let (node, _k_index, local_tile) = decode_task_id(task_id, 1, nth, num_nodes);
                let plan = unsafe { &*plan_ptr };
                let node_block = &plan.nodes[node];
                let weight_tile = node_block.tile_bytes_for(0, local_tile);
                let global_tile = node_block.start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut tile_out = vec![0.0f32; qlen * tile_size];
                kernel
                    .gemm(&q_input, qlen, weight_tile, tile_size, input_size, &mut tile_out)
                    .expect("tile gemm shape invariants hold by construction");

                let out = unsafe { std::slice::from_raw_parts_mut(out_ptr.0, out_ptr.1) };
                for row in 0..qlen {
                    requantize_tile_row(kernel.as_ref(), &tile_out[row * tile_size..(row + 1) * tile_size], col_start, row_stride_bytes, row, out)
                        .expect("tile requantize shape invariants hold by construction");
                }
            });
        } else {
            let scratch = Arc::new(Mutex::new(vec![0.0f32; qlen * output_size]));
            {
                let scratch = Arc::clone(&scratch);
                self.executor.do_k_work_stealing_job(1, nth, move |task_id| {
                    let (node, _k_index, local_tile) = decode_task_id(task_id, 1, nth, num_nodes);
                    let plan = unsafe { &*plan_ptr };
                    let node_block = &plan.nodes[node];
                    let weight_tile = node_block.tile_bytes_for(0, local_tile);
                    let global_tile = node_block.start_tile + local_tile;
                    let col_start = global_tile * tile_size;

                    let mut tile_out = vec![0.0f32; qlen * tile_size];
                    kernel
                        .gemm(&q_input, qlen, weight_tile, tile_size, input_size, &mut tile_out)
                        .expect("tile gemm shape invariants hold by construction");

                    let mut guard = scratch.lock().unwrap();
                    for row in 0..qlen {
                        let dst = row * output_size + col_start;
                        guard[dst..dst + tile_size].copy_from_slice(&tile_out[row * tile_size..(row + 1) * tile_size]);
                    }
                });
            }
            let scratch = Arc::try_unwrap(scratch)
                .map_err(|_| EngineError::HostContractViolation("output scratch buffer still shared".into()))?
                .into_inner()
                .unwrap();
            super::requantize_rows_job(&self.executor, kernel, scratch, qlen, output_size, OutBytesPtr(output.as_mut_ptr(), output.len()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::WorkerCount;
    use crate::quant::Fp32Identity;
    use crate::topology::{CpuInfo, Topology};

    fn single_node_topology(num_cpus: usize) -> Topology {
        let cpus = (0..num_cpus)
            .map(|i| CpuInfo {
                cpu_id: i,
                core_id: i,
                node_id: 0,
                package_id: 0,
                sibling_rank: 0,
            })
            .collect();
        Topology {
            cpus,
            nodes: vec![(0..num_cpus).collect()],
            num_cores: num_cpus,
        }
    }

    /// Identity weights, `input_size=64, output_size=32, S=8`.
    #[test]
    fn identity_weights_copy_leading_columns() {
        let topo = single_node_topology(6);
        let executor = Arc::new(Executor::with_worker_count(&topo, WorkerCount(4)).unwrap());
        let kernel = Arc::new(Fp32Identity);

        let input_size = 64;
        let output_size = 32;
        let tile_size = 8;
        let mut weight = vec![0.0f32; output_size * input_size];
        for i in 0..output_size {
            weight[i * input_size + i] = 1.0;
        }

        let linear = Linear::new(Arc::clone(&executor), Arc::clone(&kernel), &weight, input_size, output_size, tile_size).unwrap();

        let qlen = 3;
        let mut input = vec![0.0f32; qlen * input_size];
        for row in 0..qlen {
            for col in 0..input_size {
                input[row * input_size + col] = (row + 1 + col) as f32;
            }
        }
        let mut output = vec![0u8; kernel.quantized_len(qlen, output_size)];
        linear.forward(qlen, &input, &mut output).unwrap();

        let mut out_f32 = vec![0.0f32; qlen * output_size];
        kernel.to_float(&output, qlen, output_size, &mut out_f32).unwrap();
        for row in 0..qlen {
            for col in 0..output_size {
                assert_eq!(out_f32[row * output_size + col], input[row * input_size + col]);
            }
        }
    }

    #[test]
    fn forward_zero_qlen_is_a_no_op() {
        let topo = single_node_topology(4);
        let executor = Arc::new(Executor::with_worker_count(&topo, WorkerCount(2)).unwrap());
        let kernel = Arc::new(Fp32Identity);
        let weight = vec![0.0f32; 8 * 4];
        let linear = Linear::new(executor, kernel, &weight, 4, 8, 4).unwrap();
        let mut output: Vec<u8> = Vec::new();
        linear.forward(0, &[], &mut output).unwrap();
    }
}
