// src/ops/mlp.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MLP operator: gate + up projections, SiLU-gated activation, down
//! projection. Gate and up share the same quantized input, the activation
//! is applied per output tile as soon as both GEMMs finish for it, and the
//! down projection runs as a second fork-join job over the activated,
//! requantized intermediate buffer.

use super::{requant_per_tile, requantize_rows_job, requantize_tile_row, silu_gated, OutBytesPtr};
use crate::block_plan::{decode_task_id, BlockPlan};
use crate::constants::DEFAULT_GROUP_MAX_LEN;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::quant::GemmKernel;
use std::sync::{Arc, Mutex};

pub struct Mlp {
    executor: Arc<Executor>,
    kernel: Arc<dyn GemmKernel>,
    gate_plan: BlockPlan,
    up_plan: BlockPlan,
    down_plan: BlockPlan,
    hidden_size: usize,
    intermediate_size: usize,
    tile_size: usize,
    group_max_len: usize,
}

impl Mlp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<Executor>,
        kernel: Arc<dyn GemmKernel>,
        gate_weight: &[f32],
        up_weight: &[f32],
        down_weight: &[f32],
        hidden_size: usize,
        intermediate_size: usize,
        tile_size: usize,
    ) -> Result<Self, EngineError> {
        let num_nodes = executor.num_nodes();
        let gate_plan = BlockPlan::build(
            gate_weight,
            1,
            intermediate_size,
            hidden_size,
            tile_size,
            num_nodes,
            kernel.as_ref(),
        )?;
        let up_plan = BlockPlan::build(
            up_weight,
            1,
            intermediate_size,
            hidden_size,
            tile_size,
            num_nodes,
            kernel.as_ref(),
        )?;
        let down_plan = BlockPlan::build(
            down_weight,
            1,
            hidden_size,
            intermediate_size,
            tile_size,
            num_nodes,
            kernel.as_ref(),
        )?;
        Ok(Self {
            executor,
            kernel,
            gate_plan,
            up_plan,
            down_plan,
            hidden_size,
            intermediate_size,
            tile_size,
            group_max_len: DEFAULT_GROUP_MAX_LEN,
        })
    }

    pub fn warm_up(&self) -> Result<(), EngineError> {
        let input = vec![0.0f32; self.hidden_size];
        let mut output = vec![0u8; self.kernel.quantized_len(1, self.hidden_size)];
        self.forward(1, &input, &mut output)
    }

    /// `output` is `qlen x hidden_size` in the kernel's quantized format.
    pub fn forward(&self, qlen: usize, input: &[f32], output: &mut [u8]) -> Result<(), EngineError> {
        if qlen == 0 {
            return Ok(());
        }
        let out_row_bytes = self.kernel.quantized_len(1, self.hidden_size);
        if input.len() != qlen * self.hidden_size || output.len() != qlen * out_row_bytes {
            return Err(EngineError::ConfigurationError(format!(
                "Mlp::forward: shape mismatch for qlen={qlen}"
            )));
        }
        let mut offset = 0usize;
        while offset < qlen {
            let chunk_len = (qlen - offset).min(self.group_max_len);
            let in_start = offset * self.hidden_size;
            let out_start = offset * out_row_bytes;
            self.forward_chunk(
                chunk_len,
                &input[in_start..in_start + chunk_len * self.hidden_size],
                &mut output[out_start..out_start + chunk_len * out_row_bytes],
            )?;
            offset += chunk_len;
        }
        Ok(())
    }

    fn forward_chunk(&self, qlen: usize, input: &[f32], output: &mut [u8]) -> Result<(), EngineError> {
        let kernel = Arc::clone(&self.kernel);
        let mut q_input = vec![0u8; kernel.quantized_len(qlen, self.hidden_size)];
        kernel.from_float(input, qlen, self.hidden_size, &mut q_input)?;
        let q_input = Arc::new(q_input);

        let intermediate = Arc::new(std::sync::Mutex::new(vec![0.0f32; qlen * self.intermediate_size]));

        let nth = self.gate_plan.nth;
        let num_nodes = self.gate_plan.num_nodes();
        let tile_size = self.tile_size;
        let hidden_size = self.hidden_size;
        let intermediate_size = self.intermediate_size;
        let gate_plan_ptr: *const BlockPlan = &self.gate_plan;
        let up_plan_ptr: *const BlockPlan = &self.up_plan;

        {
            let q_input = Arc::clone(&q_input);
            let kernel = Arc::clone(&kernel);
            let intermediate = Arc::clone(&intermediate);
            self.executor.do_k_work_stealing_job(1, nth, move |task_id| {
                let (node, _k, local_tile) = decode_task_id(task_id, 1, nth, num_nodes);
                let gate_plan = unsafe { &*gate_plan_ptr };
                let up_plan = unsafe { &*up_plan_ptr };
                let gate_tile = gate_plan.nodes[node].tile_bytes_for(0, local_tile);
                let up_tile = up_plan.nodes[node].tile_bytes_for(0, local_tile);
                let global_tile = gate_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut gate_out = vec![0.0f32; qlen * tile_size];
                let mut up_out = vec![0.0f32; qlen * tile_size];
                kernel.gemm(&q_input, qlen, gate_tile, tile_size, hidden_size, &mut gate_out).unwrap();
                kernel.gemm(&q_input, qlen, up_tile, tile_size, hidden_size, &mut up_out).unwrap();

                let mut guard = intermediate.lock().unwrap();
                for row in 0..qlen {
                    for col in 0..tile_size {
                        let g = gate_out[row * tile_size + col];
                        let u = up_out[row * tile_size + col];
                        guard[row * intermediate_size + col_start + col] = silu_gated(u, g);
                    }
                }
            });
        }

        let intermediate = Arc::try_unwrap(intermediate)
            .map_err(|_| EngineError::HostContractViolation("intermediate buffer still shared".into()))?
            .into_inner()
            .unwrap();

        let mut q_intermediate = vec![0u8; kernel.quantized_len(qlen, intermediate_size)];
        kernel.from_float(&intermediate, qlen, intermediate_size, &mut q_intermediate)?;
        let q_intermediate = Arc::new(q_intermediate);

        let down_nth = self.down_plan.nth;
        let down_num_nodes = self.down_plan.num_nodes();
        let down_plan_ptr: *const BlockPlan = &self.down_plan;
        let row_stride_bytes = kernel.quantized_len(1, hidden_size);
        let per_tile = requant_per_tile(kernel.as_ref(), tile_size);

        if per_tile {
            let out_ptr = OutBytesPtr(output.as_mut_ptr(), output.len());
            self.executor.do_k_work_stealing_job(1, down_nth, move |task_id| {
                let (node, _k, local_tile) = decode_task_id(task_id, 1, down_nth, down_num_nodes);
                let down_plan = unsafe { &*down_plan_ptr };
                let weight_tile = down_plan.nodes[node].tile_bytes_for(0, local_tile);
                let global_tile = down_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut tile_out = vec![0.0f32; qlen * tile_size];
                kernel
                    .gemm(&q_intermediate, qlen, weight_tile, tile_size, intermediate_size, &mut tile_out)
                    .expect("tile gemm shape invariants hold by construction");

                let out = unsafe { std::slice::from_raw_parts_mut(out_ptr.0, out_ptr.1) };
                for row in 0..qlen {
                    requantize_tile_row(kernel.as_ref(), &tile_out[row * tile_size..(row + 1) * tile_size], col_start, row_stride_bytes, row, out)
                        .expect("tile requantize shape invariants hold by construction");
                }
            });
        } else {
            let scratch = Arc::new(Mutex::new(vec![0.0f32; qlen * hidden_size]));
            {
                let scratch = Arc::clone(&scratch);
                self.executor.do_k_work_stealing_job(1, down_nth, move |task_id| {
                    let (node, _k, local_tile) = decode_task_id(task_id, 1, down_nth, down_num_nodes);
                    let down_plan = unsafe { &*down_plan_ptr };
                    let weight_tile = down_plan.nodes[node].tile_bytes_for(0, local_tile);
                    let global_tile = down_plan.nodes[node].start_tile + local_tile;
                    let col_start = global_tile * tile_size;

                    let mut tile_out = vec![0.0f32; qlen * tile_size];
                    kernel
                        .gemm(&q_intermediate, qlen, weight_tile, tile_size, intermediate_size, &mut tile_out)
                        .expect("tile gemm shape invariants hold by construction");

                    let mut guard = scratch.lock().unwrap();
                    for row in 0..qlen {
                        let dst = row * hidden_size + col_start;
                        guard[dst..dst + tile_size].copy_from_slice(&tile_out[row * tile_size..(row + 1) * tile_size]);
                    }
                });
            }
            let scratch = Arc::try_unwrap(scratch)
                .map_err(|_| EngineError::HostContractViolation("output scratch buffer still shared".into()))?
                .into_inner()
                .unwrap();
            requantize_rows_job(&self.executor, kernel, scratch, qlen, hidden_size, OutBytesPtr(output.as_mut_ptr(), output.len()));
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

    /// All-zero weights produce an all-zero output regardless of input.
    #[test]
    fn all_zero_weights_produce_all_zero_output() {
        let topo = single_node_topology(6);
        let executor = Arc::new(Executor::with_worker_count(&topo, WorkerCount(4)).unwrap());
        let kernel = Arc::new(Fp32Identity);

        let hidden = 16;
        let inter = 32;
        let tile = 8;
        let gate = vec![0.0f32; inter * hidden];
        let up = vec![0.0f32; inter * hidden];
        let down = vec![0.0f32; hidden * inter];
        let mlp = Mlp::new(executor, Arc::clone(&kernel), &gate, &up, &down, hidden, inter, tile).unwrap();

        let qlen = 5;
        let input: Vec<f32> = (0..qlen * hidden).map(|i| (i as f32) * 0.37 - 3.0).collect();
        let mut output = vec![0xffu8; kernel.quantized_len(qlen, hidden)];
        mlp.forward(qlen, &input, &mut output).unwrap();

        let mut out_f32 = vec![0.0f32; qlen * hidden];
        kernel.to_float(&output, qlen, hidden, &mut out_f32).unwrap();
        assert!(out_f32.iter().all(|&v| v == 0.0));
    }
}
