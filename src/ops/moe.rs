// src/ops/moe.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MoE operator: token-routed MLP over a subset of `k` experts per token,
//! with two execution regimes chosen by batch size. `forward_one` runs
//! three `do_k_work_stealing_job` stages (gate+up+activate, down, weighted
//! reduction) for a single token; `forward_many` reorders tokens
//! expert-major so each active expert's GEMM is batched across every token
//! routed to it, then reduces per token. `forward` recurses in
//! `group_max_len`-sized chunks and falls back to iterated `forward_one`
//! when `qlen < group_min_len`.

use super::{requant_per_tile, requantize_rows_job, requantize_tile_row, silu_gated, OutBytesPtr};
use crate::block_plan::{decode_task_id, BlockPlan};
use crate::constants::{default_group_min_len, DEFAULT_GROUP_MAX_LEN};
use crate::error::EngineError;
use crate::executor::Executor;
use crate::quant::GemmKernel;
use std::sync::{Arc, Mutex};

pub struct Moe {
    executor: Arc<Executor>,
    kernel: Arc<dyn GemmKernel>,
    gate_plan: BlockPlan,
    up_plan: BlockPlan,
    down_plan: BlockPlan,
    num_experts: usize,
    hidden_size: usize,
    intermediate_size: usize,
    tile_size: usize,
    k: usize,
    group_min_len: usize,
    group_max_len: usize,
}

impl Moe {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<Executor>,
        kernel: Arc<dyn GemmKernel>,
        gate_weight: &[f32],
        up_weight: &[f32],
        down_weight: &[f32],
        num_experts: usize,
        hidden_size: usize,
        intermediate_size: usize,
        tile_size: usize,
        k: usize,
    ) -> Result<Self, EngineError> {
        let num_nodes = executor.num_nodes();
        let gate_plan = BlockPlan::build(
            gate_weight,
            num_experts,
            intermediate_size,
            hidden_size,
            tile_size,
            num_nodes,
            kernel.as_ref(),
        )?;
        let up_plan = BlockPlan::build(
            up_weight,
            num_experts,
            intermediate_size,
            hidden_size,
            tile_size,
            num_nodes,
            kernel.as_ref(),
        )?;
        let down_plan = BlockPlan::build(
            down_weight,
            num_experts,
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
            num_experts,
            hidden_size,
            intermediate_size,
            tile_size,
            k,
            group_min_len: default_group_min_len(num_nodes),
            group_max_len: DEFAULT_GROUP_MAX_LEN,
        })
    }

    /// Runs one `forward_one` call with expert 0 at zero weight, priming
    /// allocations and weight-buffer first-touch pages.
    pub fn warm_up(&self) -> Result<(), EngineError> {
        let expert_ids = vec![0usize; self.k];
        let weights = vec![0.0f32; self.k];
        let input = vec![0.0f32; self.hidden_size];
        let mut output = vec![0u8; self.kernel.quantized_len(1, self.hidden_size)];
        self.forward_one(&expert_ids, &weights, &input, &mut output)
    }

    /// Top-level entry point: chunks batches larger than `group_max_len`
    /// and recurses; batches smaller than `group_min_len` fall back to
    /// iterated [`Self::forward_one`]. `batch_size_tensor` is decremented as
    /// chunks complete so a host-visible counter tracks remaining work
    /// across the recursion. `output` is `qlen x hidden_size` in the
    /// kernel's quantized format.
    pub fn forward(
        &self,
        qlen: usize,
        expert_ids: &[usize],
        weights: &[f32],
        input: &[f32],
        output: &mut [u8],
        batch_size_tensor: &mut usize,
    ) -> Result<(), EngineError> {
        if qlen == 0 {
            *batch_size_tensor = 0;
            return Ok(());
        }
        let out_row_bytes = self.kernel.quantized_len(1, self.hidden_size);
        if expert_ids.len() != qlen * self.k || weights.len() != qlen * self.k || output.len() != qlen * out_row_bytes {
            return Err(EngineError::ConfigurationError(
                "Moe::forward: routing table shape mismatch".into(),
            ));
        }

        if qlen < self.group_min_len {
            for t in 0..qlen {
                let in_start = t * self.hidden_size;
                let out_start = t * out_row_bytes;
                self.forward_one(
                    &expert_ids[t * self.k..(t + 1) * self.k],
                    &weights[t * self.k..(t + 1) * self.k],
                    &input[in_start..in_start + self.hidden_size],
                    &mut output[out_start..out_start + out_row_bytes],
                )?;
                *batch_size_tensor = qlen - t - 1;
            }
            return Ok(());
        }

        let mut offset = 0usize;
        while offset < qlen {
            let chunk_len = (qlen - offset).min(self.group_max_len);
            let in_start = offset * self.hidden_size;
            let out_start = offset * out_row_bytes;
            let route_start = offset * self.k;
            self.forward_many(
                chunk_len,
                &expert_ids[route_start..route_start + chunk_len * self.k],
                &weights[route_start..route_start + chunk_len * self.k],
                &input[in_start..in_start + chunk_len * self.hidden_size],
                &mut output[out_start..out_start + chunk_len * out_row_bytes],
            )?;
            offset += chunk_len;
            *batch_size_tensor = qlen - offset;
        }
        Ok(())
    }

    /// Single-token path: three-stage dispatch (gate/up+activate, down
    /// projection, weighted reduction).
    pub fn forward_one(
        &self,
        expert_ids: &[usize],
        weights: &[f32],
        input: &[f32],
        output: &mut [u8],
    ) -> Result<(), EngineError> {
        let k = self.k;
        if expert_ids.len() != k || weights.len() != k {
            return Err(EngineError::ConfigurationError(
                "forward_one: routing table must have k entries".into(),
            ));
        }
        let kernel = Arc::clone(&self.kernel);
        let mut q_input = vec![0u8; kernel.quantized_len(1, self.hidden_size)];
        kernel.from_float(input, 1, self.hidden_size, &mut q_input)?;
        let q_input = Arc::new(q_input);

        let intermediate = Arc::new(Mutex::new(vec![0.0f32; k * self.intermediate_size]));
        let nth_inter = self.gate_plan.nth;
        let num_nodes = self.gate_plan.num_nodes();
        let tile_size = self.tile_size;
        let hidden_size = self.hidden_size;
        let intermediate_size = self.intermediate_size;
        let gate_plan_ptr: *const BlockPlan = &self.gate_plan;
        let up_plan_ptr: *const BlockPlan = &self.up_plan;
        let expert_ids_stage1 = expert_ids.to_vec();

        {
            let q_input = Arc::clone(&q_input);
            let kernel = Arc::clone(&kernel);
            let intermediate = Arc::clone(&intermediate);
            self.executor.do_k_work_stealing_job(k, nth_inter, move |task_id| {
                let (node, expert_idx, local_tile) = decode_task_id(task_id, k, nth_inter, num_nodes);
                let expert = expert_ids_stage1[expert_idx];
                let gate_plan = unsafe { &*gate_plan_ptr };
                let up_plan = unsafe { &*up_plan_ptr };
                let gate_tile = gate_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let up_tile = up_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let global_tile = gate_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut gate_out = vec![0.0f32; tile_size];
                let mut up_out = vec![0.0f32; tile_size];
                kernel.gemm(&q_input, 1, gate_tile, tile_size, hidden_size, &mut gate_out).unwrap();
                kernel.gemm(&q_input, 1, up_tile, tile_size, hidden_size, &mut up_out).unwrap();

                let mut guard = intermediate.lock().unwrap();
                for col in 0..tile_size {
                    let row_base = expert_idx * intermediate_size;
                    guard[row_base + col_start + col] = silu_gated(up_out[col], gate_out[col]);
                }
            });
        }

        let intermediate = Arc::try_unwrap(intermediate)
            .map_err(|_| EngineError::HostContractViolation("intermediate buffer still shared".into()))?
            .into_inner()
            .unwrap();

        let mut q_down_input = vec![0u8; kernel.quantized_len(k, self.intermediate_size)];
        kernel.from_float(&intermediate, k, self.intermediate_size, &mut q_down_input)?;
        let q_down_input = Arc::new(q_down_input);

        let down_output = Arc::new(Mutex::new(vec![0.0f32; k * hidden_size]));
        let nth_hidden = self.down_plan.nth;
        let down_plan_ptr: *const BlockPlan = &self.down_plan;
        let expert_ids_stage2 = expert_ids.to_vec();

        {
            let q_down_input = Arc::clone(&q_down_input);
            let kernel = Arc::clone(&kernel);
            let down_output = Arc::clone(&down_output);
            self.executor.do_k_work_stealing_job(k, nth_hidden, move |task_id| {
                let (node, expert_idx, local_tile) = decode_task_id(task_id, k, nth_hidden, num_nodes);
                let expert = expert_ids_stage2[expert_idx];
                let down_plan = unsafe { &*down_plan_ptr };
                let weight_tile = down_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let global_tile = down_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let row_bytes = kernel.quantized_len(1, intermediate_size);
                let row_slice = &q_down_input[expert_idx * row_bytes..(expert_idx + 1) * row_bytes];
                let mut tile_out = vec![0.0f32; tile_size];
                kernel.gemm(row_slice, 1, weight_tile, tile_size, intermediate_size, &mut tile_out).unwrap();

                let mut guard = down_output.lock().unwrap();
                for col in 0..tile_size {
                    guard[expert_idx * hidden_size + col_start + col] = tile_out[col];
                }
            });
        }

        let down_output = Arc::try_unwrap(down_output)
            .map_err(|_| EngineError::HostContractViolation("down_output buffer still shared".into()))?
            .into_inner()
            .unwrap();

        let weights_owned = weights.to_vec();
        let row_stride_bytes = kernel.quantized_len(1, hidden_size);
        let per_tile = requant_per_tile(kernel.as_ref(), tile_size);
        let down_output = Arc::new(down_output);

        if per_tile {
            let out_ptr = OutBytesPtr(output.as_mut_ptr(), output.len());
            let down_output = Arc::clone(&down_output);
            let kernel = Arc::clone(&kernel);
            self.executor.do_k_work_stealing_job(1, nth_hidden, move |task_id| {
                let (node, _k_idx, local_tile) = decode_task_id(task_id, 1, nth_hidden, num_nodes);
                let global_tile = unsafe { (*down_plan_ptr).nodes[node].start_tile } + local_tile;
                let col_start = global_tile * tile_size;

                let mut acc = vec![0.0f32; tile_size];
                for expert_idx in 0..k {
                    let w = weights_owned[expert_idx];
                    for col in 0..tile_size {
                        acc[col] += down_output[expert_idx * hidden_size + col_start + col] * w;
                    }
                }
                let out = unsafe { std::slice::from_raw_parts_mut(out_ptr.0, out_ptr.1) };
                requantize_tile_row(kernel.as_ref(), &acc, col_start, row_stride_bytes, 0, out)
                    .expect("tile requantize shape invariants hold by construction");
            });
        } else {
            let scratch = Arc::new(Mutex::new(vec![0.0f32; hidden_size]));
            {
                let scratch = Arc::clone(&scratch);
                let down_output = Arc::clone(&down_output);
                self.executor.do_k_work_stealing_job(1, nth_hidden, move |task_id| {
                    let (node, _k_idx, local_tile) = decode_task_id(task_id, 1, nth_hidden, num_nodes);
                    let global_tile = unsafe { (*down_plan_ptr).nodes[node].start_tile } + local_tile;
                    let col_start = global_tile * tile_size;

                    let mut acc = vec![0.0f32; tile_size];
                    for expert_idx in 0..k {
                        let w = weights_owned[expert_idx];
                        for col in 0..tile_size {
                            acc[col] += down_output[expert_idx * hidden_size + col_start + col] * w;
                        }
                    }
                    let mut guard = scratch.lock().unwrap();
                    guard[col_start..col_start + tile_size].copy_from_slice(&acc);
                });
            }
            let scratch = Arc::try_unwrap(scratch)
                .map_err(|_| EngineError::HostContractViolation("output scratch buffer still shared".into()))?
                .into_inner()
                .unwrap();
            requantize_rows_job(&self.executor, kernel, scratch, 1, hidden_size, OutBytesPtr(output.as_mut_ptr(), output.len()));
        }

        Ok(())
    }

    /// Batched path: expert-major reordering. Tokens routed to the same
    /// expert are gathered into one contiguous per-expert input batch, run
    /// through one batched GEMM per tile, then scattered back during
    /// reduction.
    pub fn forward_many(
        &self,
        qlen: usize,
        expert_ids: &[usize],
        weights: &[f32],
        input: &[f32],
        output: &mut [u8],
    ) -> Result<(), EngineError> {
        if qlen == 0 {
            return Ok(());
        }
        let out_row_bytes = self.kernel.quantized_len(1, self.hidden_size);
        if qlen < self.executor.num_nodes() {
            // Too few tokens to profitably batch: fall back to per-token dispatch.
            for t in 0..qlen {
                let in_start = t * self.hidden_size;
                let out_start = t * out_row_bytes;
                self.forward_one(
                    &expert_ids[t * self.k..(t + 1) * self.k],
                    &weights[t * self.k..(t + 1) * self.k],
                    &input[in_start..in_start + self.hidden_size],
                    &mut output[out_start..out_start + out_row_bytes],
                )?;
            }
            return Ok(());
        }

        let k = self.k;
        let num_experts = self.num_experts;

        // Token-to-node is irrelevant here; what matters is expert-major
        // grouping: for each expert, the list of (token, slot) pairs
        // routed to it. `token_routing[t * k + j]` records where that
        // slot landed, `(expert, slot_pos)`, so the reduction stage below
        // needs no lookup back into `slots_per_expert`.
        let mut slots_per_expert: Vec<Vec<(usize, usize)>> = vec![Vec::new(); num_experts];
        let mut token_routing: Vec<(usize, usize)> = vec![(0, 0); qlen * k];
        for t in 0..qlen {
            for j in 0..k {
                let e = expert_ids[t * k + j];
                let slot_pos = slots_per_expert[e].len();
                slots_per_expert[e].push((t, j));
                token_routing[t * k + j] = (e, slot_pos);
            }
        }

        let kernel = Arc::clone(&self.kernel);
        let mut q_input = vec![0u8; kernel.quantized_len(qlen, self.hidden_size)];
        kernel.from_float(input, qlen, self.hidden_size, &mut q_input)?;

        // Per-expert gathered quantized input batches.
        let mut gathered: Vec<Vec<u8>> = Vec::with_capacity(num_experts);
        let row_bytes = kernel.quantized_len(1, self.hidden_size);
        for slots in &slots_per_expert {
            let mut buf = vec![0u8; slots.len() * row_bytes];
            for (i, &(t, _)) in slots.iter().enumerate() {
                buf[i * row_bytes..(i + 1) * row_bytes]
                    .copy_from_slice(&q_input[t * row_bytes..(t + 1) * row_bytes]);
            }
            gathered.push(buf);
        }
        let gathered = Arc::new(gathered);

        // Gate+up+activate, batched per expert, tiled over intermediate.
        let per_expert_intermediate: Vec<Mutex<Vec<f32>>> = slots_per_expert
            .iter()
            .map(|slots| Mutex::new(vec![0.0f32; slots.len() * self.intermediate_size]))
            .collect();
        let per_expert_intermediate = Arc::new(per_expert_intermediate);

        let nth_inter = self.gate_plan.nth;
        let num_nodes = self.gate_plan.num_nodes();
        let tile_size = self.tile_size;
        let hidden_size = self.hidden_size;
        let intermediate_size = self.intermediate_size;
        let gate_plan_ptr: *const BlockPlan = &self.gate_plan;
        let up_plan_ptr: *const BlockPlan = &self.up_plan;
        let slot_counts: Vec<usize> = slots_per_expert.iter().map(|s| s.len()).collect();

        {
            let gathered = Arc::clone(&gathered);
            let kernel = Arc::clone(&kernel);
            let per_expert_intermediate = Arc::clone(&per_expert_intermediate);
            let slot_counts = slot_counts.clone();
            self.executor.do_k_work_stealing_job(num_experts, nth_inter, move |task_id| {
                let (node, expert, local_tile) = decode_task_id(task_id, num_experts, nth_inter, num_nodes);
                let rows = slot_counts[expert];
                if rows == 0 {
                    return;
                }
                let gate_plan = unsafe { &*gate_plan_ptr };
                let up_plan = unsafe { &*up_plan_ptr };
                let gate_tile = gate_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let up_tile = up_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let global_tile = gate_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut gate_out = vec![0.0f32; rows * tile_size];
                let mut up_out = vec![0.0f32; rows * tile_size];
                kernel.gemm(&gathered[expert], rows, gate_tile, tile_size, hidden_size, &mut gate_out).unwrap();
                kernel.gemm(&gathered[expert], rows, up_tile, tile_size, hidden_size, &mut up_out).unwrap();

                let mut guard = per_expert_intermediate[expert].lock().unwrap();
                for r in 0..rows {
                    for c in 0..tile_size {
                        let g = gate_out[r * tile_size + c];
                        let u = up_out[r * tile_size + c];
                        guard[r * intermediate_size + col_start + c] = silu_gated(u, g);
                    }
                }
            });
        }

        // Requantize each expert's intermediate batch, run down GEMM.
        let mut q_down_inputs: Vec<Vec<u8>> = Vec::with_capacity(num_experts);
        for (e, rows) in slot_counts.iter().enumerate() {
            let guard = per_expert_intermediate[e].lock().unwrap();
            let mut q = vec![0u8; kernel.quantized_len(*rows, intermediate_size)];
            if *rows > 0 {
                kernel.from_float(&guard, *rows, intermediate_size, &mut q)?;
            }
            q_down_inputs.push(q);
        }
        let q_down_inputs = Arc::new(q_down_inputs);

        let per_expert_down: Vec<Mutex<Vec<f32>>> = slot_counts
            .iter()
            .map(|&rows| Mutex::new(vec![0.0f32; rows * self.hidden_size]))
            .collect();
        let per_expert_down = Arc::new(per_expert_down);

        let nth_hidden = self.down_plan.nth;
        let down_plan_ptr: *const BlockPlan = &self.down_plan;

        {
            let q_down_inputs = Arc::clone(&q_down_inputs);
            let kernel = Arc::clone(&kernel);
            let per_expert_down = Arc::clone(&per_expert_down);
            let slot_counts = slot_counts.clone();
            self.executor.do_k_work_stealing_job(num_experts, nth_hidden, move |task_id| {
                let (node, expert, local_tile) = decode_task_id(task_id, num_experts, nth_hidden, num_nodes);
                let rows = slot_counts[expert];
                if rows == 0 {
                    return;
                }
                let down_plan = unsafe { &*down_plan_ptr };
                let weight_tile = down_plan.nodes[node].tile_bytes_for(expert, local_tile);
                let global_tile = down_plan.nodes[node].start_tile + local_tile;
                let col_start = global_tile * tile_size;

                let mut tile_out = vec![0.0f32; rows * tile_size];
                kernel
                    .gemm(&q_down_inputs[expert], rows, weight_tile, tile_size, intermediate_size, &mut tile_out)
                    .unwrap();

                let mut guard = per_expert_down[expert].lock().unwrap();
                for r in 0..rows {
                    for c in 0..tile_size {
                        guard[r * hidden_size + col_start + c] = tile_out[r * tile_size + c];
                    }
                }
            });
        }

        let per_expert_down: Vec<Vec<f32>> = Arc::try_unwrap(per_expert_down)
            .map_err(|_| EngineError::HostContractViolation("per_expert_down still shared".into()))?
            .into_iter()
            .map(|m| m.into_inner().unwrap())
            .collect();
        let per_expert_down = Arc::new(per_expert_down);
        let token_routing = Arc::new(token_routing);
        let weights_owned = weights.to_vec();
        let row_stride_bytes = kernel.quantized_len(1, hidden_size);
        let per_tile = requant_per_tile(kernel.as_ref(), tile_size);

        // Reduction, dispatched over `qlen * nth_hidden` logical tasks: for
        // each (token, hidden tile) pair, initialize from slot 0's
        // contribution, accumulate slots 1..k, then requantize the tile
        // into the host output.
        if per_tile {
            let out_ptr = OutBytesPtr(output.as_mut_ptr(), output.len());
            let per_expert_down = Arc::clone(&per_expert_down);
            let token_routing = Arc::clone(&token_routing);
            let kernel = Arc::clone(&kernel);
            self.executor.do_k_work_stealing_job(qlen, nth_hidden, move |task_id| {
                let (node, token_t, local_tile) = decode_task_id(task_id, qlen, nth_hidden, num_nodes);
                let global_tile = unsafe { (*down_plan_ptr).nodes[node].start_tile } + local_tile;
                let col_start = global_tile * tile_size;

                let (e0, slot0) = token_routing[token_t * k];
                let mut acc = vec![0.0f32; tile_size];
                let src0 = slot0 * hidden_size + col_start;
                acc.copy_from_slice(&per_expert_down[e0][src0..src0 + tile_size]);
                let w0 = weights_owned[token_t * k];
                for c in 0..tile_size {
                    acc[c] *= w0;
                }
                for j in 1..k {
                    let (e, slot_pos) = token_routing[token_t * k + j];
                    let w = weights_owned[token_t * k + j];
                    let src = slot_pos * hidden_size + col_start;
                    for c in 0..tile_size {
                        acc[c] += per_expert_down[e][src + c] * w;
                    }
                }

                let out = unsafe { std::slice::from_raw_parts_mut(out_ptr.0, out_ptr.1) };
                requantize_tile_row(kernel.as_ref(), &acc, col_start, row_stride_bytes, token_t, out)
                    .expect("tile requantize shape invariants hold by construction");
            });
        } else {
            let scratch = Arc::new(Mutex::new(vec![0.0f32; qlen * hidden_size]));
            {
                let scratch = Arc::clone(&scratch);
                let per_expert_down = Arc::clone(&per_expert_down);
                let token_routing = Arc::clone(&token_routing);
                self.executor.do_k_work_stealing_job(qlen, nth_hidden, move |task_id| {
                    let (node, token_t, local_tile) = decode_task_id(task_id, qlen, nth_hidden, num_nodes);
                    let global_tile = unsafe { (*down_plan_ptr).nodes[node].start_tile } + local_tile;
                    let col_start = global_tile * tile_size;

                    let (e0, slot0) = token_routing[token_t * k];
                    let mut acc = vec![0.0f32; tile_size];
                    let src0 = slot0 * hidden_size + col_start;
                    acc.copy_from_slice(&per_expert_down[e0][src0..src0 + tile_size]);
                    let w0 = weights_owned[token_t * k];
                    for c in 0..tile_size {
                        acc[c] *= w0;
                    }
                    for j in 1..k {
                        let (e, slot_pos) = token_routing[token_t * k + j];
                        let w = weights_owned[token_t * k + j];
                        let src = slot_pos * hidden_size + col_start;
                        for c in 0..tile_size {
                            acc[c] += per_expert_down[e][src + c] * w;
                        }
                    }

                    let mut guard = scratch.lock().unwrap();
                    let dst = token_t * hidden_size + col_start;
                    guard[dst..dst + tile_size].copy_from_slice(&acc);
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

    fn identity_weight(experts: usize, m: usize, k: usize) -> Vec<f32> {
        let mut w = vec![0.0f32; experts * m * k];
        for e in 0..experts {
            for i in 0..m.min(k) {
                w[e * m * k + i * k + i] = 1.0;
            }
        }
        w
    }

    /// 4 experts, k=2, diagonal gate/up/down, ones(16) input, experts
    /// {0,1} weighted {0.25, 0.75} -> output = act(1) per element.
    #[test]
    fn forward_one_matches_weighted_identity_reference() {
        let topo = single_node_topology(6);
        let executor = Arc::new(Executor::with_worker_count(&topo, WorkerCount(4)).unwrap());
        let kernel = Arc::new(Fp32Identity);

        let (e, hidden, inter, tile) = (4usize, 16usize, 32usize, 8usize);
        let gate = identity_weight(e, inter, hidden);
        let up = identity_weight(e, inter, hidden);
        let down = identity_weight(e, hidden, inter);

        let moe = Moe::new(executor, Arc::clone(&kernel), &gate, &up, &down, e, hidden, inter, tile, 2).unwrap();

        let expert_ids = vec![0usize, 1usize];
        let weights = vec![0.25f32, 0.75f32];
        let input = vec![1.0f32; hidden];
        let mut output = vec![0u8; kernel.quantized_len(1, hidden)];
        moe.forward_one(&expert_ids, &weights, &input, &mut output).unwrap();

        let mut out_f32 = vec![0.0f32; hidden];
        kernel.to_float(&output, 1, hidden, &mut out_f32).unwrap();
        let expected = super::silu_gated(1.0, 1.0);
        for v in &out_f32 {
            assert!((v - expected).abs() < 1e-5, "{v} != {expected}");
        }
    }

    #[test]
    fn forward_zero_qlen_is_a_no_op() {
        let topo = single_node_topology(4);
        let executor = Arc::new(Executor::with_worker_count(&topo, WorkerCount(2)).unwrap());
        let kernel = Arc::new(Fp32Identity);
        let (e, hidden, inter, tile) = (2usize, 8usize, 8usize, 4usize);
        let gate = identity_weight(e, inter, hidden);
        let up = identity_weight(e, inter, hidden);
        let down = identity_weight(e, hidden, inter);
        let moe = Moe::new(executor, kernel, &gate, &up, &down, e, hidden, inter, tile, 1).unwrap();
        let mut batch = 0usize;
        moe.forward(0, &[], &[], &[], &mut [], &mut batch).unwrap();
        assert_eq!(batch, 0);
    }

    fn two_node_topology(cpus_per_node: usize) -> Topology {
        let mut cpus = Vec::new();
        let mut nodes = Vec::new();
        let mut cpu_id = 0;
        for node_id in 0..2 {
            let mut node_cpus = Vec::new();
            for _ in 0..cpus_per_node {
                cpus.push(CpuInfo {
                    cpu_id,
                    core_id: cpu_id,
                    node_id,
                    package_id: node_id,
                    sibling_rank: 0,
                });
                node_cpus.push(cpu_id);
                cpu_id += 1;
            }
            nodes.push(node_cpus);
        }
        Topology {
            cpus,
            nodes,
            num_cores: cpu_id,
        }
    }

    /// On a two-node machine, every weight-tile pointer a task reads from
    /// must belong to the node that task was dispatched to.
    #[test]
    fn gate_plan_tiles_never_cross_node_boundaries() {
        let topo = two_node_topology(2);
        let (e, hidden, inter, tile) = (4usize, 16usize, 32usize, 8usize);
        let gate = identity_weight(e, inter, hidden);
        let kernel = Fp32Identity;
        let plan = BlockPlan::build(&gate, e, inter, hidden, tile, topo.num_nodes(), &kernel).unwrap();

        let nth = plan.nth;
        let num_nodes = plan.num_nodes();
        for task_id in 0..e * nth {
            let (node, expert, local_tile) = decode_task_id(task_id, e, nth, num_nodes);
            let tile_bytes = plan.nodes[node].tile_bytes_for(expert, local_tile);
            let ptr = tile_bytes.as_ptr();
            for (other, block) in plan.nodes.iter().enumerate() {
                if other != node {
                    assert!(!block.contains_ptr(ptr), "tile leaked into node {other}'s buffer");
                } else {
                    assert!(block.contains_ptr(ptr));
                }
            }
        }
    }
}
