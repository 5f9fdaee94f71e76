// src/topology.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Topology probe.
//!
//! Discovers CPUs, cores, hyperthread siblings and NUMA nodes via
//! `hwlocality`, the same crate used for NUMA-aware allocation
//! (`crate::alloc`) and thread pinning plumbing. Builds the dense
//! `(package_id, raw_core_id) -> core_id` table and per-CPU `sibling_rank`
//! the executor's worker-CPU assignment depends on.
//!
//! `Topology` is installed once at process startup and is immutable for the
//! remainder of the process; re-detecting is intentionally not exposed.

use crate::error::{abort_fatal, EngineError};
use hwlocality::object::types::ObjectType;
use hwlocality::Topology as HwTopology;

/// Per-logical-CPU descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub cpu_id: usize,
    /// Dense core id: collapses hyperthread siblings onto one value.
    pub core_id: usize,
    pub node_id: usize,
    pub package_id: usize,
    /// 0 for the first logical CPU of a core, 1 for the second, etc.
    pub sibling_rank: usize,
}

/// Immutable system topology, probed once at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    pub cpus: Vec<CpuInfo>,
    /// CPU ids belonging to each NUMA node, indexed by node id.
    pub nodes: Vec<Vec<usize>>,
    pub(crate) num_cores: usize,
}

impl Topology {
    /// Probe the host topology.
    ///
    /// Fails with [`EngineError::EnvUnavailable`] only when the underlying
    /// topology facility itself cannot be queried at all (hwloc
    /// initialization failure) -- a single-NUMA-node machine is a valid
    /// topology, not an unavailable one.
    pub fn detect() -> Result<Self, EngineError> {
        tracing::debug!("probing host topology via hwlocality");

        let topo = HwTopology::new()
            .map_err(|e| EngineError::EnvUnavailable(format!("hwloc init failed: {e}")))?;

        let pus: Vec<_> = topo.objects_with_type(ObjectType::PU).collect();
        let cores: Vec<_> = topo.objects_with_type(ObjectType::Core).collect();
        let packages: Vec<_> = topo.objects_with_type(ObjectType::Package).collect();
        let numa_nodes: Vec<_> = topo.objects_with_type(ObjectType::NUMANode).collect();

        if pus.is_empty() {
            return Err(EngineError::EnvUnavailable(
                "topology probe found zero processing units".into(),
            ));
        }
        let num_cpus = pus.len();

        // (package_os_index, core_os_index) -> dense core id, assigned in
        // first-seen discovery order.
        let mut unique_cores: std::collections::BTreeMap<(usize, usize), usize> =
            std::collections::BTreeMap::new();
        let mut sibling_counts: std::collections::HashMap<usize, usize> =
            std::collections::HashMap::new();
        let mut next_core_id = 0usize;

        let node_of = |pu_idx: usize| -> usize {
            if numa_nodes.is_empty() {
                return 0;
            }
            for (nid, node) in numa_nodes.iter().enumerate() {
                if let Some(cpuset) = node.cpuset() {
                    if cpuset.is_set(pu_idx) {
                        return node.os_index().unwrap_or(nid);
                    }
                }
            }
            0
        };

        let core_of = |pu_idx: usize| -> usize {
            for core in &cores {
                if let Some(cpuset) = core.cpuset() {
                    if cpuset.is_set(pu_idx) {
                        return core.os_index().unwrap_or(0);
                    }
                }
            }
            pu_idx
        };

        let package_of = |pu_idx: usize| -> usize {
            for pkg in &packages {
                if let Some(cpuset) = pkg.cpuset() {
                    if cpuset.is_set(pu_idx) {
                        return pkg.os_index().unwrap_or(0);
                    }
                }
            }
            0
        };

        let mut cpus = Vec::with_capacity(num_cpus);
        let mut nodes: Vec<Vec<usize>> = Vec::new();

        for pu in &pus {
            let cpu_id = pu.os_index().unwrap_or(cpus.len());
            let raw_core_id = core_of(cpu_id);
            let package_id = package_of(cpu_id);
            let node_id = node_of(cpu_id);

            let key = (package_id, raw_core_id);
            let core_id = *unique_cores.entry(key).or_insert_with(|| {
                let id = next_core_id;
                next_core_id += 1;
                id
            });
            let sibling_rank = *sibling_counts.get(&core_id).unwrap_or(&0);
            sibling_counts.insert(core_id, sibling_rank + 1);

            if nodes.len() <= node_id {
                nodes.resize(node_id + 1, Vec::new());
            }
            nodes[node_id].push(cpu_id);

            cpus.push(CpuInfo {
                cpu_id,
                core_id,
                node_id,
                package_id,
                sibling_rank,
            });
        }

        cpus.sort_by_key(|c| c.cpu_id);
        for node_cpus in &mut nodes {
            node_cpus.sort_unstable();
        }

        let num_cores = next_core_id.max(1);

        tracing::info!(
            num_cpus,
            num_cores,
            num_nodes = nodes.len(),
            hyperthreaded = num_cpus > num_cores,
            "topology probe complete"
        );

        Ok(Self {
            cpus,
            nodes,
            num_cores,
        })
    }

    /// Production entry point: probes the topology and aborts the process
    /// via [`abort_fatal`] on failure, enforcing the fatal contract
    /// `EnvUnavailable` documents. [`Self::detect`] stays a plain `Result`
    /// so library callers (and its own test) can handle a missing NUMA
    /// facility without crashing the test runner.
    pub fn detect_or_abort() -> Self {
        Self::detect().unwrap_or_else(|e| abort_fatal(e))
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// `num_cpus > num_cores`: hyperthreading is in effect.
    pub fn hyperthreaded(&self) -> bool {
        self.num_cpus() > self.num_cores()
    }

    pub fn node_of_cpu(&self, cpu_id: usize) -> Option<usize> {
        self.cpus.iter().find(|c| c.cpu_id == cpu_id).map(|c| c.node_id)
    }
}
