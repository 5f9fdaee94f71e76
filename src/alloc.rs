// src/alloc.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aligned allocator: a 64-byte aligned heap-local variant and a 64-byte
//! aligned NUMA-node-local variant.
//!
//! The NUMA-local path resolves a NUMA node's `nodeset` via
//! `hwlocality::Topology` and asks `binding_allocate_memory` to bind the
//! pages to it with [`MemoryBindingPolicy::Bind`]. Allocations are released
//! explicitly by whoever owns an `AlignedBlock`, so it frees on `Drop`
//! rather than being handed off to an external buffer protocol.

use crate::constants::ALLOC_ALIGN;
use crate::error::EngineError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[cfg(feature = "numa")]
use hwlocality::{
    memory::binding::{MemoryBindingFlags, MemoryBindingPolicy},
    object::types::ObjectType,
    Topology as HwTopology,
};

/// A single 64-byte aligned allocation, either plain heap memory or memory
/// bound to a specific NUMA node. Frees itself on drop.
pub enum AlignedBlock {
    Heap {
        ptr: NonNull<u8>,
        layout: Layout,
    },
    // `(Topology, Bytes, len)`: `Bytes`'s lifetime is tied to the `Topology`
    // that allocated it, so we keep both together and extend `Bytes` to
    // `'static` via `transmute`.
    #[cfg(feature = "numa")]
    Numa((HwTopology, hwlocality::memory::binding::Bytes<'static>, usize)),
}

// SAFETY: the underlying memory is exclusively owned by this block and
// never aliased outside of the `&mut`/`&` accessors below.
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

impl AlignedBlock {
    pub fn len(&self) -> usize {
        match self {
            AlignedBlock::Heap { layout, .. } => layout.size(),
            #[cfg(feature = "numa")]
            AlignedBlock::Numa((_, _, len)) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        match self {
            AlignedBlock::Heap { ptr, .. } => ptr.as_ptr(),
            #[cfg(feature = "numa")]
            AlignedBlock::Numa((_, bytes, _)) => bytes.as_ptr() as *const u8,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            AlignedBlock::Heap { ptr, .. } => ptr.as_ptr(),
            #[cfg(feature = "numa")]
            AlignedBlock::Numa((_, bytes, _)) => bytes.as_mut_ptr() as *mut u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len();
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        if let AlignedBlock::Heap { ptr, layout } = self {
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
        // The `Numa` variant's `Bytes` frees its hwloc-owned mapping on its
        // own drop; nothing further to do here.
    }
}

/// Heap-local 64-byte aligned allocator.
pub fn allocate_aligned(size: usize) -> Result<AlignedBlock, EngineError> {
    let size = size.max(1);
    let layout = Layout::from_size_align(size, ALLOC_ALIGN)
        .map_err(|e| EngineError::AllocationFailure(format!("bad layout: {e}")))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr).ok_or_else(|| {
        EngineError::AllocationFailure(format!("heap allocation of {size} bytes failed"))
    })?;
    Ok(AlignedBlock::Heap { ptr, layout })
}

/// NUMA-node-local 64-byte aligned allocator: physically resident on `node`.
#[cfg(feature = "numa")]
pub fn allocate_aligned_numa(size: usize, node: usize) -> Result<AlignedBlock, EngineError> {
    let size = size.max(1);
    let topology = HwTopology::new()
        .map_err(|e| EngineError::EnvUnavailable(format!("hwloc init failed: {e}")))?;

    let numa_nodes: Vec<_> = topology.objects_with_type(ObjectType::NUMANode).collect();
    let node_obj = numa_nodes
        .iter()
        .find(|n| n.os_index() == Some(node))
        .ok_or_else(|| {
            EngineError::AllocationFailure(format!(
                "NUMA node {node} not found (available: {:?})",
                numa_nodes.iter().filter_map(|n| n.os_index()).collect::<Vec<_>>()
            ))
        })?;
    let nodeset = node_obj
        .nodeset()
        .ok_or_else(|| EngineError::AllocationFailure(format!("node {node} has no nodeset")))?;

    let bytes = topology
        .binding_allocate_memory(
            size,
            nodeset,
            MemoryBindingPolicy::Bind,
            MemoryBindingFlags::ASSUME_SINGLE_THREAD,
        )
        .map_err(|e| {
            EngineError::AllocationFailure(format!("NUMA allocation on node {node} failed: {e}"))
        })?;

    // SAFETY: we extend `bytes` to `'static` because we store it together
    // with the `Topology` it borrows from; the `Topology` lives exactly as
    // long as `bytes` does, inside the same `AlignedBlock::Numa` tuple.
    let bytes_static = unsafe {
        std::mem::transmute::<
            hwlocality::memory::binding::Bytes<'_>,
            hwlocality::memory::binding::Bytes<'static>,
        >(bytes)
    };

    Ok(AlignedBlock::Numa((topology, bytes_static, size)))
}

#[cfg(not(feature = "numa"))]
pub fn allocate_aligned_numa(size: usize, _node: usize) -> Result<AlignedBlock, EngineError> {
    allocate_aligned(size)
}
