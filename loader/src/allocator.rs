//! Allocation front-end over [`MemoryServices`].
//!
//! Untyped allocations are tagged `LOADER_RECLAIMABLE`: the kernel may free
//! them once it has consumed whatever they hold. "Critical" variants abort
//! the load on failure; everything the load path cannot survive without goes
//! through them.

use log::warn;

use shared::addr::{page_count, PhysAddr, PAGE_SIZE};
use shared::protocol::MEMORY_LOADER_RECLAIMABLE;

use crate::services::MemoryServices;

/// Top-down allocations stay below 4 GiB so 32-bit kernels and the identity
/// mapping can always reach them.
pub const ALLOCATION_CEILING: u64 = 4 * 1024 * 1024 * 1024;

pub fn allocate_pages_with_kind(ms: &dyn MemoryServices, count: u64, kind: u32) -> Option<PhysAddr> {
    let result = ms.allocate_pages(count, ALLOCATION_CEILING, kind);
    if result.is_none() {
        warn!("failed to satisfy an allocation of {count} pages of type {kind:#x}");
    }
    result
}

pub fn allocate_pages(ms: &dyn MemoryServices, count: u64) -> Option<PhysAddr> {
    allocate_pages_with_kind(ms, count, MEMORY_LOADER_RECLAIMABLE)
}

pub fn allocate_critical_pages_with_kind(ms: &dyn MemoryServices, count: u64, kind: u32) -> PhysAddr {
    match ms.allocate_pages(count, ALLOCATION_CEILING, kind) {
        Some(addr) => addr,
        None => panic!("failed to satisfy a critical allocation of {count} pages of type {kind:#x}"),
    }
}

pub fn allocate_critical_pages_at(
    ms: &dyn MemoryServices,
    address: PhysAddr,
    count: u64,
    kind: u32,
) -> PhysAddr {
    match ms.allocate_pages_at(address, count, kind) {
        Some(addr) => addr,
        None => panic!(
            "failed to satisfy a critical allocation at {address:?} with {count} pages of type {kind:#x}"
        ),
    }
}

pub fn allocate_critical_pages(ms: &dyn MemoryServices, count: u64) -> PhysAddr {
    allocate_critical_pages_with_kind(ms, count, MEMORY_LOADER_RECLAIMABLE)
}

pub fn allocate_critical_bytes(ms: &dyn MemoryServices, bytes: u64) -> PhysAddr {
    allocate_critical_pages(ms, page_count(bytes))
}

pub fn free_pages(ms: &dyn MemoryServices, address: PhysAddr, count: u64) {
    ms.free_pages(address, count);
}

pub fn free_bytes(ms: &dyn MemoryServices, address: PhysAddr, bytes: u64) {
    ms.free_pages(address, page_count(bytes));
}

/// A page allocation released on every exit path.
pub struct ScopedPages<'a> {
    ms: &'a dyn MemoryServices,
    base: PhysAddr,
    count: u64,
}

impl<'a> ScopedPages<'a> {
    pub fn allocate_critical_bytes(ms: &'a dyn MemoryServices, bytes: u64) -> Self {
        let count = page_count(bytes).max(1);
        ScopedPages {
            ms,
            base: allocate_critical_pages(ms, count),
            count,
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self.ms.phys_to_virt(self.base),
                (self.count * PAGE_SIZE) as usize,
            )
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.ms.phys_to_virt(self.base),
                (self.count * PAGE_SIZE) as usize,
            )
        }
    }
}

impl Drop for ScopedPages<'_> {
    fn drop(&mut self) {
        self.ms.free_pages(self.base, self.count);
    }
}
