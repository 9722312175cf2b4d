//! Builds the 64-bit kernel address space.
//!
//! Four-level tables, 2 MiB huge pages wherever a window allows it. Table
//! nodes come out of loader-reclaimable memory; the kernel keeps them alive
//! until it installs its own tables.

use shared::addr::{page_count, PhysAddr, HUGE_PAGE_SIZE, PAGE_SIZE};

use crate::allocator::{allocate_critical_pages, allocate_pages};
use crate::binary::{BinaryInfo, Bitness};
use crate::services::MemoryServices;
use crate::{DIRECT_MAP_BASE, KERNEL_IMAGE_BASE};

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_READWRITE: u64 = 1 << 1;
const PAGE_HUGE: u64 = 1 << 7;

const ENTRIES_PER_TABLE: u64 = 512;

const GB: u64 = 1024 * 1024 * 1024;

/// A four-level table rooted at `root`.
#[derive(Clone, Copy, Debug)]
pub struct AddressSpace {
    pub root: PhysAddr,
}

impl AddressSpace {
    pub fn new(ms: &dyn MemoryServices) -> Self {
        let root = allocate_critical_pages(ms, 1);
        zero_table(ms, root);
        AddressSpace { root }
    }
}

fn zero_table(ms: &dyn MemoryServices, table: PhysAddr) {
    unsafe {
        core::ptr::write_bytes(ms.phys_to_virt(table), 0, PAGE_SIZE as usize);
    }
}

fn entry_at(ms: &dyn MemoryServices, table: PhysAddr, index: u64) -> *mut u64 {
    assert!(index < ENTRIES_PER_TABLE);
    unsafe { (ms.phys_to_virt(table) as *mut u64).add(index as usize) }
}

/// Returns the table an entry points at, allocating and wiring a fresh one
/// if the slot is empty.
fn table_at(ms: &dyn MemoryServices, table: PhysAddr, index: u64) -> Option<PhysAddr> {
    let slot = entry_at(ms, table, index);
    let entry = unsafe { *slot };

    if entry & PAGE_PRESENT != 0 {
        assert!(entry & PAGE_HUGE == 0, "remapping a huge page");
        return Some(PhysAddr::new(entry & !0xFFF));
    }

    let page = allocate_pages(ms, 1)?;
    zero_table(ms, page);
    unsafe {
        *slot = page.as_u64() | PAGE_READWRITE | PAGE_PRESENT;
    }
    Some(page)
}

fn do_map_page(
    ms: &dyn MemoryServices,
    space: &AddressSpace,
    virtual_base: u64,
    physical_base: u64,
    huge: bool,
) -> bool {
    let granule = if huge { HUGE_PAGE_SIZE } else { PAGE_SIZE };
    assert!(virtual_base % granule == 0);
    assert!(physical_base % granule == 0);

    let lvl4_index = (virtual_base >> 39) & (ENTRIES_PER_TABLE - 1);
    let lvl3_index = (virtual_base >> 30) & (ENTRIES_PER_TABLE - 1);
    let lvl2_index = (virtual_base >> 21) & (ENTRIES_PER_TABLE - 1);
    let lvl1_index = (virtual_base >> 12) & (ENTRIES_PER_TABLE - 1);

    let Some(lvl3) = table_at(ms, space.root, lvl4_index) else {
        return false;
    };
    let Some(lvl2) = table_at(ms, lvl3, lvl3_index) else {
        return false;
    };

    if huge {
        unsafe {
            *entry_at(ms, lvl2, lvl2_index) =
                physical_base | PAGE_HUGE | PAGE_READWRITE | PAGE_PRESENT;
        }
        return true;
    }

    let Some(lvl1) = table_at(ms, lvl2, lvl2_index) else {
        return false;
    };
    unsafe {
        *entry_at(ms, lvl1, lvl1_index) = physical_base | PAGE_READWRITE | PAGE_PRESENT;
    }
    true
}

pub fn map_pages(
    ms: &dyn MemoryServices,
    space: &AddressSpace,
    mut virtual_base: u64,
    mut physical_base: u64,
    pages: u64,
) -> bool {
    for _ in 0..pages {
        if !do_map_page(ms, space, virtual_base, physical_base, false) {
            return false;
        }

        virtual_base = virtual_base.wrapping_add(PAGE_SIZE);
        physical_base = physical_base.wrapping_add(PAGE_SIZE);
    }

    true
}

pub fn map_huge_pages(
    ms: &dyn MemoryServices,
    space: &AddressSpace,
    mut virtual_base: u64,
    mut physical_base: u64,
    pages: u64,
) -> bool {
    for _ in 0..pages {
        if !do_map_page(ms, space, virtual_base, physical_base, true) {
            return false;
        }

        virtual_base = virtual_base.wrapping_add(HUGE_PAGE_SIZE);
        physical_base = physical_base.wrapping_add(HUGE_PAGE_SIZE);
    }

    true
}

pub fn map_critical_pages(
    ms: &dyn MemoryServices,
    space: &AddressSpace,
    virtual_base: u64,
    physical_base: u64,
    pages: u64,
) {
    if !map_pages(ms, space, virtual_base, physical_base, pages) {
        panic!("out of memory while mapping {pages} critical pages at {virtual_base:#x}");
    }
}

pub fn map_critical_huge_pages(
    ms: &dyn MemoryServices,
    space: &AddressSpace,
    virtual_base: u64,
    physical_base: u64,
    pages: u64,
) {
    if !map_huge_pages(ms, space, virtual_base, physical_base, pages) {
        panic!("out of memory while mapping {pages} critical huge pages at {virtual_base:#x}");
    }
}

/// Builds the kernel address space for a 64-bit kernel; 32-bit kernels run
/// on the firmware's identity mapping and get no table (root 0).
pub fn build_kernel_address_space(ms: &dyn MemoryServices, info: &BinaryInfo) -> u64 {
    if info.bitness != Bitness::Bits64 {
        return 0;
    }

    let space = AddressSpace::new(ms);

    // Identity map the bottom 4 GiB.
    map_critical_huge_pages(ms, &space, 0, 0, 4 * GB / HUGE_PAGE_SIZE);

    // The direct-map window over the same range.
    map_critical_huge_pages(ms, &space, DIRECT_MAP_BASE, 0, 4 * GB / HUGE_PAGE_SIZE);

    if !info.kernel_range_is_direct_map {
        // The image was placed anywhere in physical memory; map its virtual
        // range onto wherever it landed.
        let pages = page_count(info.physical_ceiling - info.physical_base);
        map_critical_pages(ms, &space, info.virtual_base, info.physical_base, pages);
    } else {
        // The -2 GiB window covers a fixed-placement kernel.
        map_critical_huge_pages(ms, &space, KERNEL_IMAGE_BASE, 0, 2 * GB / HUGE_PAGE_SIZE);
    }

    space.root.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockMemory;
    use crate::HIGHER_HALF_BASE;

    /// Follows the table walk the MMU would do.
    fn resolve(ms: &MockMemory, root: u64, virt: u64) -> Option<u64> {
        let mut table = PhysAddr::new(root);

        for level in (1..=4).rev() {
            let shift = 12 + 9 * (level - 1);
            let index = (virt >> shift) & (ENTRIES_PER_TABLE - 1);
            let entry = unsafe { *entry_at(ms, table, index) };

            if entry & PAGE_PRESENT == 0 {
                return None;
            }

            if entry & PAGE_HUGE != 0 {
                assert_eq!(level, 2, "huge bit outside level 2");
                return Some((entry & !0xFFF & !(PAGE_HUGE)) + (virt & (HUGE_PAGE_SIZE - 1)));
            }

            if level == 1 {
                return Some((entry & !0xFFF) + (virt & (PAGE_SIZE - 1)));
            }

            table = PhysAddr::new(entry & !0xFFF);
        }

        unreachable!()
    }

    fn info64(direct_map: bool) -> BinaryInfo {
        BinaryInfo {
            bitness: Bitness::Bits64,
            entrypoint: KERNEL_IMAGE_BASE + 0x100000,
            virtual_base: KERNEL_IMAGE_BASE + 0x100000,
            virtual_ceiling: KERNEL_IMAGE_BASE + 0x103000,
            physical_base: 0x780000,
            physical_ceiling: 0x783000,
            kernel_range_is_direct_map: direct_map,
        }
    }

    #[test]
    fn no_table_for_32_bit_kernels() {
        let ms = MockMemory::new(4 * 1024 * 1024);
        let info = BinaryInfo {
            bitness: Bitness::Bits32,
            ..info64(true)
        };
        assert_eq!(build_kernel_address_space(&ms, &info), 0);
        // And nothing was allocated for it.
        assert_eq!(ms.key(), 0);
    }

    #[test]
    fn identity_and_direct_map_windows() {
        let ms = MockMemory::new(16 * 1024 * 1024);
        let root = build_kernel_address_space(&ms, &info64(true));
        assert_ne!(root, 0);

        for phys in [0u64, 0x200000, 0x7FFF_F000, 4 * GB - PAGE_SIZE] {
            assert_eq!(resolve(&ms, root, phys), Some(phys));
            assert_eq!(resolve(&ms, root, DIRECT_MAP_BASE + phys), Some(phys));
        }

        // Nothing above the windows.
        assert_eq!(resolve(&ms, root, DIRECT_MAP_BASE + 4 * GB), None);
    }

    #[test]
    fn fixed_placement_kernel_uses_image_window() {
        let ms = MockMemory::new(16 * 1024 * 1024);
        let root = build_kernel_address_space(&ms, &info64(true));

        // The -2 GiB window maps straight onto low physical memory.
        assert_eq!(
            resolve(&ms, root, KERNEL_IMAGE_BASE + 0x100000),
            Some(0x100000)
        );
        assert_eq!(
            resolve(&ms, root, KERNEL_IMAGE_BASE + (2 * GB - PAGE_SIZE)),
            Some(2 * GB - PAGE_SIZE)
        );
    }

    #[test]
    fn relocated_kernel_gets_explicit_mapping() {
        let ms = MockMemory::new(16 * 1024 * 1024);
        let root = build_kernel_address_space(&ms, &info64(false));

        // virtual_base..ceiling maps onto the allocated physical range with
        // 4 KiB granularity.
        assert_eq!(
            resolve(&ms, root, KERNEL_IMAGE_BASE + 0x100000),
            Some(0x780000)
        );
        assert_eq!(
            resolve(&ms, root, KERNEL_IMAGE_BASE + 0x102fff),
            Some(0x782fff)
        );
        assert_eq!(resolve(&ms, root, KERNEL_IMAGE_BASE + 0x103000), None);
    }

    #[test]
    fn higher_half_base_is_the_direct_map() {
        // The two constants agree: a higher-half kernel reads loader-placed
        // data through the direct map.
        assert_eq!(HIGHER_HALF_BASE, DIRECT_MAP_BASE);
    }
}
