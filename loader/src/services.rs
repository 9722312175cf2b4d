//! Interfaces the firmware backends implement.
//!
//! All methods take `&self`; the single-threaded backends keep whatever
//! internal state they need behind their own interior mutability, the same
//! contract UEFI boot services expose.

use shared::addr::PhysAddr;
use shared::protocol::{Framebuffer, MemoryMapEntry};

/// Opaque token describing one state of the firmware memory map. Every
/// allocation or free advances it, invalidating prior snapshots.
pub type MapKey = usize;

/// Rewrites one native memory-map entry into its boot-protocol form while it
/// is being copied out.
pub type EntryConvert = fn(&mut MemoryMapEntry);

pub trait MemoryServices {
    /// Allocates `count` pages below `upper_limit`, top-down, tagged `kind`.
    fn allocate_pages(&self, count: u64, upper_limit: u64, kind: u32) -> Option<PhysAddr>;

    /// Allocates `count` pages at exactly `address`, tagged `kind`.
    fn allocate_pages_at(&self, address: PhysAddr, count: u64, kind: u32) -> Option<PhysAddr>;

    fn free_pages(&self, address: PhysAddr, count: u64);

    /// Copies the current memory map into `dst`, `stride` bytes per entry,
    /// running each entry through `convert` first. Returns the total entry
    /// count. With `capacity` 0 this is a pure probe: nothing is written.
    /// `out_key` receives the current map key only when every entry fit.
    fn copy_map(
        &self,
        dst: *mut u8,
        capacity: usize,
        stride: usize,
        convert: Option<EntryConvert>,
        out_key: &mut MapKey,
    ) -> usize;

    /// Seals the memory map and releases firmware ownership of the machine.
    /// Fails if `key` does not describe the current map state.
    fn handover(&self, key: MapKey) -> bool;

    /// Where a physical address is visible in the loader's own address
    /// space. Identity on the firmware backends.
    fn phys_to_virt(&self, address: PhysAddr) -> *mut u8;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VideoMode {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

pub trait VideoServices {
    /// Native resolution of the attached display, if the firmware knows it.
    fn query_resolution(&self) -> Option<Resolution>;

    fn modes(&self) -> &[VideoMode];

    /// Applies a mode from [`VideoServices::modes`]. Legacy text output may
    /// stop working after this succeeds.
    fn set_mode(&self, id: u32) -> Option<Framebuffer>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    Bios,
    Uefi,
}

pub trait PlatformServices {
    fn provider(&self) -> Platform;

    /// 16-byte aligned address of the ACPI RSDP structure.
    fn find_rsdp(&self) -> Option<u64>;

    fn cpu_has_long_mode(&self) -> bool {
        cpuid_long_mode()
    }
}

#[cfg(target_arch = "x86_64")]
fn cpuid_long_mode() -> bool {
    let max_extended = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) }.eax;
    if max_extended < 0x8000_0001 {
        return false;
    }

    let features = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    features.edx & (1 << 29) != 0
}

#[cfg(not(target_arch = "x86_64"))]
fn cpuid_long_mode() -> bool {
    false
}

/// The full set of firmware services the load path runs against.
pub struct Services<'a> {
    pub memory: &'a dyn MemoryServices,
    pub video: &'a dyn VideoServices,
    pub platform: &'a dyn PlatformServices,
}
