//! Loads the kernel executable into physical memory.
//!
//! `xmas_elf` does the parsing; this module walks the load segments,
//! enforces the bitness and placement rules, and drives the allocator.

use log::info;
use xmas_elf::header::{Class, Machine, Type as ObjectType};
use xmas_elf::program::Type as SegmentType;
use xmas_elf::ElfFile;

use shared::addr::{align_down, align_up, PhysAddr, PhysExtent, PAGE_SIZE};
use shared::protocol::MEMORY_KERNEL_BINARY;

use crate::allocator::{
    allocate_critical_pages_at, allocate_critical_pages_with_kind, ScopedPages, ALLOCATION_CEILING,
};
use crate::config::{Config, LoadableEntry, TypeMask, Value};
use crate::fs::{parse_path, FileSystem, FullPath};
use crate::services::Services;
use crate::KERNEL_IMAGE_BASE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bitness {
    Bits32,
    Bits64,
}

pub struct BinaryOptions<'a> {
    pub path: FullPath<'a>,
    pub allocate_anywhere: bool,
}

/// Reads the `binary` key: either a bare path string or an object with
/// `path` and an optional `allocate-anywhere` flag.
pub fn binary_options_from_config<'a>(
    cfg: &Config<'a>,
    entry: &LoadableEntry<'a>,
) -> BinaryOptions<'a> {
    let value = cfg.get_mandatory(entry.scope, "binary", TypeMask::STRING | TypeMask::OBJECT);

    let (path_text, allocate_anywhere) = match value.value {
        Value::Str(path) => (path, false),
        Value::Object(scope) => {
            let path = cfg.mandatory_string(scope, "path");
            let anywhere = cfg.get_bool(scope, "allocate-anywhere").unwrap_or(false);
            (path, anywhere)
        }
        _ => unreachable!(),
    };

    let path =
        parse_path(path_text).unwrap_or_else(|| panic!("invalid binary path \"{path_text}\""));

    BinaryOptions {
        path,
        allocate_anywhere,
    }
}

/// What the kernel image looks like once it is in memory.
#[derive(Clone, Copy, Debug)]
pub struct BinaryInfo {
    pub bitness: Bitness,
    pub entrypoint: u64,
    pub virtual_base: u64,
    pub virtual_ceiling: u64,
    pub physical_base: u64,
    pub physical_ceiling: u64,
    /// The virtual range coincides with the loader's direct map; the
    /// address-space builder needs no extra mapping for it.
    pub kernel_range_is_direct_map: bool,
}

impl BinaryInfo {
    /// Physical memory the image occupies. Non-empty by construction.
    pub fn physical_extent(&self) -> PhysExtent {
        PhysExtent::from_raw(
            self.physical_base,
            self.physical_ceiling - self.physical_base,
        )
    }
}

/// Opens, reads and loads the kernel binary. The raw file bytes live in a
/// scoped allocation released once the segments are placed.
pub fn load_kernel(
    fs: &dyn FileSystem,
    path: &str,
    allocate_anywhere: bool,
    sv: &Services<'_>,
) -> BinaryInfo {
    let file = fs
        .open(path)
        .unwrap_or_else(|| panic!("failed to open \"{path}\""));
    let size = fs.size(file);

    let mut file_pages = ScopedPages::allocate_critical_bytes(sv.memory, size);
    if !fs.read(file, &mut file_pages.bytes_mut()[..size as usize], 0) {
        panic!("failed to read \"{path}\"");
    }
    fs.close(file);

    let info = load_image(&file_pages.bytes()[..size as usize], allocate_anywhere, sv);
    info!(
        "loaded {} bit kernel at {:#x}..{:#x}",
        match info.bitness {
            Bitness::Bits32 => 32,
            Bitness::Bits64 => 64,
        },
        info.physical_base,
        info.physical_ceiling
    );
    info
}

struct LoadSegment {
    vaddr: u64,
    paddr: u64,
    offset: u64,
    file_size: u64,
    mem_size: u64,
}

fn load_image(data: &[u8], allocate_anywhere: bool, sv: &Services<'_>) -> BinaryInfo {
    let elf = ElfFile::new(data).unwrap_or_else(|err| panic!("malformed kernel binary: {err}"));

    let bitness = match elf.header.pt1.class() {
        Class::ThirtyTwo => Bitness::Bits32,
        Class::SixtyFour => Bitness::Bits64,
        _ => panic!("invalid ELF class"),
    };

    if allocate_anywhere && bitness != Bitness::Bits64 {
        panic!("allocate-anywhere is only allowed for 64 bit kernels");
    }
    if bitness == Bitness::Bits64 && !sv.platform.cpu_has_long_mode() {
        panic!("attempted to load a 64 bit kernel on a CPU without long mode support");
    }

    let expected_machine = match bitness {
        Bitness::Bits32 => Machine::X86,
        Bitness::Bits64 => Machine::X86_64,
    };
    if elf.header.pt2.machine().as_machine() != expected_machine {
        panic!("unexpected machine type");
    }
    if elf.header.pt2.type_().as_type() != ObjectType::Executable {
        panic!("kernel binary is not an executable");
    }

    // 64-bit kernels are placed by virtual address (translated out of the
    // -2 GiB window); 32-bit kernels load at their physical addresses.
    let use_va = bitness == Bitness::Bits64;

    let mut entrypoint = elf.header.pt2.entry_point();
    let mut virtual_base = u64::MAX;
    let mut virtual_ceiling = 0u64;
    let mut segments: arrayvec::ArrayVec<LoadSegment, 16> = arrayvec::ArrayVec::new();

    for header in elf.program_iter() {
        if header.get_type() != Ok(SegmentType::Load) {
            continue;
        }

        let segment = LoadSegment {
            vaddr: header.virtual_addr(),
            paddr: header.physical_addr(),
            offset: header.offset(),
            file_size: header.file_size(),
            mem_size: header.mem_size(),
        };

        if allocate_anywhere && segment.vaddr < KERNEL_IMAGE_BASE {
            panic!("invalid load address");
        }

        let file_end = segment.offset.checked_add(segment.file_size);
        match file_end {
            Some(end) if end <= data.len() as u64 && segment.file_size <= segment.mem_size => {}
            _ => panic!("invalid program header"),
        }

        let virt_end = segment
            .vaddr
            .checked_add(segment.mem_size)
            .unwrap_or_else(|| panic!("invalid load address"));

        virtual_base = virtual_base.min(segment.vaddr);
        virtual_ceiling = virtual_ceiling.max(virt_end);

        // 32-bit entrypoints move with their segment into the physical
        // range.
        if !use_va && entrypoint >= segment.vaddr && entrypoint < virt_end {
            entrypoint = entrypoint - segment.vaddr + segment.paddr;
        }

        if segments.try_push(segment).is_err() {
            panic!("too many load segments");
        }
    }

    if segments.is_empty() {
        panic!("kernel binary has no load segments");
    }

    virtual_base = align_down(virtual_base, PAGE_SIZE);
    virtual_ceiling = align_up(virtual_ceiling, PAGE_SIZE);

    // Placement target of a segment in physical memory.
    let translate = |segment: &LoadSegment| -> u64 {
        let addr = if use_va { segment.vaddr } else { segment.paddr };
        if addr < KERNEL_IMAGE_BASE {
            return addr;
        }
        if !use_va {
            panic!("invalid load address");
        }

        let translated = addr - KERNEL_IMAGE_BASE;
        if translated < 1024 * 1024 && !allocate_anywhere {
            panic!("invalid load address");
        }
        translated
    };

    let mut physical_base = u64::MAX;
    let mut physical_ceiling = 0u64;

    if allocate_anywhere {
        let pages = (virtual_ceiling - virtual_base) / PAGE_SIZE;
        physical_base =
            allocate_critical_pages_with_kind(sv.memory, pages, MEMORY_KERNEL_BINARY).as_u64();
        physical_ceiling = physical_base + pages * PAGE_SIZE;
    }

    // Entrypoint must land inside the image.
    let (reference_base, reference_ceiling) = if use_va {
        (virtual_base, virtual_ceiling)
    } else {
        let base = segments.iter().map(|s| translate(s)).min().unwrap();
        let ceiling = segments
            .iter()
            .map(|s| translate(s) + s.mem_size)
            .max()
            .unwrap();
        (align_down(base, PAGE_SIZE), align_up(ceiling, PAGE_SIZE))
    };
    if entrypoint < reference_base || entrypoint >= reference_ceiling {
        panic!("invalid entrypoint {entrypoint:#x}");
    }

    for segment in &segments {
        let load_base = if allocate_anywhere {
            physical_base + (segment.vaddr - virtual_base)
        } else {
            let target = translate(segment);
            let begin = align_down(target, PAGE_SIZE);
            let end = align_up(target + segment.mem_size, PAGE_SIZE);
            if end > ALLOCATION_CEILING {
                panic!("invalid load address");
            }

            allocate_critical_pages_at(
                sv.memory,
                PhysAddr::new(begin),
                (end - begin) / PAGE_SIZE,
                MEMORY_KERNEL_BINARY,
            );

            physical_base = physical_base.min(begin);
            physical_ceiling = physical_ceiling.max(end);
            target
        };

        unsafe {
            let dst = sv.memory.phys_to_virt(PhysAddr::new(load_base));
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(segment.offset as usize),
                dst,
                segment.file_size as usize,
            );
            core::ptr::write_bytes(
                dst.add(segment.file_size as usize),
                0,
                (segment.mem_size - segment.file_size) as usize,
            );
        }
    }

    BinaryInfo {
        bitness,
        entrypoint,
        virtual_base,
        virtual_ceiling,
        physical_base,
        physical_ceiling,
        kernel_range_is_direct_map: !allocate_anywhere,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryServices;
    use crate::testutil::{build_elf32, build_elf64, MemFs, MockMemory, MockPlatform, MockVideo};
    use crate::KERNEL_IMAGE_BASE;

    fn services<'a>(
        ms: &'a MockMemory,
        vs: &'a MockVideo,
        ps: &'a MockPlatform,
    ) -> Services<'a> {
        Services {
            memory: ms,
            video: vs,
            platform: ps,
        }
    }

    fn load_from_bytes(image: Vec<u8>, allocate_anywhere: bool, ms: &MockMemory) -> BinaryInfo {
        let vs = MockVideo::default();
        let ps = MockPlatform::default();
        let fs = MemFs::new(vec![("/boot/kernel.elf", image)]);
        load_kernel(
            &fs,
            "/boot/kernel.elf",
            allocate_anywhere,
            &services(ms, &vs, &ps),
        )
    }

    #[test]
    fn higher_half_fixed_placement() {
        let ms = MockMemory::new(32 * 1024 * 1024);
        let vaddr = KERNEL_IMAGE_BASE + 0x100000;
        let image = build_elf64(vaddr + 0x10, &[(vaddr, b"kernel code".to_vec(), 0x2000)]);

        let info = load_from_bytes(image, false, &ms);

        assert_eq!(info.bitness, Bitness::Bits64);
        assert_eq!(info.entrypoint, vaddr + 0x10);
        assert_eq!(info.virtual_base, vaddr);
        assert_eq!(info.virtual_ceiling, vaddr + 0x2000);
        assert_eq!(info.physical_base, 0x100000);
        assert_eq!(info.physical_ceiling, 0x102000);
        assert!(info.kernel_range_is_direct_map);

        // Segment bytes landed at the translated physical address and the
        // rest of the segment is zeroed.
        let loaded = unsafe {
            core::slice::from_raw_parts(ms.phys_to_virt(PhysAddr::new(0x100000)), 0x2000)
        };
        assert_eq!(&loaded[..11], b"kernel code");
        assert!(loaded[11..].iter().all(|b| *b == 0));

        // And the pages are tagged as kernel binary.
        assert!(ms
            .ranges()
            .iter()
            .any(|r| r.0 == 0x100000 && r.1 == 0x2000 && r.2 == MEMORY_KERNEL_BINARY));
    }

    #[test]
    fn allocate_anywhere_offsets_segments() {
        let ms = MockMemory::new(32 * 1024 * 1024);
        let vaddr = KERNEL_IMAGE_BASE + 0x200000;
        let image = build_elf64(
            vaddr,
            &[
                (vaddr, b"text".to_vec(), 0x1000),
                (vaddr + 0x3000, b"data".to_vec(), 0x1000),
            ],
        );

        let info = load_from_bytes(image, true, &ms);

        assert!(!info.kernel_range_is_direct_map);
        assert_eq!(info.physical_ceiling - info.physical_base, 0x4000);

        let text = unsafe {
            core::slice::from_raw_parts(ms.phys_to_virt(PhysAddr::new(info.physical_base)), 4)
        };
        assert_eq!(text, b"text");
        let data = unsafe {
            core::slice::from_raw_parts(
                ms.phys_to_virt(PhysAddr::new(info.physical_base + 0x3000)),
                4,
            )
        };
        assert_eq!(data, b"data");
    }

    #[test]
    fn bits32_loads_at_physical_address() {
        let ms = MockMemory::new(32 * 1024 * 1024);
        // Linked at a high virtual address but placed at 2 MiB physical.
        let image = build_elf32(0xC010_0010, &[(0xC010_0000, 0x200000, b"k32".to_vec(), 0x1000)]);

        let info = load_from_bytes(image, false, &ms);

        assert_eq!(info.bitness, Bitness::Bits32);
        // Entrypoint relocated into the physical range.
        assert_eq!(info.entrypoint, 0x200010);
        assert_eq!(info.physical_base, 0x200000);
        assert_eq!(info.physical_ceiling, 0x201000);
    }

    #[test]
    fn rejects_allocate_anywhere_for_32_bit() {
        let ms = MockMemory::new(32 * 1024 * 1024);
        let image = build_elf32(0x100000, &[(0x100000, 0x100000, b"k".to_vec(), 0x1000)]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            load_from_bytes(image, true, &ms)
        }));
        assert!(result.is_err());

        // Fatal before any kernel page was allocated.
        assert!(ms.ranges().iter().all(|r| r.2 != MEMORY_KERNEL_BINARY));
    }

    #[test]
    #[should_panic(expected = "long mode")]
    fn rejects_64_bit_without_long_mode() {
        let ms = MockMemory::new(32 * 1024 * 1024);
        let vs = MockVideo::default();
        let ps = MockPlatform {
            long_mode: false,
            ..MockPlatform::default()
        };
        let vaddr = KERNEL_IMAGE_BASE + 0x100000;
        let image = build_elf64(vaddr, &[(vaddr, b"k".to_vec(), 0x1000)]);
        let fs = MemFs::new(vec![("/k", image)]);

        load_kernel(&fs, "/k", false, &services(&ms, &vs, &ps));
    }

    #[test]
    #[should_panic(expected = "failed to open")]
    fn missing_file_is_fatal() {
        let ms = MockMemory::new(1024 * 1024);
        let vs = MockVideo::default();
        let ps = MockPlatform::default();
        let fs = MemFs::new(vec![]);

        load_kernel(&fs, "/nope", false, &services(&ms, &vs, &ps));
    }
}
