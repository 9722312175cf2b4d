//! Serializes the boot information blob.
//!
//! The hard part is that the final attribute is a snapshot of the memory
//! map, the snapshot lives inside an allocation, and every allocation moves
//! the map. The builder closes that loop by reserving one slack entry for
//! the split its own allocation causes and retrying with a fresh snapshot if
//! the map fragmented further; `reserved` only ever grows, so the loop
//! terminates.
//!
//! Once the buffer holds a snapshot, any allocation would corrupt it. From
//! the final `copy_map` to `handover` nothing may touch the allocator.

use core::mem::size_of;

use log::info;

use shared::addr::PhysAddr;
use shared::protocol::{
    copy_name, normalize_map_entry, AttributeHeader, Framebuffer, FramebufferAttribute,
    KernelInfoAttribute, MemoryMapEntry, ModuleInfoAttribute, PlatformInfoAttribute,
    ATTRIBUTE_COMMAND_LINE, ATTRIBUTE_FRAMEBUFFER_INFO, ATTRIBUTE_KERNEL_INFO,
    ATTRIBUTE_MEMORY_MAP, ATTRIBUTE_PLATFORM_INFO, LOADER_MAJOR, LOADER_MINOR, LOADER_NAME,
    LOADER_NAME_SIZE, PREAMBLE_SIZE,
};

use crate::allocator::{allocate_critical_bytes, free_bytes};
use crate::binary::BinaryInfo;
use crate::fs::FsEntry;
use crate::services::{MapKey, MemoryServices};

/// Where the kernel binary came from, as reported to the kernel.
#[derive(Clone, Copy)]
pub struct KernelLocation<'a> {
    pub partition_type: u32,
    pub partition_index: u32,
    pub disk_guid: [u8; 16],
    pub partition_guid: [u8; 16],
    pub path: &'a str,
}

impl<'a> KernelLocation<'a> {
    pub fn new(entry: &FsEntry<'_>, path: &'a str) -> Self {
        KernelLocation {
            partition_type: entry.partition.as_wire(),
            partition_index: entry.partition_index,
            disk_guid: entry.disk_guid.map(|g| g.to_bytes()).unwrap_or([0; 16]),
            partition_guid: entry.partition_guid.map(|g| g.to_bytes()).unwrap_or([0; 16]),
            path,
        }
    }
}

/// Construction plan for the attribute array.
pub struct AttributeArraySpec<'a> {
    pub kernel: &'a BinaryInfo,
    pub location: KernelLocation<'a>,
    pub framebuffer: Option<Framebuffer>,
    pub cmdline: Option<&'a str>,
    pub modules_base: PhysAddr,
    pub module_count: usize,
    pub acpi_rsdp_address: u64,
}

pub struct HandoverInfo {
    pub attribute_array_address: u64,
    pub memory_map_handover_key: MapKey,
}

const MM_ENTRY_SIZE: usize = size_of::<MemoryMapEntry>();

struct Writer {
    base: *mut u8,
    offset: usize,
}

impl Writer {
    fn write<T: Copy>(&mut self, value: T) {
        // Every attribute starts 8-byte aligned.
        debug_assert!(self.offset % 8 == 0);
        unsafe {
            (self.base.add(self.offset) as *mut T).write_unaligned(value);
        }
        self.offset += size_of::<T>();
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.offset), bytes.len());
        }
        self.offset += bytes.len();
    }
}

/// Lays the attribute array out in physical memory and snapshots the memory
/// map into it. The returned key seals the snapshot; it must go straight to
/// `handover`.
pub fn build_attribute_array(
    spec: &AttributeArraySpec<'_>,
    platform_type: u32,
    ms: &dyn MemoryServices,
) -> HandoverInfo {
    // The command-line record is padded up to the next 8-byte boundary and
    // the pad belongs to the record, so a reader's size-driven walk stays
    // aligned.
    let cmdline_size = match spec.cmdline {
        Some(text) => (size_of::<AttributeHeader>() + text.len() + 1 + 7) & !7,
        None => 0,
    };

    let fixed_bytes = PREAMBLE_SIZE
        + size_of::<PlatformInfoAttribute>()
        + size_of::<KernelInfoAttribute>()
        + spec.module_count * size_of::<ModuleInfoAttribute>()
        + cmdline_size
        + spec
            .framebuffer
            .map(|_| size_of::<FramebufferAttribute>())
            .unwrap_or(0)
        + size_of::<AttributeHeader>();

    let mut key: MapKey = 0;

    let (buffer, reserved, total) = loop {
        let entries_before = ms.copy_map(core::ptr::null_mut(), 0, MM_ENTRY_SIZE, None, &mut key);

        // One slack entry for the split the allocation below performs.
        let reserved = entries_before + 1;
        let total = fixed_bytes + reserved * MM_ENTRY_SIZE;

        let buffer = allocate_critical_bytes(ms, total as u64);

        let entries_after = ms.copy_map(core::ptr::null_mut(), 0, MM_ENTRY_SIZE, None, &mut key);
        if entries_after <= reserved {
            unsafe {
                core::ptr::write_bytes(ms.phys_to_virt(buffer), 0, total);
            }
            break (buffer, reserved, total);
        }

        // The allocation fragmented the map beyond the slack; take a fresh
        // snapshot and try again.
        free_bytes(ms, buffer, total as u64);
    };

    let base = ms.phys_to_virt(buffer);
    let mut writer = Writer {
        base,
        offset: PREAMBLE_SIZE,
    };
    let mut attribute_count: u32 = 2; // platform info + kernel info

    let mut platform = PlatformInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_PLATFORM_INFO,
            size_in_bytes: size_of::<PlatformInfoAttribute>() as u32,
        },
        platform_type,
        loader_major: LOADER_MAJOR,
        loader_minor: LOADER_MINOR,
        acpi_rsdp_address: spec.acpi_rsdp_address,
        loader_name: [0; LOADER_NAME_SIZE],
    };
    copy_name(&mut platform.loader_name, LOADER_NAME);
    writer.write(platform);

    let mut kernel = KernelInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_KERNEL_INFO,
            size_in_bytes: size_of::<KernelInfoAttribute>() as u32,
        },
        physical_base: spec.kernel.physical_base,
        virtual_base: spec.kernel.virtual_base,
        range_length: spec.kernel.physical_extent().length(),
        partition_type: spec.location.partition_type,
        partition_index: spec.location.partition_index,
        disk_guid: spec.location.disk_guid,
        partition_guid: spec.location.partition_guid,
        path_on_disk: [0; shared::protocol::KERNEL_PATH_SIZE],
    };
    if !copy_name(&mut kernel.path_on_disk, spec.location.path) {
        panic!("kernel path \"{}\" is too long", spec.location.path);
    }
    writer.write(kernel);

    if spec.module_count > 0 {
        let bytes = spec.module_count * size_of::<ModuleInfoAttribute>();
        unsafe {
            core::ptr::copy_nonoverlapping(
                ms.phys_to_virt(spec.modules_base),
                base.add(writer.offset),
                bytes,
            );
        }
        writer.offset += bytes;
        attribute_count += spec.module_count as u32;
    }

    if let Some(text) = spec.cmdline {
        let start = writer.offset;
        writer.write(AttributeHeader {
            kind: ATTRIBUTE_COMMAND_LINE,
            size_in_bytes: cmdline_size as u32,
        });
        writer.write_bytes(text.as_bytes());
        // NUL terminator and pad bytes are already zero.
        writer.offset = start + cmdline_size;
        attribute_count += 1;
    }

    if let Some(framebuffer) = spec.framebuffer {
        writer.write(FramebufferAttribute {
            header: AttributeHeader {
                kind: ATTRIBUTE_FRAMEBUFFER_INFO,
                size_in_bytes: size_of::<FramebufferAttribute>() as u32,
            },
            framebuffer,
        });
        attribute_count += 1;
    }

    // The memory-map record is always last. Its header is patched once we
    // know how many entries the final snapshot has.
    let map_header_offset = writer.offset;
    writer.write(AttributeHeader {
        kind: ATTRIBUTE_MEMORY_MAP,
        size_in_bytes: 0,
    });

    let entry_count = ms.copy_map(
        unsafe { base.add(writer.offset) },
        reserved,
        MM_ENTRY_SIZE,
        Some(normalize_map_entry),
        &mut key,
    );
    assert!(entry_count <= reserved, "memory map outgrew its snapshot");
    writer.offset += entry_count * MM_ENTRY_SIZE;
    attribute_count += 1;

    let map_size = (size_of::<AttributeHeader>() + entry_count * MM_ENTRY_SIZE) as u32;
    unsafe {
        (base.add(map_header_offset) as *mut AttributeHeader).write_unaligned(AttributeHeader {
            kind: ATTRIBUTE_MEMORY_MAP,
            size_in_bytes: map_size,
        });

        // Preamble: reserved word stays zero, count at +4.
        (base.add(4) as *mut u32).write_unaligned(attribute_count);
    }

    debug_assert!(writer.offset <= total);
    info!(
        "attribute array at {buffer:?}: {attribute_count} attributes, {} map entries",
        entry_count
    );

    HandoverInfo {
        attribute_array_address: buffer.as_u64(),
        memory_map_handover_key: key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Bitness;
    use crate::testutil::{read_attributes, read_struct, MockMemory};
    use shared::addr::PhysAddr;
    use shared::protocol::{MEMORY_LOADER_RECLAIMABLE, MEMORY_NVS, MEMORY_RESERVED, PLATFORM_BIOS};

    fn kernel_info() -> BinaryInfo {
        BinaryInfo {
            bitness: Bitness::Bits64,
            entrypoint: crate::KERNEL_IMAGE_BASE + 0x100000,
            virtual_base: crate::KERNEL_IMAGE_BASE + 0x100000,
            virtual_ceiling: crate::KERNEL_IMAGE_BASE + 0x102000,
            physical_base: 0x100000,
            physical_ceiling: 0x102000,
            kernel_range_is_direct_map: true,
        }
    }

    fn location() -> KernelLocation<'static> {
        KernelLocation {
            partition_type: shared::protocol::PARTITION_TYPE_RAW,
            partition_index: 0,
            disk_guid: [0; 16],
            partition_guid: [0; 16],
            path: "/boot/kernel.elf",
        }
    }

    fn minimal_spec(info: &BinaryInfo) -> AttributeArraySpec<'_> {
        AttributeArraySpec {
            kernel: info,
            location: location(),
            framebuffer: None,
            cmdline: None,
            modules_base: PhysAddr::zero(),
            module_count: 0,
            acpi_rsdp_address: 0xE0000,
        }
    }

    #[test]
    fn minimal_array_layout() {
        let ms = MockMemory::new(8 * 1024 * 1024);
        let info = kernel_info();

        let handover = build_attribute_array(&minimal_spec(&info), PLATFORM_BIOS, &ms);
        let attrs = read_attributes(&ms, handover.attribute_array_address);

        // Three attributes in the fixed order, the map last.
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].kind, ATTRIBUTE_PLATFORM_INFO);
        assert_eq!(attrs[1].kind, ATTRIBUTE_KERNEL_INFO);
        assert_eq!(attrs[2].kind, ATTRIBUTE_MEMORY_MAP);

        // Every attribute sits on an 8-byte boundary (offsets are relative
        // to the buffer).
        for attr in &attrs {
            assert_eq!(attr.offset % 8, 0);
        }

        let platform: PlatformInfoAttribute =
            read_struct(&ms, handover.attribute_array_address + attrs[0].offset as u64);
        assert_eq!(platform.platform_type, PLATFORM_BIOS);
        assert_eq!(platform.acpi_rsdp_address, 0xE0000);
        assert_eq!(&platform.loader_name[..16], LOADER_NAME.as_bytes());
        assert_eq!(platform.loader_name[16], 0);

        let kernel: KernelInfoAttribute =
            read_struct(&ms, handover.attribute_array_address + attrs[1].offset as u64);
        assert_eq!(kernel.physical_base, 0x100000);
        assert_eq!(kernel.range_length, 0x2000);
        assert_eq!(&kernel.path_on_disk[..17], b"/boot/kernel.elf\0");

        // Size accounting: preamble plus attribute sizes equals the emitted
        // bytes, and the count in the preamble matches.
        let last = attrs.last().unwrap();
        let emitted: u32 = PREAMBLE_SIZE as u32 + attrs.iter().map(|a| a.size).sum::<u32>();
        assert_eq!(emitted, last.offset + last.size);
        let count: u32 = read_struct(&ms, handover.attribute_array_address + 4);
        assert_eq!(count, 3);
    }

    #[test]
    fn memory_map_covers_its_own_buffer() {
        let ms = MockMemory::new(8 * 1024 * 1024);
        let info = kernel_info();

        let handover = build_attribute_array(&minimal_spec(&info), PLATFORM_BIOS, &ms);
        let attrs = read_attributes(&ms, handover.attribute_array_address);
        let map = attrs.last().unwrap();

        let entry_count = (map.size as usize - size_of::<AttributeHeader>()) / MM_ENTRY_SIZE;
        let entries_base = handover.attribute_array_address + map.offset as u64 + 8;
        let mut covered = false;

        for i in 0..entry_count {
            let entry: MemoryMapEntry = read_struct(&ms, entries_base + (i * MM_ENTRY_SIZE) as u64);
            if entry.kind == MEMORY_LOADER_RECLAIMABLE
                && entry.physical_address <= handover.attribute_array_address
                && handover.attribute_array_address + (map.offset + map.size) as u64
                    <= entry.physical_address + entry.size_in_bytes
            {
                covered = true;
            }
        }

        assert!(covered, "no loader-reclaimable entry covers the buffer");

        // The snapshot is current: handover accepts the key.
        assert!(ms.handover(handover.memory_map_handover_key));
    }

    #[test]
    fn command_line_is_padded_and_terminated() {
        let ms = MockMemory::new(8 * 1024 * 1024);
        let info = kernel_info();
        let mut spec = minimal_spec(&info);
        spec.cmdline = Some("root=/dev/sda1 ro");
        spec.framebuffer = Some(Framebuffer {
            physical_address: 0xE000_0000,
            width: 800,
            height: 600,
            pitch: 3200,
            bpp: 32,
            format: shared::protocol::FORMAT_RGBA,
            reserved: 0,
        });

        let handover = build_attribute_array(&spec, PLATFORM_BIOS, &ms);
        let attrs = read_attributes(&ms, handover.attribute_array_address);

        assert_eq!(attrs.len(), 5);
        assert_eq!(attrs[2].kind, ATTRIBUTE_COMMAND_LINE);
        assert_eq!(attrs[3].kind, ATTRIBUTE_FRAMEBUFFER_INFO);
        assert_eq!(attrs[4].kind, ATTRIBUTE_MEMORY_MAP);

        // 8 (header) + 17 (text) + 1 (NUL) rounds up to 32; the pad belongs
        // to the record so the walk stays aligned.
        assert_eq!(attrs[2].size, 32);
        let text_base = handover.attribute_array_address + attrs[2].offset as u64 + 8;
        let mut text = [0u8; 24];
        for (i, b) in text.iter_mut().enumerate() {
            *b = read_struct(&ms, text_base + i as u64);
        }
        assert_eq!(&text[..18], b"root=/dev/sda1 ro\0");
        assert!(text[18..].iter().all(|b| *b == 0));

        let fb: FramebufferAttribute =
            read_struct(&ms, handover.attribute_array_address + attrs[3].offset as u64);
        assert_eq!(fb.framebuffer.width, 800);
        assert_eq!(fb.framebuffer.physical_address, 0xE000_0000);
    }

    #[test]
    fn foreign_map_types_are_normalized() {
        let ms = MockMemory::with_map(
            8 * 1024 * 1024,
            vec![(0x9FC00, 0x400, 0x7F), (0xF0000, 0x10000, MEMORY_NVS)],
        );

        let info = kernel_info();
        let handover = build_attribute_array(&minimal_spec(&info), PLATFORM_BIOS, &ms);
        let attrs = read_attributes(&ms, handover.attribute_array_address);
        let map = attrs.last().unwrap();

        let entry_count = (map.size as usize - 8) / MM_ENTRY_SIZE;
        let entries_base = handover.attribute_array_address + map.offset as u64 + 8;

        let mut seen_normalized = false;
        for i in 0..entry_count {
            let entry: MemoryMapEntry = read_struct(&ms, entries_base + (i * MM_ENTRY_SIZE) as u64);
            if entry.physical_address == 0x9FC00 {
                assert_eq!(entry.kind, MEMORY_RESERVED);
                seen_normalized = true;
            }
            if entry.physical_address == 0xF0000 {
                assert_eq!(entry.kind, MEMORY_NVS);
            }
        }
        assert!(seen_normalized);
    }

    /// Delegates to the inner mock but fragments the free list on the first
    /// allocation, the way a firmware allocator growing its own bookkeeping
    /// would.
    struct FragmentingMemory {
        inner: MockMemory,
        fragmented: std::cell::Cell<bool>,
    }

    impl crate::services::MemoryServices for FragmentingMemory {
        fn allocate_pages(&self, count: u64, upper_limit: u64, kind: u32) -> Option<PhysAddr> {
            let result = self.inner.allocate_pages(count, upper_limit, kind)?;
            if !self.fragmented.replace(true) {
                // A hidden allocation far away from the first: two extra map
                // entries instead of the one the slack absorbs.
                self.inner
                    .allocate_pages_at(PhysAddr::new(0x100000), 1, MEMORY_RESERVED);
            }
            Some(result)
        }

        fn allocate_pages_at(&self, address: PhysAddr, count: u64, kind: u32) -> Option<PhysAddr> {
            self.inner.allocate_pages_at(address, count, kind)
        }

        fn free_pages(&self, address: PhysAddr, count: u64) {
            self.inner.free_pages(address, count)
        }

        fn copy_map(
            &self,
            dst: *mut u8,
            capacity: usize,
            stride: usize,
            convert: Option<crate::services::EntryConvert>,
            out_key: &mut MapKey,
        ) -> usize {
            self.inner.copy_map(dst, capacity, stride, convert, out_key)
        }

        fn handover(&self, key: MapKey) -> bool {
            self.inner.handover(key)
        }

        fn phys_to_virt(&self, address: PhysAddr) -> *mut u8 {
            self.inner.phys_to_virt(address)
        }
    }

    #[test]
    fn fixed_point_retries_until_snapshot_fits() {
        let ms = FragmentingMemory {
            inner: MockMemory::new(8 * 1024 * 1024),
            fragmented: std::cell::Cell::new(false),
        };
        let info = kernel_info();

        let handover = build_attribute_array(&minimal_spec(&info), PLATFORM_BIOS, &ms);

        // The loop converged and the embedded snapshot is the current map.
        assert!(ms.inner.handover(handover.memory_map_handover_key));

        let attrs = read_attributes(&ms.inner, handover.attribute_array_address);
        assert_eq!(attrs.last().unwrap().kind, ATTRIBUTE_MEMORY_MAP);
    }

    #[test]
    #[should_panic(expected = "too long")]
    fn oversized_kernel_path_is_fatal() {
        let ms = MockMemory::new(8 * 1024 * 1024);
        let info = kernel_info();
        let long_path = "a".repeat(400);
        let mut spec = minimal_spec(&info);
        spec.location.path = &long_path;

        build_attribute_array(&spec, PLATFORM_BIOS, &ms);
    }
}
