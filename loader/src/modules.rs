//! Loads configured modules into page-aligned physical memory.
//!
//! Module records are accumulated directly in physical pages so the
//! attribute-array builder can copy them out in one go. The array grows one
//! page at a time.

use core::fmt::Write;
use core::mem::size_of;

use arrayvec::ArrayString;
use log::info;

use shared::addr::{page_count, PhysAddr, PAGE_SIZE};
use shared::protocol::{
    copy_name, AttributeHeader, ModuleInfoAttribute, ATTRIBUTE_MODULE_INFO, MEMORY_MODULE,
    MODULE_NAME_SIZE,
};

use crate::allocator::{allocate_critical_pages, allocate_critical_pages_with_kind, free_pages};
use crate::config::{Config, Value, ValueRef};
use crate::fs::{parse_path, FsTable};
use crate::services::MemoryServices;

pub const MODULES_PER_PAGE: usize = PAGE_SIZE as usize / size_of::<ModuleInfoAttribute>();

/// Module records stored in loader-reclaimable physical pages.
pub struct ModuleArray<'a> {
    ms: &'a dyn MemoryServices,
    base: PhysAddr,
    count: usize,
    pages: u64,
}

impl<'a> ModuleArray<'a> {
    pub fn new(ms: &'a dyn MemoryServices) -> Self {
        ModuleArray {
            ms,
            base: allocate_critical_pages(ms, 1),
            count: 0,
            pages: 1,
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn used_bytes(&self) -> usize {
        self.count * size_of::<ModuleInfoAttribute>()
    }

    pub fn push(&mut self, record: ModuleInfoAttribute) {
        if self.count == self.pages as usize * MODULES_PER_PAGE {
            self.grow();
        }

        unsafe {
            let slot = (self.ms.phys_to_virt(self.base) as *mut ModuleInfoAttribute)
                .add(self.count);
            slot.write(record);
        }
        self.count += 1;
    }

    fn grow(&mut self) {
        let new_pages = self.pages + 1;
        let new_base = allocate_critical_pages(self.ms, new_pages);

        unsafe {
            core::ptr::copy_nonoverlapping(
                self.ms.phys_to_virt(self.base),
                self.ms.phys_to_virt(new_base),
                self.used_bytes(),
            );
        }

        free_pages(self.ms, self.base, self.pages);
        self.base = new_base;
        self.pages = new_pages;
    }
}

/// Loads one `module` entry: either a bare path string or an object with a
/// mandatory `path` and an optional `name`. Unnamed modules are numbered in
/// configuration order.
pub fn load_module(
    cfg: &Config<'_>,
    value: &ValueRef<'_>,
    fs_table: &FsTable<'_>,
    ms: &dyn MemoryServices,
    unnamed_count: &mut u32,
) -> ModuleInfoAttribute {
    let (name, path_text) = match value.value {
        Value::Str(path) => (None, path),
        Value::Object(scope) => (
            cfg.get_string(scope, "name"),
            cfg.mandatory_string(scope, "path"),
        ),
        _ => unreachable!(),
    };

    let mut name_buf = [0u8; MODULE_NAME_SIZE];
    match name {
        Some(name) => {
            if !copy_name(&mut name_buf, name) {
                panic!("module name \"{name}\" is too long");
            }
        }
        None => {
            *unnamed_count += 1;
            let mut synthesized = ArrayString::<MODULE_NAME_SIZE>::new();
            write!(&mut synthesized, "unnamed_module{unnamed_count}").unwrap();
            copy_name(&mut name_buf, &synthesized);
        }
    }

    let path =
        parse_path(path_text).unwrap_or_else(|| panic!("invalid module path \"{path_text}\""));
    let entry = fs_table
        .by_full_path(&path)
        .unwrap_or_else(|| panic!("invalid module path \"{path_text}\""));

    let file = entry
        .fs
        .open(path.path_within_partition)
        .unwrap_or_else(|| panic!("invalid module path \"{path_text}\""));
    let size = entry.fs.size(file);

    let pages = page_count(size).max(1);
    let data = allocate_critical_pages_with_kind(ms, pages, MEMORY_MODULE);

    let buf = unsafe { core::slice::from_raw_parts_mut(ms.phys_to_virt(data), size as usize) };
    if !entry.fs.read(file, buf, 0) {
        panic!("failed to read module file \"{path_text}\"");
    }
    entry.fs.close(file);

    info!("loaded module \"{path_text}\" at {data:?} ({size} bytes)");

    ModuleInfoAttribute {
        header: AttributeHeader {
            kind: ATTRIBUTE_MODULE_INFO,
            size_in_bytes: size_of::<ModuleInfoAttribute>() as u32,
        },
        name: name_buf,
        physical_address: data.as_u64(),
        length: size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeMask;
    use crate::fs::{FsEntry, PartitionKind};
    use crate::testutil::{entry_config, MemFs, MockMemory, TVal};
    use shared::protocol::MEMORY_FREE;

    fn table(fs: &MemFs) -> FsTable<'_> {
        let mut table = FsTable::new();
        table.add(FsEntry {
            disk_index: 0,
            disk_guid: None,
            partition: PartitionKind::Raw,
            partition_index: 0,
            partition_guid: None,
            fs,
        });
        table.set_origin(0);
        table
    }

    fn name_str(record: &ModuleInfoAttribute) -> &str {
        let len = record.name.iter().position(|b| *b == 0).unwrap();
        core::str::from_utf8(&record.name[..len]).unwrap()
    }

    #[test]
    fn named_and_unnamed_modules() {
        let ms = MockMemory::new(8 * 1024 * 1024);
        let fs = MemFs::new(vec![
            ("/m1.bin", vec![0x11; 100]),
            ("/fs.img", vec![0x22; 5000]),
        ]);
        let table = table(&fs);

        let owned = entry_config(vec![
            ("module", TVal::S("hd0:/m1.bin")),
            (
                "module",
                TVal::Obj(vec![("name", TVal::S("fs")), ("path", TVal::S("hd0:/fs.img"))]),
            ),
        ]);
        let cfg = owned.config();
        let scope = cfg.first_loadable_entry().unwrap().scope;

        let mask = TypeMask::STRING | TypeMask::OBJECT;
        let mut unnamed = 0;

        let first = cfg.get_first(scope, "module", mask).unwrap();
        let record1 = load_module(&cfg, &first, &table, &ms, &mut unnamed);
        assert_eq!(name_str(&record1), "unnamed_module1");
        assert_eq!(record1.length, 100);
        assert_eq!(record1.physical_address % PAGE_SIZE, 0);

        let second = cfg.next_matching(&first, mask).unwrap();
        let record2 = load_module(&cfg, &second, &table, &ms, &mut unnamed);
        assert_eq!(name_str(&record2), "fs");
        assert_eq!(record2.length, 5000);
        assert_eq!(record2.physical_address % PAGE_SIZE, 0);

        // 5000 bytes round up to two pages of MODULE-typed memory.
        assert!(ms
            .ranges()
            .iter()
            .any(|r| r.0 == record2.physical_address
                && r.1 == 2 * PAGE_SIZE
                && r.2 == MEMORY_MODULE));

        // Contents made it into place.
        let data = unsafe {
            core::slice::from_raw_parts(
                ms.phys_to_virt(PhysAddr::new(record1.physical_address)),
                100,
            )
        };
        assert!(data.iter().all(|b| *b == 0x11));
    }

    #[test]
    fn array_growth_copies_records() {
        let ms = MockMemory::new(16 * 1024 * 1024);
        let mut array = ModuleArray::new(&ms);

        let record = |i: u32| ModuleInfoAttribute {
            header: AttributeHeader {
                kind: ATTRIBUTE_MODULE_INFO,
                size_in_bytes: size_of::<ModuleInfoAttribute>() as u32,
            },
            name: [0; MODULE_NAME_SIZE],
            physical_address: 0x1000 * i as u64,
            length: i as u64,
        };

        let first_base = array.base();

        // One page holds MODULES_PER_PAGE records; pushing one more forces a
        // grow that must carry every stored record over.
        for i in 0..(MODULES_PER_PAGE as u32 + 3) {
            array.push(record(i));
        }

        assert_eq!(array.count(), MODULES_PER_PAGE + 3);
        assert_ne!(array.base(), first_base);

        let records = unsafe {
            core::slice::from_raw_parts(
                ms.phys_to_virt(array.base()) as *const ModuleInfoAttribute,
                array.count(),
            )
        };
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.physical_address, 0x1000 * i as u64);
            assert_eq!(record.length, i as u64);
        }

        // The original page was handed back.
        let first = first_base.as_u64();
        assert!(ms
            .ranges()
            .iter()
            .any(|r| r.2 == MEMORY_FREE && r.0 <= first && first < r.0 + r.1));
    }

    #[test]
    #[should_panic(expected = "invalid module path")]
    fn unknown_filesystem_is_fatal() {
        let ms = MockMemory::new(1024 * 1024);
        let fs = MemFs::new(vec![]);
        let table = table(&fs);

        let owned = entry_config(vec![("module", TVal::S("hd9:/missing.bin"))]);
        let cfg = owned.config();
        let scope = cfg.first_loadable_entry().unwrap().scope;

        let value = cfg
            .get_first(scope, "module", TypeMask::STRING | TypeMask::OBJECT)
            .unwrap();
        let mut unnamed = 0;
        load_module(&cfg, &value, &table, &ms, &mut unnamed);
    }
}
