//! Mock firmware services and fixture builders shared by the test modules.
//!
//! `MockMemory` is the important one: it backs "physical" memory with a host
//! arena and keeps a real typed range list, so allocation splits, frees,
//! merges and map-key movement behave like the firmware backends the loader
//! runs against.

use core::cell::{Cell, RefCell, UnsafeCell};
use core::mem::size_of;

use shared::addr::{PhysAddr, PhysExtent, PAGE_SIZE};
use shared::protocol::{AttributeHeader, Framebuffer, MemoryMapEntry, FORMAT_RGBA, MEMORY_FREE};

use crate::config::{Config, Entry, EntryKind, Scope, Value};
use crate::fs::{FileId, FileSystem};
use crate::services::{
    EntryConvert, MapKey, MemoryServices, Platform, PlatformServices, Resolution, VideoMode,
    VideoServices,
};

#[derive(Clone, Copy)]
struct Range {
    begin: u64,
    end: u64,
    kind: u32,
}

impl Range {
    fn extent(&self) -> PhysExtent {
        PhysExtent::from_raw(self.begin, self.end - self.begin)
    }
}

struct MemState {
    ranges: Vec<Range>,
    key: MapKey,
    released: bool,
}

pub struct MockMemory {
    // u64 backing keeps the arena 8-byte aligned.
    arena: UnsafeCell<Box<[u64]>>,
    size: u64,
    state: RefCell<MemState>,
}

impl MockMemory {
    pub fn new(size: u64) -> Self {
        Self::with_map(size, vec![])
    }

    /// Arena of `size` bytes, fully free except the listed
    /// `(begin, length, kind)` ranges.
    pub fn with_map(size: u64, typed: Vec<(u64, u64, u32)>) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);

        let mock = MockMemory {
            arena: UnsafeCell::new(vec![0u64; (size / 8) as usize].into_boxed_slice()),
            size,
            state: RefCell::new(MemState {
                ranges: vec![Range {
                    begin: 0,
                    end: size,
                    kind: MEMORY_FREE,
                }],
                key: 0,
                released: false,
            }),
        };

        for (begin, length, kind) in typed {
            let mut state = mock.state.borrow_mut();
            let index = carve(&mut state.ranges, begin, begin + length, kind);
            merge_around(&mut state.ranges, index);
        }

        mock
    }

    pub fn ranges(&self) -> Vec<(u64, u64, u32)> {
        self.state
            .borrow()
            .ranges
            .iter()
            .map(|r| (r.begin, r.end - r.begin, r.kind))
            .collect()
    }

    pub fn key(&self) -> MapKey {
        self.state.borrow().key
    }

    pub fn released(&self) -> bool {
        self.state.borrow().released
    }

    fn check_live(&self, what: &str) {
        assert!(!self.state.borrow().released, "use-after-release: {what}");
    }
}

/// Splits `[begin, end)` out of the single range containing it and retags
/// it. Returns the index of the new middle range.
fn carve(ranges: &mut Vec<Range>, begin: u64, end: u64, kind: u32) -> usize {
    let index = ranges
        .iter()
        .position(|r| r.begin <= begin && end <= r.end)
        .expect("carving outside any range");

    let original = ranges[index];
    let mut insert_at = index;
    ranges.remove(index);

    if original.begin < begin {
        ranges.insert(
            insert_at,
            Range {
                begin: original.begin,
                end: begin,
                kind: original.kind,
            },
        );
        insert_at += 1;
    }

    ranges.insert(insert_at, Range { begin, end, kind });

    if end < original.end {
        ranges.insert(
            insert_at + 1,
            Range {
                begin: end,
                end: original.end,
                kind: original.kind,
            },
        );
    }

    insert_at
}

fn merge_around(ranges: &mut Vec<Range>, index: usize) {
    if index + 1 < ranges.len() && ranges[index].kind == ranges[index + 1].kind {
        ranges[index].end = ranges[index + 1].end;
        ranges.remove(index + 1);
    }

    if index > 0 && ranges[index - 1].kind == ranges[index].kind {
        ranges[index - 1].end = ranges[index].end;
        ranges.remove(index);
    }
}

impl MemoryServices for MockMemory {
    fn allocate_pages(&self, count: u64, upper_limit: u64, kind: u32) -> Option<PhysAddr> {
        self.check_live("allocate_pages");
        assert!(count > 0, "invalid allocation of zero pages");
        let bytes = count * PAGE_SIZE;

        let mut state = self.state.borrow_mut();

        let mut found = None;
        for (index, range) in state.ranges.iter().enumerate().rev() {
            if range.kind != MEMORY_FREE || range.begin >= upper_limit {
                continue;
            }

            let end = range.end.min(upper_limit) & !(PAGE_SIZE - 1);
            if end < range.begin || end - range.begin < bytes {
                continue;
            }

            found = Some((index, end));
            break;
        }

        let (_, end) = found?;
        let begin = end - bytes;
        carve(&mut state.ranges, begin, end, kind);
        state.key += 1;
        Some(PhysAddr::new(begin))
    }

    fn allocate_pages_at(&self, address: PhysAddr, count: u64, kind: u32) -> Option<PhysAddr> {
        self.check_live("allocate_pages_at");
        assert!(count > 0, "invalid allocation of zero pages");

        let begin = address.as_u64();
        let end = begin + count * PAGE_SIZE;
        let wanted = PhysExtent::from_raw(begin, count * PAGE_SIZE);

        let mut state = self.state.borrow_mut();
        let fits = state
            .ranges
            .iter()
            .any(|r| r.kind == MEMORY_FREE && r.extent().contains_extent(wanted));
        if !fits {
            return None;
        }

        carve(&mut state.ranges, begin, end, kind);
        state.key += 1;
        Some(address)
    }

    fn free_pages(&self, address: PhysAddr, count: u64) {
        self.check_live("free_pages");

        let begin = address.as_u64();
        let end = begin + count * PAGE_SIZE;
        let freed = PhysExtent::from_raw(begin, count * PAGE_SIZE);

        let mut state = self.state.borrow_mut();
        let valid = state
            .ranges
            .iter()
            .any(|r| r.kind != MEMORY_FREE && r.extent().contains_extent(freed));
        assert!(valid, "invalid free at {begin:#x} of {count} pages");

        let index = carve(&mut state.ranges, begin, end, MEMORY_FREE);
        merge_around(&mut state.ranges, index);
        state.key += 1;
    }

    fn copy_map(
        &self,
        dst: *mut u8,
        capacity: usize,
        stride: usize,
        convert: Option<EntryConvert>,
        out_key: &mut MapKey,
    ) -> usize {
        self.check_live("copy_map");

        let state = self.state.borrow();
        let count = state.ranges.len();
        if capacity == 0 {
            return count;
        }

        assert!(stride >= size_of::<MemoryMapEntry>());

        for (i, range) in state.ranges.iter().take(capacity).enumerate() {
            let mut entry = MemoryMapEntry {
                physical_address: range.begin,
                size_in_bytes: range.end - range.begin,
                kind: range.kind,
                reserved: 0,
            };

            if let Some(convert) = convert {
                convert(&mut entry);
            }

            unsafe {
                (dst.add(i * stride) as *mut MemoryMapEntry).write_unaligned(entry);
            }
        }

        if capacity >= count {
            *out_key = state.key;
        }
        count
    }

    fn handover(&self, key: MapKey) -> bool {
        self.check_live("handover");

        let mut state = self.state.borrow_mut();
        if key != state.key {
            return false;
        }

        state.released = true;
        true
    }

    fn phys_to_virt(&self, address: PhysAddr) -> *mut u8 {
        assert!(address.as_u64() < self.size, "address outside the arena");
        unsafe { ((*self.arena.get()).as_mut_ptr() as *mut u8).add(address.as_u64() as usize) }
    }
}

pub struct MockVideo {
    native: Option<Resolution>,
    modes: Vec<VideoMode>,
    applied: Cell<Option<u32>>,
    framebuffer_address: u64,
}

impl Default for MockVideo {
    fn default() -> Self {
        Self::with_modes(
            Resolution {
                width: 1920,
                height: 1080,
            },
            vec![
                VideoMode {
                    id: 0,
                    width: 1024,
                    height: 768,
                    bpp: 32,
                },
                VideoMode {
                    id: 1,
                    width: 1920,
                    height: 1080,
                    bpp: 32,
                },
            ],
        )
    }
}

impl MockVideo {
    pub fn with_modes(native: Resolution, modes: Vec<VideoMode>) -> Self {
        MockVideo {
            native: Some(native),
            modes,
            applied: Cell::new(None),
            framebuffer_address: 0xE000_0000,
        }
    }

    pub fn applied(&self) -> Option<u32> {
        self.applied.get()
    }

    pub fn framebuffer_address(&self) -> u64 {
        self.framebuffer_address
    }
}

impl VideoServices for MockVideo {
    fn query_resolution(&self) -> Option<Resolution> {
        self.native
    }

    fn modes(&self) -> &[VideoMode] {
        &self.modes
    }

    fn set_mode(&self, id: u32) -> Option<Framebuffer> {
        let mode = self.modes.iter().find(|m| m.id == id)?;
        self.applied.set(Some(id));

        Some(Framebuffer {
            physical_address: self.framebuffer_address,
            width: mode.width,
            height: mode.height,
            pitch: mode.width * (mode.bpp / 8),
            bpp: mode.bpp,
            format: FORMAT_RGBA,
            reserved: 0,
        })
    }
}

pub struct MockPlatform {
    pub platform: Platform,
    pub rsdp: u64,
    pub long_mode: bool,
}

impl Default for MockPlatform {
    fn default() -> Self {
        MockPlatform {
            platform: Platform::Bios,
            rsdp: 0xE0000,
            long_mode: true,
        }
    }
}

impl PlatformServices for MockPlatform {
    fn provider(&self) -> Platform {
        self.platform
    }

    fn find_rsdp(&self) -> Option<u64> {
        (self.rsdp != 0).then_some(self.rsdp)
    }

    fn cpu_has_long_mode(&self) -> bool {
        self.long_mode
    }
}

/// In-memory filesystem keyed by absolute paths.
pub struct MemFs {
    files: Vec<(&'static str, Vec<u8>)>,
}

impl MemFs {
    pub fn new(files: Vec<(&'static str, Vec<u8>)>) -> Self {
        MemFs { files }
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str) -> Option<FileId> {
        self.files
            .iter()
            .position(|(name, _)| *name == path)
            .map(|i| FileId(i as u32))
    }

    fn size(&self, file: FileId) -> u64 {
        self.files[file.0 as usize].1.len() as u64
    }

    fn read(&self, file: FileId, buf: &mut [u8], offset: u64) -> bool {
        let data = &self.files[file.0 as usize].1;
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return false;
        }

        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        true
    }

    fn close(&self, _file: FileId) {}
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Minimal ELF64 executable: `segments` is `(vaddr, file bytes, mem size)`;
/// physical addresses mirror the virtual ones.
pub fn build_elf64(entry: u64, segments: &[(u64, Vec<u8>, u64)]) -> Vec<u8> {
    let phoff = 64u64;
    let phentsize = 56u16;
    let data_start = phoff + phentsize as u64 * segments.len() as u64;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    push_u16(&mut out, 2); // ET_EXEC
    push_u16(&mut out, 62); // EM_X86_64
    push_u32(&mut out, 1);
    push_u64(&mut out, entry);
    push_u64(&mut out, phoff);
    push_u64(&mut out, 0); // shoff
    push_u32(&mut out, 0); // flags
    push_u16(&mut out, 64); // ehsize
    push_u16(&mut out, phentsize);
    push_u16(&mut out, segments.len() as u16);
    push_u16(&mut out, 0); // shentsize
    push_u16(&mut out, 0); // shnum
    push_u16(&mut out, 0); // shstrndx

    let mut offset = data_start;
    for (vaddr, data, memsz) in segments {
        push_u32(&mut out, 1); // PT_LOAD
        push_u32(&mut out, 0x7); // rwx
        push_u64(&mut out, offset);
        push_u64(&mut out, *vaddr);
        push_u64(&mut out, *vaddr);
        push_u64(&mut out, data.len() as u64);
        push_u64(&mut out, *memsz);
        push_u64(&mut out, PAGE_SIZE);
        offset += data.len() as u64;
    }

    for (_, data, _) in segments {
        out.extend_from_slice(data);
    }

    out
}

/// Minimal ELF32 executable: `segments` is `(vaddr, paddr, file bytes, mem
/// size)`.
pub fn build_elf32(entry: u32, segments: &[(u64, u64, Vec<u8>, u64)]) -> Vec<u8> {
    let phoff = 52u32;
    let phentsize = 32u16;
    let data_start = phoff + phentsize as u32 * segments.len() as u32;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    push_u16(&mut out, 2); // ET_EXEC
    push_u16(&mut out, 3); // EM_386
    push_u32(&mut out, 1);
    push_u32(&mut out, entry);
    push_u32(&mut out, phoff);
    push_u32(&mut out, 0); // shoff
    push_u32(&mut out, 0); // flags
    push_u16(&mut out, 52); // ehsize
    push_u16(&mut out, phentsize);
    push_u16(&mut out, segments.len() as u16);
    push_u16(&mut out, 0); // shentsize
    push_u16(&mut out, 0); // shnum
    push_u16(&mut out, 0); // shstrndx

    let mut offset = data_start;
    for (vaddr, paddr, data, memsz) in segments {
        push_u32(&mut out, 1); // PT_LOAD
        push_u32(&mut out, offset);
        push_u32(&mut out, *vaddr as u32);
        push_u32(&mut out, *paddr as u32);
        push_u32(&mut out, data.len() as u32);
        push_u32(&mut out, *memsz as u32);
        push_u32(&mut out, 0x7); // flags
        push_u32(&mut out, PAGE_SIZE as u32);
        offset += data.len() as u32;
    }

    for (_, _, data, _) in segments {
        out.extend_from_slice(data);
    }

    out
}

/// Literal values for building parse trees in tests.
pub enum TVal {
    Null,
    B(bool),
    U(u64),
    S(&'static str),
    Obj(Vec<(&'static str, TVal)>),
}

pub struct OwnedConfig {
    entries: Vec<Entry<'static>>,
    root: Scope,
    first_loadable: Option<u32>,
}

impl OwnedConfig {
    pub fn config(&self) -> Config<'_> {
        Config::new(&self.entries, self.root, self.first_loadable)
    }
}

const PLACEHOLDER: Entry<'static> = Entry {
    key: "",
    kind: EntryKind::Value(Value::Null),
    next_in_scope: 0,
};

fn lower(entries: &mut Vec<Entry<'static>>, value: TVal) -> Value<'static> {
    match value {
        TVal::Null => Value::Null,
        TVal::B(b) => Value::Boolean(b),
        TVal::U(u) => Value::Unsigned(u),
        TVal::S(s) => Value::Str(s),
        TVal::Obj(items) => Value::Object(Scope(emit_scope(entries, items))),
    }
}

fn emit_scope(
    entries: &mut Vec<Entry<'static>>,
    items: Vec<(&'static str, TVal)>,
) -> Option<u32> {
    if items.is_empty() {
        return None;
    }

    // Reserve the scope's slots first so siblings stay contiguous; nested
    // objects land after them.
    let base = entries.len();
    let count = items.len();
    entries.resize(base + count, PLACEHOLDER);

    for (i, (key, value)) in items.into_iter().enumerate() {
        let value = lower(entries, value);
        entries[base + i] = Entry {
            key,
            kind: EntryKind::Value(value),
            next_in_scope: if i + 1 < count { 1 } else { 0 },
        };
    }

    Some(base as u32)
}

/// Flattens globals and loadable entries into the parser's buffer format.
pub fn build_config(
    globals: Vec<(&'static str, TVal)>,
    loadables: Vec<(&'static str, Vec<(&'static str, TVal)>)>,
) -> OwnedConfig {
    let mut entries: Vec<Entry<'static>> = Vec::new();
    let root_count = globals.len() + loadables.len();
    entries.resize(root_count, PLACEHOLDER);

    let mut slot = 0usize;
    for (key, value) in globals {
        let value = lower(&mut entries, value);
        entries[slot] = Entry {
            key,
            kind: EntryKind::Value(value),
            next_in_scope: if slot + 1 < root_count { 1 } else { 0 },
        };
        slot += 1;
    }

    let mut markers = Vec::new();
    for (name, items) in loadables {
        let first_child = emit_scope(&mut entries, items);
        markers.push(slot as u32);
        entries[slot] = Entry {
            key: name,
            kind: EntryKind::Loadable {
                first_child,
                next_loadable: None,
            },
            next_in_scope: if slot + 1 < root_count { 1 } else { 0 },
        };
        slot += 1;
    }

    for pair in markers.windows(2) {
        let index = pair[0] as usize;
        if let EntryKind::Loadable { first_child, .. } = entries[index].kind {
            entries[index].kind = EntryKind::Loadable {
                first_child,
                next_loadable: Some(pair[1]),
            };
        }
    }

    OwnedConfig {
        entries,
        root: Scope((root_count > 0).then_some(0)),
        first_loadable: markers.first().copied(),
    }
}

/// A single loadable entry named "default" holding `items`.
pub fn entry_config(items: Vec<(&'static str, TVal)>) -> OwnedConfig {
    build_config(vec![], vec![("default", items)])
}

/// One record of an emitted attribute array; `offset` is relative to the
/// array base.
pub struct RawAttr {
    pub kind: u32,
    pub size: u32,
    pub offset: u32,
}

pub fn read_struct<T: Copy>(ms: &MockMemory, physical: u64) -> T {
    unsafe { (ms.phys_to_virt(PhysAddr::new(physical)) as *const T).read_unaligned() }
}

/// Walks an attribute array the way a kernel would: count from the
/// preamble, then size-driven hops.
pub fn read_attributes(ms: &MockMemory, array: u64) -> Vec<RawAttr> {
    let count: u32 = read_struct(ms, array + 4);
    let mut offset = 8u32;
    let mut out = Vec::new();

    for _ in 0..count {
        let header: AttributeHeader = read_struct(ms, array + offset as u64);
        out.push(RawAttr {
            kind: header.kind,
            size: header.size_in_bytes,
            offset,
        });
        offset += header.size_in_bytes;
    }

    out
}
