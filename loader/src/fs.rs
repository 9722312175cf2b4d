//! Path resolution and the filesystem registry.
//!
//! A path names a disk, a partition on it and a file within:
//! `DISK0-PART1::/boot/kernel.elf`, `hd0:/boot/kernel.elf` (raw, whole-disk
//! filesystem), `DISKUUID<guid>-PARTUUID-<guid>::/file`, or `/file` and
//! `::/file` relative to wherever the configuration file came from. The
//! platform entry registers every detected filesystem here; the load path
//! resolves paths against the registry.

use arrayvec::ArrayVec;

pub const MAX_FILESYSTEMS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const ZERO: Guid = Guid {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Parses the canonical 36-character `8-4-4-4-12` form.
    pub fn parse(text: &str) -> Option<Guid> {
        let bytes = text.as_bytes();
        if bytes.len() != 36 {
            return None;
        }

        for (i, b) in bytes.iter().enumerate() {
            let expect_dash = matches!(i, 8 | 13 | 18 | 23);
            if expect_dash != (*b == b'-') {
                return None;
            }
        }

        let hex = |range: core::ops::Range<usize>| -> Option<u64> {
            let mut out = 0u64;
            for b in &bytes[range] {
                out = (out << 4) | hex_digit(*b)? as u64;
            }
            Some(out)
        };

        let mut data4 = [0u8; 8];
        data4[0] = hex(19..21)? as u8;
        data4[1] = hex(21..23)? as u8;
        for i in 0..6 {
            data4[2 + i] = hex(24 + i * 2..26 + i * 2)? as u8;
        }

        Some(Guid {
            data1: hex(0..8)? as u32,
            data2: hex(9..13)? as u16,
            data3: hex(14..18)? as u16,
            data4,
        })
    }

    /// On-disk (GPT-style) byte order: the first three fields little-endian.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskIdentifier {
    /// The disk the configuration file was loaded from.
    Origin,
    Index(u32),
    Guid(Guid),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionIdentifier {
    /// The partition the configuration file was loaded from.
    Origin,
    /// The whole disk, treated as one filesystem.
    Raw,
    Index(u32),
    Guid(Guid),
}

/// A fully resolved disk location.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FullPath<'a> {
    pub disk: DiskIdentifier,
    pub partition: PartitionIdentifier,
    pub path_within_partition: &'a str,
}

/// Parses the textual path syntax. `None` means the syntax is invalid; the
/// caller decides how fatal that is.
pub fn parse_path(path: &str) -> Option<FullPath<'_>> {
    // Relative to the disk the config came from.
    if path.starts_with("::/") {
        return origin_path(&path[2..]);
    }
    if path.starts_with('/') {
        return origin_path(path);
    }

    let (disk, rest) = consume_disk_identifier(path)?;

    let (partition, rest) = if let Some(rest) = rest.strip_prefix('-') {
        consume_partition_identifier(rest)?
    } else {
        // No partition identifier: the disk carries the filesystem directly.
        // GPT disks cannot be treated as unpartitioned media, so raw access
        // is index-only.
        if !matches!(disk, DiskIdentifier::Index(_)) {
            return None;
        }
        (PartitionIdentifier::Raw, rest)
    };

    let file_path = rest.strip_prefix("::").or_else(|| rest.strip_prefix(':'))?;
    if !file_path.starts_with('/') {
        return None;
    }

    Some(FullPath {
        disk,
        partition,
        path_within_partition: file_path,
    })
}

fn origin_path(path: &str) -> Option<FullPath<'_>> {
    if !path.starts_with('/') {
        return None;
    }

    Some(FullPath {
        disk: DiskIdentifier::Origin,
        partition: PartitionIdentifier::Origin,
        path_within_partition: path,
    })
}

fn consume_disk_identifier(path: &str) -> Option<(DiskIdentifier, &str)> {
    if let Some(rest) = path.strip_prefix("DISKUUID") {
        let guid = Guid::parse(rest.get(..36)?)?;
        return Some((DiskIdentifier::Guid(guid), &rest[36..]));
    }

    for prefix in ["DISK", "hd"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            let (index, rest) = consume_number(rest)?;
            return Some((DiskIdentifier::Index(index), rest));
        }
    }

    None
}

fn consume_partition_identifier(path: &str) -> Option<(PartitionIdentifier, &str)> {
    if let Some(rest) = path.strip_prefix("PARTUUID-") {
        let guid = Guid::parse(rest.get(..36)?)?;
        return Some((PartitionIdentifier::Guid(guid), &rest[36..]));
    }

    let rest = path.strip_prefix("PART")?;
    let (index, rest) = consume_number(rest)?;
    Some((PartitionIdentifier::Index(index), rest))
}

fn consume_number(text: &str) -> Option<(u32, &str)> {
    let end = text
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }

    Some((text[..end].parse().ok()?, &text[end..]))
}

/// Handle to a file opened on one of the registered filesystems.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileId(pub u32);

pub trait FileSystem {
    fn open(&self, path: &str) -> Option<FileId>;
    fn size(&self, file: FileId) -> u64;
    fn read(&self, file: FileId, buf: &mut [u8], offset: u64) -> bool;
    fn close(&self, file: FileId);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionKind {
    Raw,
    Mbr,
    Gpt,
}

impl PartitionKind {
    pub fn as_wire(self) -> u32 {
        match self {
            PartitionKind::Raw => shared::protocol::PARTITION_TYPE_RAW,
            PartitionKind::Mbr => shared::protocol::PARTITION_TYPE_MBR,
            PartitionKind::Gpt => shared::protocol::PARTITION_TYPE_GPT,
        }
    }
}

/// One detected filesystem and where it lives.
#[derive(Clone, Copy)]
pub struct FsEntry<'a> {
    pub disk_index: u32,
    pub disk_guid: Option<Guid>,
    pub partition: PartitionKind,
    pub partition_index: u32,
    pub partition_guid: Option<Guid>,
    pub fs: &'a dyn FileSystem,
}

/// Registry of every filesystem detected at startup, keyed by disk and
/// partition identifiers.
pub struct FsTable<'a> {
    entries: ArrayVec<FsEntry<'a>, MAX_FILESYSTEMS>,
    origin: Option<usize>,
}

impl<'a> FsTable<'a> {
    pub fn new() -> Self {
        FsTable {
            entries: ArrayVec::new(),
            origin: None,
        }
    }

    /// Returns `false` when the table is full and the entry was dropped.
    pub fn add(&mut self, entry: FsEntry<'a>) -> bool {
        self.entries.try_push(entry).is_ok()
    }

    /// Marks the entry the configuration file was loaded from.
    pub fn set_origin(&mut self, index: usize) {
        assert!(index < self.entries.len());
        self.origin = Some(index);
    }

    pub fn entries(&self) -> &[FsEntry<'a>] {
        &self.entries
    }

    pub fn origin(&self) -> Option<&FsEntry<'a>> {
        self.origin.map(|i| &self.entries[i])
    }

    pub fn by_full_path(&self, path: &FullPath<'_>) -> Option<&FsEntry<'a>> {
        if path.disk == DiskIdentifier::Origin {
            return self.origin();
        }

        self.entries.iter().find(|entry| {
            let disk_matches = match path.disk {
                DiskIdentifier::Origin => unreachable!(),
                DiskIdentifier::Index(index) => entry.disk_index == index,
                DiskIdentifier::Guid(guid) => entry.disk_guid == Some(guid),
            };

            let partition_matches = match path.partition {
                PartitionIdentifier::Origin => false,
                PartitionIdentifier::Raw => entry.partition == PartitionKind::Raw,
                PartitionIdentifier::Index(index) => {
                    entry.partition != PartitionKind::Raw && entry.partition_index == index
                }
                PartitionIdentifier::Guid(guid) => entry.partition_guid == Some(guid),
            };

            disk_matches && partition_matches
        })
    }
}

impl Default for FsTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}
