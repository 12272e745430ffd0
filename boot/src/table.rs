//! Partition table
//!
//! The table lives at a fixed flash offset and is written by a host tool.  It
//! consists of a header followed by `count` fixed size entries:
//!
//! ```text
//! header (24 bytes):  magic u32 | version u16 | count u16 | md5 [u8; 16]
//! entry  (32 bytes):  magic u16 | type u8 | subtype u8 | offset u32 |
//!                     size u32 | label [u8; 16] | flags u32
//! ```
//!
//! The digest is MD5 over the `count` entries exactly as stored.  Entries
//! are read until `count` is reached or an entry without the entry magic is
//! found, whichever comes first.

use core::borrow::Borrow;

use asraw::{AsMutRaw, AsRaw};
use log::{debug, error, info, warn};
use md5::Md5;
use sha2::{Digest, Sha256};
use storage::{Flash, ReadFlash};

use crate::{registry::PartitionHandle, BootConfig, Error, Result};

pub const TABLE_MAGIC: u32 = 0x4c42_5450;
pub const TABLE_VERSION: u16 = 1;
pub const ENTRY_MAGIC: u16 = 0x50aa;

/// The table, header included, never extends past one sector.
pub const TABLE_MAX_LEN: usize = 0x1000;

/// Capacity of the in-memory table.
pub const MAX_PARTITIONS: usize = 32;

pub const LABEL_LEN: usize = 16;

const FLAG_ENCRYPTED: u32 = 1 << 0;

/// Partition names.  ASCII, at most 16 bytes.
pub type Label = heapless::String<LABEL_LEN>;

/// Identifies the flash chip a partition resides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipId(pub u8);

impl ChipId {
    /// The chip the bootloader and the partition table live on.
    pub const DEFAULT: ChipId = ChipId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    App,
    Data,
    Other(u8),
}

impl PartitionKind {
    pub const fn from_raw(raw: u8) -> PartitionKind {
        match raw {
            0x00 => PartitionKind::App,
            0x01 => PartitionKind::Data,
            n => PartitionKind::Other(n),
        }
    }

    pub const fn to_raw(self) -> u8 {
        match self {
            PartitionKind::App => 0x00,
            PartitionKind::Data => 0x01,
            PartitionKind::Other(n) => n,
        }
    }
}

/// Partition subtype.  The meaning of the value depends on the partition
/// kind, so this is kept as a plain number with named values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subtype(pub u8);

impl Subtype {
    pub const FACTORY: Subtype = Subtype(0x00);
    pub const OTA_MIN: Subtype = Subtype(0x10);
    pub const OTA_0: Subtype = Subtype(0x10);
    pub const OTA_1: Subtype = Subtype(0x11);
    pub const OTA_MAX: Subtype = Subtype(0x1f);
    pub const TEST: Subtype = Subtype(0x20);

    pub const DATA_OTA: Subtype = Subtype(0x00);
    pub const DATA_PHY: Subtype = Subtype(0x01);
    pub const DATA_RAW: Subtype = Subtype(0x80);
    pub const DATA_READONLY: Subtype = Subtype(0x81);
    pub const DATA_LFS: Subtype = Subtype(0x82);

    /// Matches any subtype in a lookup.  Also the "nothing recorded" value in
    /// the OTA state.
    pub const ANY: Subtype = Subtype(0xff);

    /// The application subtype of OTA slot `n`.
    pub const fn ota(n: u8) -> Subtype {
        Subtype(Self::OTA_MIN.0 + (n & 0x0f))
    }

    /// The OTA slot number, for application subtypes in the OTA range.
    pub const fn ota_slot(self) -> Option<usize> {
        if self.0 >= Self::OTA_MIN.0 && self.0 <= Self::OTA_MAX.0 {
            Some((self.0 - Self::OTA_MIN.0) as usize)
        } else {
            None
        }
    }
}

/// Placement of a partition on its chip, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub offset: u32,
    pub size: u32,
}

impl Position {
    pub fn end(&self) -> usize {
        self.offset as usize + self.size as usize
    }
}

/// Where a partition descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Table,
    External(PartitionHandle),
}

/// A region of a flash chip.  Descriptors are plain values: they don't hold
/// on to the flash, and every access takes the flash of the chip they were
/// described on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub chip: ChipId,
    pub kind: PartitionKind,
    pub subtype: Subtype,
    pub position: Position,
    pub label: Label,
    /// Accesses go through the flash encryption path.
    pub encrypted: bool,
    pub(crate) origin: Origin,
}

impl Partition {
    /// Does this partition satisfy a lookup?  `Subtype::ANY` and a missing
    /// label match everything.
    pub fn matches(&self, kind: PartitionKind, subtype: Subtype, label: Option<&str>) -> bool {
        self.kind == kind
            && (subtype == Subtype::ANY || self.subtype == subtype)
            && label.map_or(true, |l| self.label.as_str() == l)
    }

    /// Was this partition added at runtime, rather than read from the table?
    pub fn is_external(&self) -> bool {
        matches!(self.origin, Origin::External(_))
    }

    /// Short human readable description, for the table dump.
    pub fn usage(&self) -> &'static str {
        match (self.kind, self.subtype) {
            (PartitionKind::App, Subtype::FACTORY) => "factory app",
            (PartitionKind::App, Subtype::TEST) => "test app",
            (PartitionKind::App, s) if s.ota_slot().is_some() => "OTA app",
            (PartitionKind::App, _) => "Unknown app",
            (PartitionKind::Data, Subtype::DATA_OTA) => "OTA data",
            (PartitionKind::Data, Subtype::DATA_PHY) => "RF data",
            (PartitionKind::Data, _) => "Unknown data",
            _ => "unknown",
        }
    }

    /// Translate a partition relative access into a chip offset.  An offset
    /// past the end is an invalid argument; a length that runs off the end is
    /// an invalid size.
    fn bounds(&self, offset: usize, len: usize) -> Result<usize> {
        let size = self.position.size as usize;
        if offset > size {
            return Err(Error::InvalidArgument);
        }
        if len > size - offset {
            return Err(Error::InvalidSize);
        }
        Ok(self.position.offset as usize + offset)
    }

    pub fn read<F: ReadFlash + ?Sized>(&self, flash: &mut F, offset: usize, buf: &mut [u8]) -> Result<()> {
        let addr = self.bounds(offset, buf.len())?;
        if self.encrypted {
            flash.read_encrypted(addr, buf)?;
        } else {
            flash.read(addr, buf)?;
        }
        Ok(())
    }

    pub fn write<F: Flash + ?Sized>(&self, flash: &mut F, offset: usize, data: &[u8]) -> Result<()> {
        let addr = self.bounds(offset, data.len())?;
        if self.encrypted {
            flash.write_encrypted(addr, data)?;
        } else {
            flash.write(addr, data)?;
        }
        Ok(())
    }

    /// Erase `len` bytes at `offset`.  Both must be multiples of the sector
    /// size.
    pub fn erase<F: Flash + ?Sized>(&self, flash: &mut F, offset: usize, len: usize) -> Result<()> {
        let addr = self.bounds(offset, len)?;
        let sector = flash.erase_size();
        if len % sector != 0 {
            return Err(Error::InvalidSize);
        }
        if offset % sector != 0 {
            return Err(Error::InvalidArgument);
        }
        flash.erase(addr, addr + len)?;
        Ok(())
    }

    /// Erase the whole partition.
    pub fn erase_all<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<()> {
        self.erase(flash, 0, self.position.size as usize)
    }

    /// SHA-256 over the whole partition contents.
    pub fn sha256<F: ReadFlash + ?Sized>(&self, flash: &mut F) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 128];
        let size = self.position.size as usize;
        let mut pos = 0;
        while pos < size {
            let todo = (size - pos).min(buffer.len());
            let buf = &mut buffer[..todo];
            self.read(flash, pos, buf)?;
            hasher.update(&*buf);
            pos += todo;
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(hasher.finalize().as_slice());
        Ok(result)
    }

    /// Do two partitions hold the same bytes?  Both must be on `flash`.
    pub fn same_contents<F: ReadFlash + ?Sized>(&self, other: &Partition, flash: &mut F) -> Result<bool> {
        if self.position.size != other.position.size {
            return Ok(false);
        }
        Ok(self.sha256(flash)? == other.sha256(flash)?)
    }
}

/// The table header.  This is intended to be interpreted as a C struct.
#[derive(Debug, Default)]
#[repr(C)]
pub struct TableHeader {
    magic: u32,
    version: u16,
    count: u16,
    /// MD5 of the `count` entries.
    digest: [u8; 16],
}

impl AsRaw for TableHeader {}
unsafe impl AsMutRaw for TableHeader {}

/// A single table entry, as stored.
#[derive(Debug, Default)]
#[repr(C)]
pub struct PartitionInfo {
    magic: u16,
    kind: u8,
    subtype: u8,
    offset: u32,
    size: u32,
    label: [u8; LABEL_LEN],
    flags: u32,
}

impl AsRaw for PartitionInfo {}
unsafe impl AsMutRaw for PartitionInfo {}

/// Largest entry count the table area can hold.
const MAX_ENTRIES: usize = (TABLE_MAX_LEN - TableHeader::RAW_SIZE) / PartitionInfo::RAW_SIZE;

impl PartitionInfo {
    fn label(&self) -> Option<Label> {
        let len = self.label.iter().position(|b| *b == 0).unwrap_or(LABEL_LEN);
        let raw = &self.label[..len];
        if !raw.is_ascii() {
            return None;
        }
        let mut label = Label::new();
        label.push_str(core::str::from_utf8(raw).ok()?).ok()?;
        Some(label)
    }

    /// Convert to a descriptor, applying the encryption policy.
    fn to_partition(&self, config: &BootConfig, capacity: usize) -> Result<Partition> {
        let kind = PartitionKind::from_raw(self.kind);
        let subtype = Subtype(self.subtype);
        let position = Position {
            offset: self.offset,
            size: self.size,
        };
        if self.offset as u64 + self.size as u64 > capacity as u64 {
            error!(
                "Partition at 0x{:x} (0x{:x} bytes) is past the end of flash",
                self.offset, self.size
            );
            return Err(Error::TableCorrupt);
        }
        let label = self.label().ok_or_else(|| {
            error!("Partition at 0x{:x} has an invalid label", self.offset);
            Error::TableCorrupt
        })?;

        let encrypted = config.flash_encryption
            && (kind == PartitionKind::App
                || (kind == PartitionKind::Data && subtype == Subtype::DATA_OTA)
                || self.flags & FLAG_ENCRYPTED != 0);

        Ok(Partition {
            chip: ChipId::DEFAULT,
            kind,
            subtype,
            position,
            label,
            encrypted,
            origin: Origin::Table,
        })
    }
}

/// The decoded partition table.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    entries: heapless::Vec<Partition, MAX_PARTITIONS>,
}

impl PartitionTable {
    /// Read and validate the table at `config.table_offset`.
    pub fn load<F: ReadFlash + ?Sized>(flash: &mut F, config: &BootConfig) -> Result<PartitionTable> {
        let base = config.table_offset;
        let mut header = TableHeader::default();
        flash.read(base, header.as_mut_raw())?;

        if header.magic != TABLE_MAGIC {
            error!("No partition table at 0x{:x} (magic 0x{:08x})", base, header.magic);
            return Err(Error::TableCorrupt);
        }
        if header.version != TABLE_VERSION {
            error!("Unsupported partition table version {}", header.version);
            return Err(Error::TableCorrupt);
        }
        let count = header.count as usize;
        if count == 0 || count > MAX_ENTRIES || count > MAX_PARTITIONS {
            error!("Partition table entry count {} out of range", count);
            return Err(Error::TableCorrupt);
        }

        let capacity = flash.capacity();
        let mut hasher = Md5::new();
        let mut entries = heapless::Vec::new();
        let mut ended = false;
        for i in 0..count {
            let mut info = PartitionInfo::default();
            flash.read(base + TableHeader::RAW_SIZE + i * PartitionInfo::RAW_SIZE, info.as_mut_raw())?;
            hasher.update(info.as_raw());

            if ended {
                continue;
            }
            if info.magic != ENTRY_MAGIC {
                warn!("Partition table ends early, at entry {} of {}", i, count);
                ended = true;
                continue;
            }
            let part = info.to_partition(config, capacity)?;
            entries.push(part).map_err(|_| Error::NoSpace)?;
        }

        if hasher.finalize().as_slice() != header.digest {
            error!("Partition table digest mismatch");
            return Err(Error::TableCorrupt);
        }
        if entries.is_empty() {
            error!("Partition table has no partitions");
            return Err(Error::TableCorrupt);
        }

        debug!("Loaded {} partitions", entries.len());
        Ok(PartitionTable { entries })
    }

    pub fn entries(&self) -> &[Partition] {
        &self.entries
    }

    pub fn into_entries(self) -> heapless::Vec<Partition, MAX_PARTITIONS> {
        self.entries
    }

    pub fn find(&self, kind: PartitionKind, subtype: Subtype, label: Option<&str>) -> Option<&Partition> {
        self.entries.iter().find(|p| p.matches(kind, subtype, label))
    }

    /// Log the table.
    pub fn dump(&self) {
        dump(self.entries.iter());
    }
}

/// Log a list of partitions, one per line.
pub fn dump<P: Borrow<Partition>>(parts: impl IntoIterator<Item = P>) {
    info!("Partition Table:");
    info!("## Label            Usage          Type ST Offset   Length");
    for (i, p) in parts.into_iter().enumerate() {
        let p = p.borrow();
        info!(
            "{:2} {:<16} {:<14} {:02x}   {:02x} {:08x} {:08x}{}",
            i,
            p.label.as_str(),
            p.usage(),
            p.kind.to_raw(),
            p.subtype.0,
            p.position.offset,
            p.position.size,
            if p.encrypted { " encrypted" } else { "" }
        );
    }
    info!("End of partition table");
}
