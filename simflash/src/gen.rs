//! Image generation.
//!
//! Builders for the three on-flash formats the bootloader consumes: the
//! partition table, the OTA state record and the application binary.  These
//! encode the formats byte by byte, independently of the bootloader's own
//! structures, in the same way the host tools that produce real images do.
//! A bootloader that reads what these builders write is compatible with the
//! tools.

use anyhow::{anyhow, Result};
use md5::{Digest, Md5};
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

/// Partition table constants, as emitted by the table generator tool.
pub mod codes {
    pub const TABLE_MAGIC: u32 = 0x4c42_5450;
    pub const TABLE_VERSION: u16 = 1;
    pub const ENTRY_MAGIC: u16 = 0x50aa;
    pub const HEADER_SIZE: usize = 24;
    pub const ENTRY_SIZE: usize = 32;
    pub const FLAG_ENCRYPTED: u32 = 1;

    pub const APP: u8 = 0x00;
    pub const DATA: u8 = 0x01;

    pub const FACTORY: u8 = 0x00;
    pub const OTA_0: u8 = 0x10;
    pub const OTA_1: u8 = 0x11;
    pub const TEST: u8 = 0x20;
    pub const DATA_OTA: u8 = 0x00;
    pub const DATA_RAW: u8 = 0x80;
    pub const UNDEFINED: u8 = 0xff;

    pub const OTA_RECORD_SIZE: usize = 96;
    pub const OTA_RECORD_VERSION: u8 = 1;
    pub const UPDATE_DATA_MAX: usize = 64;

    pub const NEW: u32 = 0;
    pub const PENDING_VERIFY: u32 = 1;
    pub const VALID: u32 = 2;
    pub const INVALID: u32 = 3;
    pub const ABORTED: u32 = 4;
    pub const UNDEFINED_STATE: u32 = 0xffff_ffff;
}

use codes::*;

#[derive(Clone, Debug)]
pub struct TableEntry {
    pub magic: u16,
    pub kind: u8,
    pub subtype: u8,
    pub label: String,
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

pub struct TableBuilder {
    entries: Vec<TableEntry>,
    magic: u32,
    version: u16,
    count: Option<u16>,
    corrupt_digest: bool,
}

impl Default for TableBuilder {
    fn default() -> Self {
        TableBuilder {
            entries: Vec::new(),
            magic: TABLE_MAGIC,
            version: TABLE_VERSION,
            count: None,
            corrupt_digest: false,
        }
    }
}

impl TableBuilder {
    pub fn entry(&mut self, kind: u8, subtype: u8, label: &str, offset: u32, size: u32) -> &mut Self {
        self.entries.push(TableEntry {
            magic: ENTRY_MAGIC,
            kind,
            subtype,
            label: label.to_string(),
            offset,
            size,
            flags: 0,
        });
        self
    }

    /// Set the encrypted flag on the most recently added entry.
    pub fn encrypted(&mut self) -> &mut Self {
        if let Some(e) = self.entries.last_mut() {
            e.flags |= FLAG_ENCRYPTED;
        }
        self
    }

    /// Break the magic of the most recently added entry.
    pub fn bad_entry_magic(&mut self) -> &mut Self {
        if let Some(e) = self.entries.last_mut() {
            e.magic = 0xffff;
        }
        self
    }

    pub fn magic(&mut self, magic: u32) -> &mut Self {
        self.magic = magic;
        self
    }

    pub fn version(&mut self, version: u16) -> &mut Self {
        self.version = version;
        self
    }

    /// Override the entry count written into the header.
    pub fn count(&mut self, count: u16) -> &mut Self {
        self.count = Some(count);
        self
    }

    pub fn corrupt_digest(&mut self) -> &mut Self {
        self.corrupt_digest = true;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for e in &self.entries {
            if e.label.len() > 16 || !e.label.is_ascii() {
                return Err(anyhow!("bad label {:?}", e.label));
            }
            let mut label = [0u8; 16];
            label[..e.label.len()].copy_from_slice(e.label.as_bytes());

            body.extend_from_slice(&e.magic.to_le_bytes());
            body.push(e.kind);
            body.push(e.subtype);
            body.extend_from_slice(&e.offset.to_le_bytes());
            body.extend_from_slice(&e.size.to_le_bytes());
            body.extend_from_slice(&label);
            body.extend_from_slice(&e.flags.to_le_bytes());
        }

        let mut digest = [0u8; 16];
        digest.copy_from_slice(Md5::digest(&body).as_slice());
        if self.corrupt_digest {
            digest[0] ^= 0xff;
        }

        let count = self.count.unwrap_or(self.entries.len() as u16);
        let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
        data.extend_from_slice(&self.magic.to_le_bytes());
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&count.to_le_bytes());
        data.extend_from_slice(&digest);
        data.extend_from_slice(&body);
        Ok(data)
    }
}

/// Builder of a single OTA state record.
pub struct OtaRecordBuilder {
    sequence: u32,
    stable: u8,
    uploader: u8,
    version: u8,
    lifecycle: u32,
    data: Vec<u8>,
    data_size: Option<u32>,
    corrupt_checksum: bool,
}

impl Default for OtaRecordBuilder {
    fn default() -> Self {
        OtaRecordBuilder {
            sequence: 1,
            stable: FACTORY,
            uploader: UNDEFINED,
            version: OTA_RECORD_VERSION,
            lifecycle: UNDEFINED_STATE,
            data: Vec::new(),
            data_size: None,
            corrupt_checksum: false,
        }
    }
}

impl OtaRecordBuilder {
    pub fn sequence(&mut self, sequence: u32) -> &mut Self {
        self.sequence = sequence;
        self
    }

    pub fn stable(&mut self, subtype: u8) -> &mut Self {
        self.stable = subtype;
        self
    }

    pub fn uploader(&mut self, subtype: u8) -> &mut Self {
        self.uploader = subtype;
        self
    }

    pub fn lifecycle(&mut self, lifecycle: u32) -> &mut Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn version(&mut self, version: u8) -> &mut Self {
        self.version = version;
        self
    }

    pub fn data(&mut self, data: &[u8]) -> &mut Self {
        self.data = data.to_vec();
        self
    }

    /// Override the stored data size, without changing the data.
    pub fn data_size(&mut self, size: u32) -> &mut Self {
        self.data_size = Some(size);
        self
    }

    pub fn corrupt_checksum(&mut self) -> &mut Self {
        self.corrupt_checksum = true;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.data.len() > UPDATE_DATA_MAX {
            return Err(anyhow!("update data too large: {}", self.data.len()));
        }
        let data_size = self.data_size.unwrap_or(self.data.len() as u32);
        let mut update = [0u8; UPDATE_DATA_MAX];
        update[..self.data.len()].copy_from_slice(&self.data);

        let mut hasher = Md5::new();
        hasher.update(self.sequence.to_le_bytes());
        hasher.update([self.stable]);
        hasher.update([self.uploader]);
        hasher.update(self.lifecycle.to_le_bytes());
        hasher.update(data_size.to_le_bytes());
        hasher.update(&update[..(data_size as usize).min(UPDATE_DATA_MAX)]);
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(hasher.finalize().as_slice());
        if self.corrupt_checksum {
            checksum[15] ^= 0x01;
        }

        let mut out = Vec::with_capacity(OTA_RECORD_SIZE);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.stable);
        out.push(self.uploader);
        out.push(self.version);
        out.push(0);
        out.extend_from_slice(&self.lifecycle.to_le_bytes());
        out.extend_from_slice(&data_size.to_le_bytes());
        out.extend_from_slice(&update);
        out.extend_from_slice(&checksum);
        debug_assert_eq!(out.len(), OTA_RECORD_SIZE);
        Ok(out)
    }
}

/// Placement of one segment in a generated image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Offset of the payload from the start of the partition.
    pub flash_start: u32,
    pub dest: u32,
    pub size: u32,
}

pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub entry: u32,
    pub segments: Vec<SegmentInfo>,
    /// Payload of each segment, in order.
    pub payloads: Vec<Vec<u8>>,
}

/// Builder of application binaries: header, segment table, integrity word,
/// then the segment payloads, each aligned to 4 bytes.
pub struct ImageBuilder {
    entry: u32,
    seed: u64,
    segments: Vec<(u32, Vec<u8>)>,
    count: Option<u32>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder {
            entry: 0x1c00_8080,
            seed: 1,
            segments: Vec::new(),
            count: None,
        }
    }
}

impl ImageBuilder {
    pub fn entry(&mut self, entry: u32) -> &mut Self {
        self.entry = entry;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn segment(&mut self, dest: u32, data: &[u8]) -> &mut Self {
        self.segments.push((dest, data.to_vec()));
        self
    }

    /// Add a segment of pseudo-random content.
    pub fn random_segment(&mut self, dest: u32, size: usize) -> &mut Self {
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed.wrapping_add(self.segments.len() as u64));
        let mut data = vec![0u8; size];
        rng.fill_bytes(&mut data);
        self.segments.push((dest, data));
        self
    }

    /// Override the segment count written into the header.
    pub fn segment_count(&mut self, count: u32) -> &mut Self {
        self.count = Some(count);
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        let table_len = 8 + self.segments.len() * 12 + 4;
        let mut pos = table_len.next_multiple_of(4);
        let mut segments = Vec::with_capacity(self.segments.len());
        for (dest, data) in &self.segments {
            segments.push(SegmentInfo {
                flash_start: pos as u32,
                dest: *dest,
                size: data.len() as u32,
            });
            pos = (pos + data.len()).next_multiple_of(4);
        }

        let mut out = vec![0u8; pos];
        let count = self.count.unwrap_or(self.segments.len() as u32);
        out[0..4].copy_from_slice(&count.to_le_bytes());
        out[4..8].copy_from_slice(&self.entry.to_le_bytes());

        let mut sum = 0u32;
        for (i, (seg, (_, data))) in segments.iter().zip(&self.segments).enumerate() {
            let base = 8 + i * 12;
            out[base..base + 4].copy_from_slice(&seg.flash_start.to_le_bytes());
            out[base + 4..base + 8].copy_from_slice(&seg.dest.to_le_bytes());
            out[base + 8..base + 12].copy_from_slice(&seg.size.to_le_bytes());

            let start = seg.flash_start as usize;
            out[start..start + data.len()].copy_from_slice(data);
            sum = data.iter().fold(sum, |acc, b| acc.wrapping_add(*b as u32));
        }
        let crc_pos = 8 + self.segments.len() * 12;
        out[crc_pos..crc_pos + 4].copy_from_slice(&sum.to_le_bytes());

        Ok(GeneratedImage {
            data: out,
            entry: self.entry,
            segments,
            payloads: self.segments.iter().map(|(_, d)| d.clone()).collect(),
        })
    }
}

/// The partition layout used by the tests: the bootloader in sector 0, the
/// table in sector 1, OTA data in sectors 2-3, then factory and two OTA slots.
#[derive(Clone, Copy, Debug)]
pub struct StandardLayout {
    pub sector_size: u32,
    pub table: u32,
    pub ota_data: (u32, u32),
    pub factory: (u32, u32),
    pub ota: [(u32, u32); 2],
}

impl StandardLayout {
    pub fn for_sector(sector_size: usize) -> StandardLayout {
        let s = sector_size as u32;
        let app = (4 * s).max(64 * 1024);
        let factory = 4 * s;
        StandardLayout {
            sector_size: s,
            table: s,
            ota_data: (2 * s, 2 * s),
            factory: (factory, app),
            ota: [(factory + app, app), (factory + 2 * app, app)],
        }
    }

    /// Table with factory, both OTA slots and OTA data.
    pub fn table(&self) -> TableBuilder {
        let mut t = TableBuilder::default();
        t.entry(DATA, DATA_OTA, "otadata", self.ota_data.0, self.ota_data.1)
            .entry(APP, FACTORY, "factory", self.factory.0, self.factory.1)
            .entry(APP, OTA_0, "ota_0", self.ota[0].0, self.ota[0].1)
            .entry(APP, OTA_1, "ota_1", self.ota[1].0, self.ota[1].1);
        t
    }
}
