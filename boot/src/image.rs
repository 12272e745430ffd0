//! Boot image support
//!
//! An application partition starts with a small header and a table of
//! segments.  Each segment is a run of bytes in the partition that must be
//! copied to a destination address before the image can run:
//!
//! ```text
//! count u32 | entry u32 | count * (flash_start u32 | dest u32 | size u32) | u32
//! ```
//!
//! `flash_start` is relative to the start of the partition.  The word after
//! the segment table is written by the image tool but not checked here.

use asraw::{AsMutRaw, AsRaw};
use log::{debug, error, info};
use storage::ReadFlash;

use crate::{platform::Platform, Error, Partition, Result};

/// At most this many segments are loaded.  A header claiming more is
/// rejected outright.
pub const MAX_SEGMENTS: usize = 16;

/// Size of the bounce buffer used when flash can't be read straight into
/// the destination.
pub const COPY_CHUNK: usize = 1024;

/// Bytes of the vector table held back until interrupts are disabled.
pub const VECTOR_BLOCK_SIZE: usize = 0x100;

/// The image begins with the following header.  This is intended to be
/// interpreted as a C struct.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct BinaryHeader {
    pub segment_count: u32,
    /// Address of the first instruction.
    pub entry: u32,
}

impl AsRaw for BinaryHeader {}
unsafe impl AsMutRaw for BinaryHeader {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Segment {
    pub flash_start: u32,
    pub dest: u32,
    pub size: u32,
}

impl AsRaw for Segment {}
unsafe impl AsMutRaw for Segment {}

/// An image residing in an application partition, with its segment table
/// read and checked against the partition bounds.
#[derive(Debug)]
pub struct Image {
    pub header: BinaryHeader,
    segments: heapless::Vec<Segment, MAX_SEGMENTS>,
    partition: Partition,
}

impl Image {
    /// Read the header and segment table.  This does not look at the segment
    /// data.
    pub fn from_partition<F: ReadFlash + ?Sized>(flash: &mut F, partition: &Partition) -> Result<Image> {
        let mut header = BinaryHeader::default();
        partition.read(flash, 0, header.as_mut_raw())?;

        let count = header.segment_count as usize;
        if count > MAX_SEGMENTS {
            error!("Image in {} has {} segments", partition.label.as_str(), count);
            return Err(Error::CorruptImage);
        }

        let mut segments = heapless::Vec::new();
        for i in 0..count {
            let mut seg = Segment::default();
            partition.read(flash, BinaryHeader::RAW_SIZE + i * Segment::RAW_SIZE, seg.as_mut_raw())?;

            let end = seg.flash_start as u64 + seg.size as u64;
            if end > partition.position.size as u64 {
                error!(
                    "Segment {} (0x{:x}+0x{:x}) runs past the partition",
                    i, seg.flash_start, seg.size
                );
                return Err(Error::CorruptImage);
            }
            if seg.dest.checked_add(seg.size).is_none() {
                error!("Segment {} wraps the address space", i);
                return Err(Error::CorruptImage);
            }
            segments.push(seg).map_err(|_| Error::CorruptImage)?;
        }

        Ok(Image {
            header,
            segments,
            partition: partition.clone(),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn entry(&self) -> u32 {
        self.header.entry
    }

    /// Copy every segment to its destination.  Any part of a segment aimed
    /// at the vector table is held back, and only written by `launch`.
    /// Nothing is copied unless the platform accepts every destination.
    pub fn load<F: ReadFlash + ?Sized, P: Platform>(self, flash: &mut F, platform: &mut P) -> Result<LoadedImage> {
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.size > 0 && !platform.is_loadable(seg.dest, seg.size as usize) {
                error!(
                    "Segment {} (0x{:08x}+0x{:x}) is outside loadable memory",
                    i, seg.dest, seg.size
                );
                return Err(Error::CorruptImage);
            }
        }

        let mut vectors = None;
        for seg in &self.segments {
            info!(
                "Segment 0x{:08x} -> 0x{:08x} (0x{:x} bytes)",
                seg.flash_start, seg.dest, seg.size
            );
            let mut seg = *seg;

            if seg.dest == platform.vector_base() && seg.size > 0 {
                let len = (seg.size as usize).min(VECTOR_BLOCK_SIZE);
                let mut block = VectorBlock {
                    dest: seg.dest,
                    len,
                    data: [0; VECTOR_BLOCK_SIZE],
                };
                self.partition
                    .read(flash, seg.flash_start as usize, &mut block.data[..len])?;
                vectors = Some(block);

                seg.flash_start += len as u32;
                seg.dest += len as u32;
                seg.size -= len as u32;
            }

            self.copy(flash, platform, &seg)?;
        }

        Ok(LoadedImage {
            entry: self.header.entry,
            vectors,
        })
    }

    fn copy<F: ReadFlash + ?Sized, P: Platform>(&self, flash: &mut F, platform: &mut P, seg: &Segment) -> Result<()> {
        let size = seg.size as usize;
        if size == 0 {
            return Ok(());
        }

        if platform.is_direct(seg.dest, size) {
            let dest = unsafe { platform.memory(seg.dest, size) };
            return self.partition.read(flash, seg.flash_start as usize, dest);
        }

        let mut buffer = [0u8; COPY_CHUNK];
        let mut pos = 0;
        while pos < size {
            let todo = (size - pos).min(COPY_CHUNK);
            let buf = &mut buffer[..todo];
            self.partition.read(flash, seg.flash_start as usize + pos, buf)?;
            let dest = unsafe { platform.memory(seg.dest + pos as u32, todo) };
            dest.copy_from_slice(buf);
            pos += todo;
        }
        debug!("Copied 0x{:x} bytes through the bounce buffer", size);
        Ok(())
    }
}

/// The held back start of the vector table.
#[derive(Debug)]
struct VectorBlock {
    dest: u32,
    len: usize,
    data: [u8; VECTOR_BLOCK_SIZE],
}

/// An image whose segments are in place.  The only thing left to do with it
/// is to run it.
#[derive(Debug)]
pub struct LoadedImage {
    entry: u32,
    vectors: Option<VectorBlock>,
}

impl LoadedImage {
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Hand control to the image.  The flash is consumed and closed first;
    /// after that, interrupts go off and the vector table is written, then
    /// the instruction cache is flushed and the jump made.
    pub fn launch<F, P: Platform>(self, flash: F, platform: &mut P) -> ! {
        info!("Starting image at 0x{:08x}", self.entry);
        drop(flash);
        platform.restore_pads();
        platform.disable_interrupts();
        if let Some(block) = &self.vectors {
            let dest = unsafe { platform.memory(block.dest, block.len) };
            dest.copy_from_slice(&block.data[..block.len]);
        }
        platform.flush_icache();
        unsafe { platform.jump(self.entry) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(BinaryHeader::RAW_SIZE, 8);
        assert_eq!(Segment::RAW_SIZE, 12);
    }
}
