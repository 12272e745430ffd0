//! Simulated flash
//!
//! The NOR-type flashes found next to the boot ROM differ quite a bit in
//! terms of geometry.  This simulator attempts to capture the parts that matter
//! to the bootloader:
//!
//! - Erase sets a whole sector to 0xff.  Erases must be sector aligned.
//! - Writes are only allowed onto erased bytes.  Writing over programmed data
//!   fails with `NotErased` instead of silently AND-ing bits together.
//! - Writes can be cut short, simulating a power loss in the middle of a
//!   program operation.
//! - An optional encryption key enables the encrypted read/write path.  The
//!   "cipher" is a byte-wise XOR, which is enough to tell the two paths apart.
//!
//! Counters of every operation are kept so tests can check how often the
//! device was touched.

use anyhow::{anyhow, Result};
use storage::{Error, Flash, ReadFlash};

pub mod gen;
pub mod styles;

/// Operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub reads: usize,
    pub writes: usize,
    pub erases: usize,
    pub encrypted_reads: usize,
    pub encrypted_writes: usize,
}

#[derive(Clone, Debug)]
pub struct SimFlash {
    data: Vec<u8>,
    read_size: usize,
    write_size: usize,
    erase_size: usize,
    key: Option<u8>,
    /// Number of bytes that can still be programmed before the power is cut.
    power_cut: Option<usize>,
    stats: Stats,
}

impl SimFlash {
    /// Build an erased device.
    pub fn new(read_size: usize, write_size: usize, erase_size: usize, sectors: usize) -> Result<SimFlash> {
        if !read_size.is_power_of_two() || !write_size.is_power_of_two() || !erase_size.is_power_of_two() {
            return Err(anyhow!("flash sizes must be powers of two"));
        }
        if erase_size % write_size != 0 {
            return Err(anyhow!("erase size {} is not a multiple of write size {}", erase_size, write_size));
        }
        if sectors == 0 {
            return Err(anyhow!("flash needs at least one sector"));
        }
        Ok(SimFlash {
            data: vec![0xff; erase_size * sectors],
            read_size,
            write_size,
            erase_size,
            key: None,
            power_cut: None,
            stats: Stats::default(),
        })
    }

    /// Program data directly, bypassing the erase/write discipline.  This is
    /// what a factory programmer does.
    pub fn install(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| anyhow!("install of {} bytes at 0x{:x} does not fit", data.len(), offset))?;
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Like `install`, but through the encryption path.
    pub fn install_encrypted(&mut self, data: &[u8], offset: usize) -> Result<()> {
        let key = self.key.ok_or_else(|| anyhow!("no encryption key set"))?;
        let cipher: Vec<u8> = data.iter().map(|b| b ^ key).collect();
        self.install(&cipher, offset)
    }

    /// Raw view of the device contents.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn range(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Overwrite bytes without any checks, e.g. to flip a bit.
    pub fn corrupt(&mut self, offset: usize, data: &[u8]) {
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn set_encryption_key(&mut self, key: u8) {
        self.key = Some(key);
    }

    /// After `bytes` more bytes have been programmed, the next write stops
    /// part way and fails.  The cut only fires once.
    pub fn power_cut_after(&mut self, bytes: usize) {
        self.power_cut = Some(bytes);
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        storage::check_write(self, offset, bytes.len())?;
        if self.data[offset..offset + bytes.len()].iter().any(|b| *b != 0xff) {
            return Err(Error::NotErased);
        }

        let (len, cut) = match self.power_cut {
            Some(left) if left < bytes.len() => (left, true),
            Some(left) => {
                self.power_cut = Some(left - bytes.len());
                (bytes.len(), false)
            }
            None => (bytes.len(), false),
        };

        self.data[offset..offset + len].copy_from_slice(&bytes[..len]);
        if cut {
            self.power_cut = None;
            return Err(Error::Device);
        }
        Ok(())
    }
}

impl ReadFlash for SimFlash {
    fn read_size(&self) -> usize {
        self.read_size
    }

    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        storage::check_read(self, offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        self.stats.reads += 1;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn read_encrypted(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        let key = self.key.ok_or(Error::NotSupported)?;
        storage::check_read(self, offset, bytes.len())?;
        for (dst, src) in bytes.iter_mut().zip(&self.data[offset..]) {
            *dst = src ^ key;
        }
        self.stats.encrypted_reads += 1;
        Ok(())
    }
}

impl Flash for SimFlash {
    fn write_size(&self) -> usize {
        self.write_size
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn erase(&mut self, from: usize, to: usize) -> storage::Result<()> {
        storage::check_erase(self, from, to)?;
        self.data[from..to].fill(0xff);
        self.stats.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        self.program(offset, bytes)?;
        self.stats.writes += 1;
        Ok(())
    }

    fn write_encrypted(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        let key = self.key.ok_or(Error::NotSupported)?;
        let cipher: Vec<u8> = bytes.iter().map(|b| b ^ key).collect();
        self.program(offset, &cipher)?;
        self.stats.encrypted_writes += 1;
        Ok(())
    }
}
