//! Flash styles
//!
//! The boot flash can be a SPI NOR with small uniform sectors, or a HyperBus
//! NOR with few large sectors.  The OTA data partition needs two sectors, and
//! partitions are sector aligned, so the sector size drives the whole layout.

use anyhow::Result;

use crate::SimFlash;

/// The configuration of a single flash device.
pub struct AreaLayout {
    pub read_size: usize,
    pub write_size: usize,
    pub erase_size: usize,
    pub sectors: usize,
}

impl AreaLayout {
    pub fn build(&self) -> Result<SimFlash> {
        SimFlash::new(self.read_size, self.write_size, self.erase_size, self.sectors)
    }

    pub fn capacity(&self) -> usize {
        self.erase_size * self.sectors
    }
}

/// SPI NOR flash, 4k sectors, byte programmable.
pub static SPI_FLASH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 1,
    erase_size: 4 * 1024,
    sectors: 128,
};

/// HyperBus flash.  Large sectors, programmed by 16-bit word.
pub static HYPER_FLASH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 2,
    erase_size: 64 * 1024,
    sectors: 32,
};

/// Small paged device with a wide program size.
pub static PAGED_FLASH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 16,
    erase_size: 1024,
    sectors: 256,
};

/// Paged NOR programmed a whole 256 byte page at a time.
pub static WIDE_FLASH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 256,
    erase_size: 4 * 1024,
    sectors: 128,
};

/// A second chip, used to register external partitions.
pub static EXTERNAL_FLASH: AreaLayout = AreaLayout {
    read_size: 1,
    write_size: 1,
    erase_size: 4 * 1024,
    sectors: 64,
};

/// All of the boot flash devices.
pub static ALL_FLASHES: [&AreaLayout; 4] = [&SPI_FLASH, &HYPER_FLASH, &PAGED_FLASH, &WIDE_FLASH];

/// An iterator that builds each of the boot flash devices.
pub fn all_flashes() -> impl Iterator<Item = Result<SimFlash>> {
    ALL_FLASHES.iter().map(|layout| layout.build())
}
