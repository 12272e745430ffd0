//! Second stage bootloader core.
//!
//! Reads the partition table from raw flash, reconstructs the redundant OTA
//! state, picks exactly one bootable image, relocates its segments into
//! execution memory and jumps to it.  Everything here runs before any
//! runtime exists: no heap, no file system, and no recovery path except a
//! restart.
//!
//! The boot sequence is, leaf first:
//!
//! - [`table`]: decode the on-flash partition table.
//! - [`registry`]: cache the table once and answer queries about it.
//! - [`ota`]: the two redundant copies of the OTA state record.
//! - [`decision`]: pick the partition to boot.
//! - [`image`]: copy the image's segments and hand off control.
//!
//! [`ssbl::boot`] ties them together.  [`app`] is the small surface the
//! running application uses to confirm or reject itself.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

// The on-flash formats are read in place through `asraw`.
#[cfg(target_endian = "big")]
compile_error!("ssbl reads little endian flash structures in place");

pub mod app;
mod config;
pub mod decision;
pub mod image;
pub mod ota;
pub mod platform;
pub mod registry;
pub mod ssbl;
pub mod state;
pub mod table;

pub use config::BootConfig;
pub use registry::Registry;
pub use table::{ChipId, Partition, PartitionKind, PartitionTable, Position, Subtype};

pub type Result<T> = core::result::Result<T, Error>;

// Use the error kind to avoid this depending on the particular flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Opaque failure from the flash driver.
    Flash(storage::Error),
    /// The partition table header or one of its entries is malformed.
    TableCorrupt,
    /// No partition matches the request.
    NotFound,
    /// A registered region intersects an existing partition on the same chip.
    Overlap,
    InvalidArgument,
    /// Access outside of a partition or a device.
    InvalidSize,
    /// Neither copy of the OTA state is valid.
    NoValidState,
    /// The slot an update should target is not in the partition table.
    SlotNotPresent,
    /// The application image violates the binary format limits.
    CorruptImage,
    /// Nothing in the partition table can be booted.
    NoBootableImage,
    NotSupported,
    /// A fixed capacity container is full.
    NoSpace,
}

/// Convert the flash error into our error type.
impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Flash(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Flash(e) => write!(f, "flash: {}", e),
            Error::TableCorrupt => f.write_str("partition table corrupt"),
            Error::NotFound => f.write_str("partition not found"),
            Error::Overlap => f.write_str("partition overlaps an existing one"),
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::InvalidSize => f.write_str("invalid size"),
            Error::NoValidState => f.write_str("no valid OTA state"),
            Error::SlotNotPresent => f.write_str("OTA slot not present"),
            Error::CorruptImage => f.write_str("corrupt image"),
            Error::NoBootableImage => f.write_str("no bootable image"),
            Error::NotSupported => f.write_str("not supported"),
            Error::NoSpace => f.write_str("no space left"),
        }
    }
}
