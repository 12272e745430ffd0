//! Raw flash interface.
//!
//! This is the boundary between the bootloader core and the flash driver.  The
//! core only ever talks to flash through these traits.  Reads and writes are
//! byte addressable from the caller's view; erases must be sector aligned.
//! Writing over bytes that have not been erased is never assumed to work.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[cfg(feature = "embedded-storage")]
pub mod nor;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    NotAligned,
    OutOfBounds,
    NotWritten,
    NotErased,
    /// The device has no path for this request, e.g. encrypted access on a
    /// chip without encryption support.
    NotSupported,
    /// The driver reported a failure it could not describe further.
    Device,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::NotAligned => "flash access not aligned",
            Error::OutOfBounds => "flash access out of bounds",
            Error::NotWritten => "flash region not written",
            Error::NotErased => "flash region not erased",
            Error::NotSupported => "flash operation not supported",
            Error::Device => "flash device failure",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Geometry of a flash device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashInfo {
    /// Minimum erase granularity, in bytes.
    pub sector_size: usize,
    /// Total size of the device, in bytes.
    pub total_size: usize,
}

/// Read only interface into flash.
pub trait ReadFlash {
    /// What is the read size (alignment and size multiple).
    fn read_size(&self) -> usize;
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
    fn capacity(&self) -> usize;

    /// Read through the decrypting path.  Devices without flash encryption
    /// don't have one.
    fn read_encrypted(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        let _ = (offset, bytes);
        Err(Error::NotSupported)
    }
}

/// Flash that can be written to.
pub trait Flash: ReadFlash {
    /// Write size (alignment and size multiple).
    fn write_size(&self) -> usize;
    /// Erase size (alignment and size multiple).
    fn erase_size(&self) -> usize;

    fn erase(&mut self, from: usize, to: usize) -> Result<()>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Write through the encrypting path.
    fn write_encrypted(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let _ = (offset, bytes);
        Err(Error::NotSupported)
    }

    fn info(&self) -> FlashInfo {
        FlashInfo {
            sector_size: self.erase_size(),
            total_size: self.capacity(),
        }
    }
}

impl<T: ReadFlash + ?Sized> ReadFlash for &mut T {
    fn read_size(&self) -> usize {
        (**self).read_size()
    }
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        (**self).read(offset, bytes)
    }
    fn capacity(&self) -> usize {
        (**self).capacity()
    }
    fn read_encrypted(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()> {
        (**self).read_encrypted(offset, bytes)
    }
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn write_size(&self) -> usize {
        (**self).write_size()
    }
    fn erase_size(&self) -> usize {
        (**self).erase_size()
    }
    fn erase(&mut self, from: usize, to: usize) -> Result<()> {
        (**self).erase(from, to)
    }
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        (**self).write(offset, bytes)
    }
    fn write_encrypted(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        (**self).write_encrypted(offset, bytes)
    }
}

// Utilities taken from embedded-storage for validating arguments.
pub fn check_read<T: ReadFlash + ?Sized>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.read_size(), offset, length)
}

pub fn check_erase<T: Flash + ?Sized>(flash: &T, from: usize, to: usize) -> Result<()> {
    if from > to || to > flash.capacity() {
        return Err(Error::OutOfBounds);
    }
    if from % flash.erase_size() != 0 || to % flash.erase_size() != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

pub fn check_write<T: Flash + ?Sized>(flash: &T, offset: usize, length: usize) -> Result<()> {
    check_slice(flash, flash.write_size(), offset, length)
}

pub fn check_slice<T: ReadFlash + ?Sized>(
    flash: &T,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if length > flash.capacity() || offset > flash.capacity() - length {
        return Err(Error::OutOfBounds);
    }
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

/// Do the half-open ranges `[a_start, a_end)` and `[b_start, b_end)` share
/// any byte.
pub fn regions_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Geometry {
        capacity: usize,
    }

    impl ReadFlash for Geometry {
        fn read_size(&self) -> usize {
            1
        }
        fn read(&mut self, _offset: usize, _bytes: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn capacity(&self) -> usize {
            self.capacity
        }
    }

    impl Flash for Geometry {
        fn write_size(&self) -> usize {
            4
        }
        fn erase_size(&self) -> usize {
            4096
        }
        fn erase(&mut self, _from: usize, _to: usize) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, _offset: usize, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn checks() {
        let g = Geometry { capacity: 0x10000 };
        assert_eq!(check_read(&g, 0xffff, 1), Ok(()));
        assert_eq!(check_read(&g, 0xffff, 2), Err(Error::OutOfBounds));
        assert_eq!(check_read(&g, usize::MAX, 2), Err(Error::OutOfBounds));
        assert_eq!(check_write(&g, 2, 4), Err(Error::NotAligned));
        assert_eq!(check_write(&g, 4, 8), Ok(()));
        assert_eq!(check_erase(&g, 0, 4096), Ok(()));
        assert_eq!(check_erase(&g, 0, 100), Err(Error::NotAligned));
        assert_eq!(check_erase(&g, 4096, 0), Err(Error::OutOfBounds));
        assert_eq!(check_erase(&g, 0, 0x11000), Err(Error::OutOfBounds));
    }

    #[test]
    fn info_and_encryption_defaults() {
        let mut g = Geometry { capacity: 0x10000 };
        assert_eq!(
            g.info(),
            FlashInfo {
                sector_size: 4096,
                total_size: 0x10000
            }
        );
        let mut buf = [0u8; 4];
        assert_eq!(g.read_encrypted(0, &mut buf), Err(Error::NotSupported));
        assert_eq!(g.write_encrypted(0, &buf), Err(Error::NotSupported));
    }

    #[test]
    fn overlap() {
        assert!(regions_overlap(0, 10, 5, 15));
        assert!(regions_overlap(5, 15, 0, 10));
        assert!(regions_overlap(0, 10, 2, 3));
        assert!(!regions_overlap(0, 10, 10, 20));
        assert!(!regions_overlap(10, 20, 0, 10));
    }
}
