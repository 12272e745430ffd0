//! Byte views of on-flash structures.
//!
//! The partition table, OTA state records and image headers are all laid out
//! as `repr(C)` structures made of plain integers and byte arrays.  `AsRaw`
//! gives a read-only view of such a structure as its bytes, so it can be
//! hashed or written to flash.  `AsMutRaw` gives a mutable view, so flash can
//! be read directly into a typed header without an intermediate buffer.
//!
//! The views use the native byte order.  The on-flash formats are little
//! endian, so callers are expected to only build these views on little-endian
//! targets.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::{mem, slice};

pub trait AsRaw: Sized {
    /// Size of the raw representation, including any padding.
    const RAW_SIZE: usize = mem::size_of::<Self>();

    fn as_raw(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const _ as *const u8, Self::RAW_SIZE) }
    }
}

/// Mutable byte view of a structure.
///
/// # Safety
///
/// Implementors must be `repr(C)` and every bit pattern must be a valid value
/// for every field.  Integers and arrays of integers are fine; `bool`, enums
/// and references are not.
pub unsafe trait AsMutRaw: AsRaw {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self as *mut _ as *mut u8, Self::RAW_SIZE) }
    }

    /// Decode a value from the start of `bytes`.  Returns `None` if there are
    /// not enough bytes.
    fn from_raw(bytes: &[u8]) -> Option<Self>
    where
        Self: Default,
    {
        let mut value = Self::default();
        let raw = value.as_mut_raw();
        raw.copy_from_slice(bytes.get(..raw.len())?);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Eq, PartialEq)]
    #[repr(C)]
    struct Entry {
        magic: u16,
        kind: u8,
        subtype: u8,
        offset: u32,
        label: [u8; 4],
    }

    impl AsRaw for Entry {}
    unsafe impl AsMutRaw for Entry {}

    #[test]
    fn raw_size_has_no_padding() {
        assert_eq!(Entry::RAW_SIZE, 12);
    }

    #[test]
    fn as_raw() {
        let e = Entry {
            magic: 0x50aa,
            kind: 1,
            subtype: 0x10,
            offset: 0x0001_2000,
            label: *b"ota0",
        };
        let raw = e.as_raw();
        assert_eq!(raw.len(), 12);
        assert_eq!(raw[2], 1);
        assert_eq!(raw[3], 0x10);
        assert_eq!(&raw[8..12], b"ota0");
        if cfg!(target_endian = "little") {
            assert_eq!(&raw[0..2], &[0xaa, 0x50]);
            assert_eq!(&raw[4..8], &[0x00, 0x20, 0x01, 0x00]);
        }
    }

    #[test]
    fn as_mut_raw() {
        let mut e = Entry::default();
        e.as_mut_raw()[8..12].copy_from_slice(b"test");
        e.as_mut_raw()[3] = 0x20;
        assert_eq!(e.label, *b"test");
        assert_eq!(e.subtype, 0x20);
    }

    #[test]
    fn from_raw() {
        let bytes = [0xffu8; 16];
        let e = Entry::from_raw(&bytes).unwrap();
        assert_eq!(e.magic, 0xffff);
        assert_eq!(e.offset, 0xffff_ffff);
        assert_eq!(e.label, [0xff; 4]);

        assert!(Entry::from_raw(&bytes[..11]).is_none());
    }
}
