//! Partition registry
//!
//! The registry loads the partition table the first time anything asks for a
//! partition, and keeps it for the life of the process.  Loading is
//! check-lock-check: the `loaded` flag is tested without the lock, and tested
//! again once the lock is held, so concurrent first callers read the table
//! exactly once between them.  A failed load leaves the flag clear, and the
//! next caller tries again.
//!
//! Partitions on other chips can be added at runtime.  They are appended
//! after the table entries and show up in lookups in registration order.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info};
use storage::ReadFlash;

use crate::{
    table::{self, Label, Origin, MAX_PARTITIONS},
    BootConfig, ChipId, Error, Partition, PartitionKind, PartitionTable, Position, Result, Subtype,
};

/// How many partitions can be registered at runtime.
pub const MAX_EXTERNAL: usize = 8;

/// Identifies a registered partition.  Handles are never reused, and grow
/// in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionHandle(u32);

struct Inner {
    table: heapless::Vec<Partition, MAX_PARTITIONS>,
    external: heapless::Vec<Partition, MAX_EXTERNAL>,
    next_handle: u32,
}

impl Inner {
    fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.table.iter().chain(self.external.iter())
    }
}

pub struct Registry {
    config: BootConfig,
    loaded: AtomicBool,
    inner: spin::Mutex<Inner>,
}

impl Registry {
    pub const fn new(config: BootConfig) -> Registry {
        Registry {
            config,
            loaded: AtomicBool::new(false),
            inner: spin::Mutex::new(Inner {
                table: heapless::Vec::new(),
                external: heapless::Vec::new(),
                next_handle: 0,
            }),
        }
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Load the partition table from `flash`, unless that has already
    /// happened.
    pub fn ensure_loaded<F: ReadFlash + ?Sized>(&self, flash: &mut F) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if self.is_loaded() {
            // Someone else got there while we waited for the lock.
            return Ok(());
        }

        debug!("Loading partition table at 0x{:x}", self.config.table_offset);
        let table = PartitionTable::load(flash, &self.config).map_err(|e| {
            error!("Unable to load partition table: {}", e);
            e
        })?;
        table.dump();
        inner.table = table.into_entries();
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Iterate over the partitions matching `kind`, `subtype` (or
    /// `Subtype::ANY`) and, when given, `label`.  Table entries come first,
    /// in table order, then registered partitions.
    pub fn find<'r, 'l, F: ReadFlash + ?Sized>(
        &'r self,
        flash: &mut F,
        kind: PartitionKind,
        subtype: Subtype,
        label: Option<&'l str>,
    ) -> Result<PartitionIter<'r, 'l>> {
        self.ensure_loaded(flash)?;
        Ok(self.iter(kind, subtype, label))
    }

    /// The first partition `find` would return.
    pub fn find_first<F: ReadFlash + ?Sized>(
        &self,
        flash: &mut F,
        kind: PartitionKind,
        subtype: Subtype,
        label: Option<&str>,
    ) -> Result<Option<Partition>> {
        Ok(self.find(flash, kind, subtype, label)?.next())
    }

    fn iter<'l>(&self, kind: PartitionKind, subtype: Subtype, label: Option<&'l str>) -> PartitionIter<'_, 'l> {
        PartitionIter {
            registry: self,
            kind,
            subtype,
            label,
            pos: 0,
            last: None,
        }
    }

    /// Check that a descriptor still names a known partition, returning the
    /// registry's copy.  An empty label in `part` matches any label.
    /// Nothing is known before the table is loaded.
    pub fn verify(&self, part: &Partition) -> Option<Partition> {
        let inner = self.inner.lock();
        let found = inner
            .iter()
            .find(|p| {
                p.chip == part.chip
                    && p.kind == part.kind
                    && p.subtype == part.subtype
                    && p.position == part.position
                    && p.encrypted == part.encrypted
                    && (part.label.is_empty() || p.label == part.label)
            })
            .cloned();
        found
    }

    /// Register a partition on another chip, or on an area of the boot chip
    /// the table doesn't describe.  `device` is the flash of that chip, and
    /// is only used for its capacity.  The returned descriptor carries the
    /// handle needed to deregister it.
    pub fn register_external<F: ReadFlash + ?Sized, D: ReadFlash + ?Sized>(
        &self,
        flash: &mut F,
        (chip, device): (ChipId, &D),
        position: Position,
        label: &str,
        kind: PartitionKind,
        subtype: Subtype,
    ) -> Result<Partition> {
        let mut name = Label::new();
        name.push_str(label).map_err(|_| Error::InvalidArgument)?;
        if !label.is_ascii() {
            return Err(Error::InvalidArgument);
        }
        if position.size == 0 || position.offset as u64 + position.size as u64 > device.capacity() as u64 {
            return Err(Error::InvalidSize);
        }

        self.ensure_loaded(flash)?;

        let mut inner = self.inner.lock();
        let overlap = inner.iter().any(|p| {
            p.chip == chip
                && storage::regions_overlap(
                    p.position.offset as usize,
                    p.position.end(),
                    position.offset as usize,
                    position.end(),
                )
        });
        if overlap {
            return Err(Error::Overlap);
        }

        let handle = PartitionHandle(inner.next_handle);
        let next_handle = inner.next_handle.checked_add(1).ok_or(Error::NoSpace)?;
        let part = Partition {
            chip,
            kind,
            subtype,
            position,
            label: name,
            encrypted: false,
            origin: Origin::External(handle),
        };
        inner.external.push(part.clone()).map_err(|_| Error::NoSpace)?;
        inner.next_handle = next_handle;

        info!(
            "Registered {} on chip {} at 0x{:x} (0x{:x} bytes)",
            label, chip.0, position.offset, position.size
        );
        Ok(part)
    }

    /// Remove a partition added with `register_external`.  Partitions from
    /// the table can't be removed.
    pub fn deregister(&self, part: &Partition) -> Result<()> {
        let handle = match part.origin {
            Origin::Table => return Err(Error::InvalidArgument),
            Origin::External(handle) => handle,
        };

        let mut inner = self.inner.lock();
        let index = inner
            .external
            .iter()
            .position(|p| p.origin == Origin::External(handle))
            .ok_or(Error::NotFound)?;
        inner.external[index..].rotate_left(1);
        inner.external.pop();
        Ok(())
    }

    /// Log everything the registry knows about.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        table::dump(inner.iter());
    }
}

/// Lookup cursor.  The registry lock is only held while stepping, so
/// partitions registered during a traversal may or may not be seen.
/// Registered partitions are tracked by handle, so removing one behind the
/// cursor doesn't make it skip the next.
pub struct PartitionIter<'r, 'l> {
    registry: &'r Registry,
    kind: PartitionKind,
    subtype: Subtype,
    label: Option<&'l str>,
    /// Next table entry.
    pos: usize,
    /// Last registered partition stepped over.
    last: Option<PartitionHandle>,
}

impl<'r, 'l> Iterator for PartitionIter<'r, 'l> {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let inner = self.registry.inner.lock();
        while let Some(part) = inner.table.get(self.pos) {
            self.pos += 1;
            if part.matches(self.kind, self.subtype, self.label) {
                return Some(part.clone());
            }
        }

        for part in inner.external.iter() {
            let handle = match part.origin {
                Origin::External(handle) => handle,
                Origin::Table => continue,
            };
            if self.last.map_or(false, |last| handle <= last) {
                continue;
            }
            self.last = Some(handle);
            if part.matches(self.kind, self.subtype, self.label) {
                return Some(part.clone());
            }
        }
        None
    }
}
