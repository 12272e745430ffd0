//! Bootable slot summary.

use core::borrow::Borrow;

use log::warn;
use storage::ReadFlash;

use crate::{Partition, PartitionKind, Position, Registry, Result, Subtype};

/// Number of OTA application slots a table can describe.
pub const MAX_OTA_SLOTS: usize = 16;

/// Where the partitions that matter to the boot decision are.  Built fresh
/// for each boot from the partition list; only the first partition of each
/// role counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootloaderState {
    pub ota_info: Option<Position>,
    pub factory: Option<Position>,
    pub test: Option<Position>,
    pub ota: [Option<Position>; MAX_OTA_SLOTS],
    /// Number of OTA slots present.
    pub app_count: usize,
}

impl BootloaderState {
    pub fn scan<P: Borrow<Partition>>(parts: impl IntoIterator<Item = P>) -> BootloaderState {
        let mut state = BootloaderState::default();
        for part in parts {
            let part = part.borrow();
            let slot = match (part.kind, part.subtype) {
                (PartitionKind::Data, Subtype::DATA_OTA) => &mut state.ota_info,
                (PartitionKind::App, Subtype::FACTORY) => &mut state.factory,
                (PartitionKind::App, Subtype::TEST) => &mut state.test,
                (PartitionKind::App, s) => match s.ota_slot() {
                    Some(n) => {
                        if state.ota[n].is_none() {
                            state.app_count += 1;
                        }
                        &mut state.ota[n]
                    }
                    None => continue,
                },
                _ => continue,
            };
            if slot.is_some() {
                warn!("Ignoring duplicate partition {}", part.label.as_str());
                continue;
            }
            *slot = Some(part.position);
        }
        state
    }

    /// Scan everything the registry knows about, loading the table if
    /// needed.
    pub fn from_registry<F: ReadFlash + ?Sized>(registry: &Registry, flash: &mut F) -> Result<BootloaderState> {
        let apps = registry.find(flash, PartitionKind::App, Subtype::ANY, None)?;
        let data = registry.find(flash, PartitionKind::Data, Subtype::DATA_OTA, None)?;
        Ok(BootloaderState::scan(data.chain(apps)))
    }

    /// Position of the application partition of the given subtype.
    pub fn slot(&self, subtype: Subtype) -> Option<Position> {
        match subtype {
            Subtype::FACTORY => self.factory,
            Subtype::TEST => self.test,
            s => s.ota_slot().and_then(|n| self.ota[n]),
        }
    }
}
