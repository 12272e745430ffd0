//! The boot sequence.

use log::{error, info, warn};
use storage::Flash;

use crate::{
    decision::{decide_boot, Selection},
    image::{Image, LoadedImage},
    ota::{Lifecycle, OtaData, Snapshot},
    platform::Platform,
    state::BootloaderState,
    BootConfig, Error, PartitionKind, Registry, Result, Subtype,
};

/// Run the second stage boot: select an image, load it and jump to it.  The
/// flash is owned for the whole sequence, and closed just before the jump.
/// Any failure halts the platform.
pub fn boot<F: Flash, P: Platform>(config: BootConfig, mut flash: F, platform: &mut P) -> ! {
    info!("Second stage bootloader");
    let registry = Registry::new(config);
    match prepare(&registry, &mut flash, platform) {
        Ok(image) => image.launch(flash, platform),
        Err(e) => {
            error!("Unable to boot: {}", e);
            platform.halt()
        }
    }
}

/// Everything `boot` does short of the jump.  The partition table and the
/// slot summary only live until the decision is made.
pub fn prepare<F: Flash + ?Sized, P: Platform>(
    registry: &Registry,
    flash: &mut F,
    platform: &mut P,
) -> Result<LoadedImage> {
    registry.ensure_loaded(flash)?;
    let bs = BootloaderState::from_registry(registry, flash)?;

    let ota = match registry.find_first(flash, PartitionKind::Data, Subtype::DATA_OTA, None)? {
        Some(part) => Some(OtaData::new(part)?),
        None => None,
    };
    let snapshot = match &ota {
        Some(ota) => match ota.read(flash) {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!("OTA state unusable: {}", e);
                None
            }
        },
        None => None,
    };

    let mut selection = decide_boot(&bs, snapshot.as_ref().map(|s| &s.state))?;
    if let (Some(next), Some(ota), Some(snap)) = (selection.transition, &ota, &snapshot) {
        if let Err(e) = record(flash, ota, snap, next) {
            error!("Unable to record {:?}: {}", next, e);
            if next == Lifecycle::PendingVerify {
                // A new image only runs once PendingVerify is on flash.
                selection = rejected(&bs, snap)?;
            }
        }
    }

    let partition = registry
        .find_first(flash, PartitionKind::App, selection.subtype, None)?
        .ok_or(Error::NotFound)?;
    let image = Image::from_partition(flash, &partition)?;
    image.load(flash, platform)
}

fn record<F: Flash + ?Sized>(flash: &mut F, ota: &OtaData, snap: &Snapshot, lifecycle: Lifecycle) -> Result<()> {
    let mut state = snap.state.clone();
    state.lifecycle = lifecycle;
    ota.write(flash, Some(snap), &state)?;
    Ok(())
}

/// The decision if the new image were already rejected.
fn rejected(bs: &BootloaderState, snap: &Snapshot) -> Result<Selection> {
    let mut state = snap.state.clone();
    state.lifecycle = Lifecycle::Invalid;
    decide_boot(bs, Some(&state))
}
