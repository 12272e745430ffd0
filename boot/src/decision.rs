//! Boot decision
//!
//! Pure function of the partition summary and the OTA state.  Every path ends
//! either in a partition that exists in the table or in `NoBootableImage`.
//! Whenever a request can't be honored, the decision falls back to something
//! less specific and says so in the log:
//!
//! 1. No OTA data partition: boot factory, or OTA slot 0 if there is no
//!    factory partition.
//! 2. No valid OTA state: as above.
//! 3. A new image: boot it once, and record that it is pending verification.
//! 4. Anything else: boot the stable image.  An image still pending
//!    verification is recorded as aborted first.
//!
//! A requested slot missing from the table falls through to the stable
//! image, and a missing stable slot to the first rule.

use log::{error, info, warn};

use crate::{
    ota::{Lifecycle, OtaState},
    state::BootloaderState,
    Error, Position, Result, Subtype,
};

/// Why a partition was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The table has no OTA data partition.
    NoOtaData,
    /// The OTA data partition holds no valid state.
    NoOtaState,
    /// The updater asked for this image.
    NewImage,
    /// The last image known to work.
    Stable,
    /// The slot named by the OTA state is not in the table.
    MissingSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub subtype: Subtype,
    pub position: Position,
    pub reason: Reason,
    /// Lifecycle to record before the selected image runs.
    pub transition: Option<Lifecycle>,
}

fn fallback(bs: &BootloaderState, reason: Reason, transition: Option<Lifecycle>) -> Result<Selection> {
    let (subtype, position) = if let Some(pos) = bs.factory {
        (Subtype::FACTORY, pos)
    } else if let Some(pos) = bs.ota[0] {
        (Subtype::OTA_0, pos)
    } else {
        error!("No factory or OTA 0 partition to boot");
        return Err(Error::NoBootableImage);
    };
    Ok(Selection {
        subtype,
        position,
        reason,
        transition,
    })
}

fn stable(bs: &BootloaderState, state: &OtaState, transition: Option<Lifecycle>) -> Result<Selection> {
    match bs.slot(state.stable_index) {
        Some(position) => Ok(Selection {
            subtype: state.stable_index,
            position,
            reason: Reason::Stable,
            transition,
        }),
        None => {
            warn!(
                "Stable image {:02x} not in the partition table",
                state.stable_index.0
            );
            fallback(bs, Reason::MissingSlot, transition)
        }
    }
}

/// Pick the partition to boot.
pub fn decide_boot(bs: &BootloaderState, ota: Option<&OtaState>) -> Result<Selection> {
    if bs.ota_info.is_none() {
        warn!("No OTA data partition, using fallback image");
        return fallback(bs, Reason::NoOtaData, None);
    }
    let Some(state) = ota else {
        warn!("No valid OTA state, using fallback image");
        return fallback(bs, Reason::NoOtaState, None);
    };

    let selection = match state.lifecycle {
        Lifecycle::New => match bs.slot(state.uploader_index) {
            Some(position) => Ok(Selection {
                subtype: state.uploader_index,
                position,
                reason: Reason::NewImage,
                transition: Some(Lifecycle::PendingVerify),
            }),
            None => {
                warn!(
                    "New image {:02x} not in the partition table",
                    state.uploader_index.0
                );
                stable(bs, state, None)
            }
        },
        Lifecycle::PendingVerify => {
            warn!(
                "Image {:02x} was not verified, rolling back",
                state.uploader_index.0
            );
            stable(bs, state, Some(Lifecycle::Aborted))
        }
        _ => stable(bs, state, None),
    }?;

    info!(
        "Selected partition {:02x} at 0x{:x} ({:?})",
        selection.subtype.0, selection.position.offset, selection.reason
    );
    Ok(selection)
}
