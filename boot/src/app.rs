//! Application side of the OTA protocol.
//!
//! A newly installed image is booted once in `PendingVerify`.  It must call
//! [`mark_current_valid`] before the next reset, or the bootloader goes back
//! to the stable image.

use core::convert::Infallible;

use log::{info, warn};
use storage::Flash;

use crate::{
    ota::{Lifecycle, OtaData},
    platform::Reset,
    Error, Registry, Result,
};

/// Lifecycle of the current image.  A device with no OTA history reports
/// `Undefined`.
pub fn get_state<F: Flash + ?Sized>(registry: &Registry, flash: &mut F) -> Result<Lifecycle> {
    let ota = OtaData::find(registry, flash)?;
    match ota.read(flash) {
        Ok(snap) => Ok(snap.state.lifecycle),
        Err(Error::NoValidState) => Ok(Lifecycle::Undefined),
        Err(e) => Err(e),
    }
}

/// Confirm the running image.  It becomes the stable image.
pub fn mark_current_valid<F: Flash + ?Sized>(registry: &Registry, flash: &mut F) -> Result<()> {
    let ota = OtaData::find(registry, flash)?;
    let snap = ota.read(flash)?;
    let mut state = snap.state.clone();
    match state.lifecycle {
        Lifecycle::Valid => return Ok(()),
        Lifecycle::PendingVerify | Lifecycle::New => state.stable_index = state.uploader_index,
        other => warn!("Marking valid from {:?}", other),
    }
    state.lifecycle = Lifecycle::Valid;
    ota.write(flash, Some(&snap), &state)?;
    info!("Image {:02x} marked valid", state.stable_index.0);
    Ok(())
}

/// Reject the running image and restart into the stable one.  Only returns
/// if the rejection could not be recorded.
pub fn mark_current_invalid_and_restart<F: Flash + ?Sized, R: Reset>(
    registry: &Registry,
    flash: &mut F,
    reset: &mut R,
) -> Result<Infallible> {
    let ota = OtaData::find(registry, flash)?;
    let snap = ota.read(flash)?;
    let mut state = snap.state.clone();
    state.lifecycle = Lifecycle::Invalid;
    ota.write(flash, Some(&snap), &state)?;
    warn!("Image {:02x} marked invalid, restarting", state.uploader_index.0);
    reset.reset()
}
