//! OTA state
//!
//! The OTA data partition holds two copies of a small record, one at the
//! start of each of its first two sectors.  Each copy carries a sequence
//! number and an MD5 checksum over its contents.  The valid copy with the
//! older sequence number is the current state; ties go to the first copy.
//! Sequence numbers wrap, so "older" is decided with serial number
//! arithmetic: `a` is older than `b` when `b - a`, modulo 2^32, is less
//! than 2^31.
//!
//! A new state is written to the sector that does not hold the current one,
//! with the next sequence number.  Once that copy is complete, the sector
//! that held the old state is erased.  That erase is the commit point:
//!
//! - Losing power while writing the new copy leaves it invalid, and the old
//!   copy is still read back.
//! - Losing power after the new copy is written, but before the old one is
//!   gone, leaves two valid copies.  The old one has the older sequence and
//!   wins, so the update is lost, but the device is in its previous, known
//!   good, state.
//! - After the erase only the new copy remains.
//!
//! No interruption can make both copies invalid at once.

use asraw::{AsMutRaw, AsRaw};
use log::{error, info, warn};
use md5::{Digest, Md5};
use storage::Flash;

use crate::{state::BootloaderState, Error, Partition, PartitionKind, Registry, Result, Subtype};

/// A sequence number never written by this code: erased flash reads as this.
pub const SEQUENCE_SENTINEL: u32 = u32::MAX;

pub const UPDATE_DATA_MAX: usize = 64;

pub const RECORD_VERSION: u8 = 1;

/// Widest flash write unit a record can be written with.
pub const MAX_WRITE_SIZE: usize = 512;

/// Where an image is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Just written by the updater, not booted yet.
    New,
    /// Booted once and waiting for the application to confirm itself.
    PendingVerify,
    /// Confirmed by the application.
    Valid,
    /// Rejected by the application.
    Invalid,
    /// Booted, but never confirmed before the next reset.
    Aborted,
    Undefined,
}

impl Lifecycle {
    pub const fn to_raw(self) -> u32 {
        match self {
            Lifecycle::New => 0,
            Lifecycle::PendingVerify => 1,
            Lifecycle::Valid => 2,
            Lifecycle::Invalid => 3,
            Lifecycle::Aborted => 4,
            Lifecycle::Undefined => 0xffff_ffff,
        }
    }

    /// Decode a stored value.  Unknown codes read as `Undefined`.
    pub const fn from_raw(raw: u32) -> Lifecycle {
        match raw {
            0 => Lifecycle::New,
            1 => Lifecycle::PendingVerify,
            2 => Lifecycle::Valid,
            3 => Lifecycle::Invalid,
            4 => Lifecycle::Aborted,
            _ => Lifecycle::Undefined,
        }
    }
}

/// The decoded OTA state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaState {
    pub sequence: u32,
    /// The last image known to work.
    pub stable_index: Subtype,
    /// The image most recently written by the updater.
    pub uploader_index: Subtype,
    pub lifecycle: Lifecycle,
    /// Opaque to the bootloader.
    pub update_data: heapless::Vec<u8, UPDATE_DATA_MAX>,
}

impl OtaState {
    /// The state of a device that has never been updated.
    pub fn first() -> OtaState {
        OtaState {
            sequence: 0,
            stable_index: Subtype::FACTORY,
            uploader_index: Subtype::ANY,
            lifecycle: Lifecycle::Undefined,
            update_data: heapless::Vec::new(),
        }
    }
}

/// Hash the checksummed fields.  The record version is not covered.
fn digest(sequence: u32, stable: u8, uploader: u8, lifecycle: u32, data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update([stable]);
    hasher.update([uploader]);
    hasher.update(lifecycle.to_le_bytes());
    hasher.update((data.len() as u32).to_le_bytes());
    hasher.update(data);
    let mut result = [0u8; 16];
    result.copy_from_slice(hasher.finalize().as_slice());
    result
}

/// The checksum a record holding `state` carries.
pub fn compute_checksum(state: &OtaState) -> [u8; 16] {
    digest(
        state.sequence,
        state.stable_index.0,
        state.uploader_index.0,
        state.lifecycle.to_raw(),
        &state.update_data,
    )
}

/// One stored copy of the state.  This is intended to be interpreted as a C
/// struct.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct OtaRecord {
    sequence: u32,
    stable_index: u8,
    uploader_index: u8,
    version: u8,
    reserved: u8,
    lifecycle: u32,
    data_size: u32,
    update_data: [u8; UPDATE_DATA_MAX],
    checksum: [u8; 16],
}

impl AsRaw for OtaRecord {}
unsafe impl AsMutRaw for OtaRecord {}

/// An erased record.
impl Default for OtaRecord {
    fn default() -> Self {
        OtaRecord {
            sequence: SEQUENCE_SENTINEL,
            stable_index: 0xff,
            uploader_index: 0xff,
            version: 0xff,
            reserved: 0xff,
            lifecycle: 0xffff_ffff,
            data_size: 0xffff_ffff,
            update_data: [0xff; UPDATE_DATA_MAX],
            checksum: [0xff; 16],
        }
    }
}

impl OtaRecord {
    /// Encode a state, with its checksum.
    pub fn from_state(state: &OtaState) -> OtaRecord {
        let mut update_data = [0u8; UPDATE_DATA_MAX];
        update_data[..state.update_data.len()].copy_from_slice(&state.update_data);
        OtaRecord {
            sequence: state.sequence,
            stable_index: state.stable_index.0,
            uploader_index: state.uploader_index.0,
            version: RECORD_VERSION,
            reserved: 0,
            lifecycle: state.lifecycle.to_raw(),
            data_size: state.update_data.len() as u32,
            update_data,
            checksum: compute_checksum(state),
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.sequence == SEQUENCE_SENTINEL {
            return false;
        }
        if self.version != RECORD_VERSION {
            warn!("OTA record version {} not supported", self.version);
            return false;
        }
        let size = self.data_size as usize;
        if size > UPDATE_DATA_MAX {
            warn!("OTA record data size {} too large", size);
            return false;
        }
        let sum = digest(
            self.sequence,
            self.stable_index,
            self.uploader_index,
            self.lifecycle,
            &self.update_data[..size],
        );
        if sum != self.checksum {
            warn!("OTA record {} checksum mismatch", self.sequence);
            return false;
        }
        true
    }

    /// Decode.  Only meaningful for valid records.
    pub fn to_state(&self) -> OtaState {
        let size = (self.data_size as usize).min(UPDATE_DATA_MAX);
        let mut update_data = heapless::Vec::new();
        // Cannot fail: the length is capped at the capacity.
        let _ = update_data.extend_from_slice(&self.update_data[..size]);
        OtaState {
            sequence: self.sequence,
            stable_index: Subtype(self.stable_index),
            uploader_index: Subtype(self.uploader_index),
            lifecycle: Lifecycle::from_raw(self.lifecycle),
            update_data,
        }
    }
}

/// Which of the two copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    Slot0,
    Slot1,
}

impl SlotId {
    pub fn other(self) -> SlotId {
        match self {
            SlotId::Slot0 => SlotId::Slot1,
            SlotId::Slot1 => SlotId::Slot0,
        }
    }

    fn offset(self, sector: usize) -> usize {
        match self {
            SlotId::Slot0 => 0,
            SlotId::Slot1 => sector,
        }
    }
}

/// The current state, and the copy it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: OtaState,
    pub source: SlotId,
}

/// Access to the OTA data partition.
pub struct OtaData {
    partition: Partition,
}

fn next_sequence(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        SEQUENCE_SENTINEL => 0,
        n => n,
    }
}

/// Was sequence `a` written after `b`?
fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

impl OtaData {
    pub fn new(partition: Partition) -> Result<OtaData> {
        if partition.kind != PartitionKind::Data || partition.subtype != Subtype::DATA_OTA {
            return Err(Error::InvalidArgument);
        }
        Ok(OtaData { partition })
    }

    /// Locate the OTA data partition through the registry.
    pub fn find<F: Flash + ?Sized>(registry: &Registry, flash: &mut F) -> Result<OtaData> {
        match registry.find_first(flash, PartitionKind::Data, Subtype::DATA_OTA, None)? {
            Some(part) => OtaData::new(part),
            None => {
                error!("No OTA data partition");
                Err(Error::NotFound)
            }
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    fn sector<F: Flash + ?Sized>(&self, flash: &F) -> Result<usize> {
        let sector = flash.erase_size();
        if (self.partition.position.size as usize) < 2 * sector {
            error!("OTA data partition smaller than two sectors");
            return Err(Error::InvalidSize);
        }
        Ok(sector)
    }

    fn read_slot<F: Flash + ?Sized>(&self, flash: &mut F, slot: SlotId, sector: usize) -> Result<OtaRecord> {
        let mut record = OtaRecord::default();
        self.partition.read(flash, slot.offset(sector), record.as_mut_raw())?;
        Ok(record)
    }

    /// Read both copies and pick the current one.
    pub fn read<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Snapshot> {
        let sector = self.sector(flash)?;
        let r0 = self.read_slot(flash, SlotId::Slot0, sector)?;
        let r1 = self.read_slot(flash, SlotId::Slot1, sector)?;

        let (record, source) = match (r0.is_valid(), r1.is_valid()) {
            (true, true) if is_newer(r0.sequence, r1.sequence) => (r1, SlotId::Slot1),
            (true, _) => (r0, SlotId::Slot0),
            (false, true) => (r1, SlotId::Slot1),
            (false, false) => return Err(Error::NoValidState),
        };
        Ok(Snapshot {
            state: record.to_state(),
            source,
        })
    }

    /// Persist `state`.  `previous` is what `read` last returned, or `None`
    /// if there was no valid state.  The sequence number in `state` is
    /// replaced by the one following the last known value.
    pub fn write<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        previous: Option<&Snapshot>,
        state: &OtaState,
    ) -> Result<Snapshot> {
        let sector = self.sector(flash)?;
        let (target, sequence) = match previous {
            Some(prev) => (prev.source.other(), next_sequence(prev.state.sequence)),
            None => (SlotId::Slot0, next_sequence(state.sequence)),
        };
        let state = OtaState {
            sequence,
            ..state.clone()
        };
        let record = OtaRecord::from_state(&state);
        let raw = record.as_raw();

        let align = flash.write_size();
        if align > MAX_WRITE_SIZE {
            error!("Flash write size {} too large for OTA records", align);
            return Err(Error::NotSupported);
        }
        let (body, rest) = raw.split_at(raw.len() / align * align);
        let offset = target.offset(sector);

        self.partition.erase(flash, offset, sector)?;
        if !body.is_empty() {
            self.partition.write(flash, offset, body)?;
        }
        if !rest.is_empty() {
            let mut tail = [0xffu8; MAX_WRITE_SIZE];
            tail[..rest.len()].copy_from_slice(rest);
            self.partition.write(flash, offset + body.len(), &tail[..align])?;
        }

        // Commit.
        self.partition.erase(flash, target.other().offset(sector), sector)?;

        info!(
            "OTA state {}: stable {:02x} uploader {:02x} {:?}",
            state.sequence, state.stable_index.0, state.uploader_index.0, state.lifecycle
        );
        Ok(Snapshot { state, source: target })
    }

    /// Forget all OTA history.
    pub fn erase<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<()> {
        self.partition.erase_all(flash)
    }
}

/// The slot an update should be written to, given the stable image.
/// Updates alternate between the first two OTA slots, starting from slot 0
/// when the factory image, or nothing, is stable.
pub fn next_free_slot(current_stable: Subtype, bs: &BootloaderState) -> Result<Subtype> {
    let target = match current_stable {
        Subtype::FACTORY | Subtype::ANY => Subtype::OTA_0,
        Subtype::OTA_0 => Subtype::OTA_1,
        Subtype::OTA_1 => Subtype::OTA_0,
        other => {
            error!("No update slot after subtype {:02x}", other.0);
            return Err(Error::InvalidArgument);
        }
    };
    if bs.slot(target).is_none() {
        error!("OTA slot {:02x} not in the partition table", target.0);
        return Err(Error::SlotNotPresent);
    }
    Ok(target)
}

/// Read the state, or start from the never-updated one.
fn current<F: Flash + ?Sized>(ota: &OtaData, flash: &mut F) -> Result<Option<Snapshot>> {
    match ota.read(flash) {
        Ok(snap) => Ok(Some(snap)),
        Err(Error::NoValidState) => {
            warn!("No valid OTA state, starting from factory");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The partition the updater should write the next image into.
pub fn next_update_partition<F: Flash + ?Sized>(registry: &Registry, flash: &mut F) -> Result<Partition> {
    let ota = OtaData::find(registry, flash)?;
    let stable = current(&ota, flash)?
        .map(|s| s.state.stable_index)
        .unwrap_or(Subtype::FACTORY);
    let bs = BootloaderState::from_registry(registry, flash)?;
    let target = next_free_slot(stable, &bs)?;
    registry
        .find_first(flash, PartitionKind::App, target, None)?
        .ok_or(Error::SlotNotPresent)
}

/// Ask for `target` to be booted next.  An OTA slot is recorded as a new
/// image, to be verified on its first boot.  The factory partition is
/// selected by erasing all OTA history.
pub fn set_boot_partition<F: Flash + ?Sized>(registry: &Registry, flash: &mut F, target: &Partition) -> Result<()> {
    if target.kind != PartitionKind::App {
        return Err(Error::InvalidArgument);
    }
    if registry.verify(target).is_none() {
        error!("Boot partition {} is not known", target.label.as_str());
        return Err(Error::NotFound);
    }
    let ota = OtaData::find(registry, flash)?;

    if target.subtype == Subtype::FACTORY {
        info!("Selecting factory image");
        return ota.erase(flash);
    }
    if target.subtype.ota_slot().is_none() {
        error!("Partition {} is not an OTA slot", target.label.as_str());
        return Err(Error::InvalidArgument);
    }

    let previous = current(&ota, flash)?;
    let mut state = previous
        .as_ref()
        .map(|s| s.state.clone())
        .unwrap_or_else(OtaState::first);
    state.lifecycle = Lifecycle::New;
    state.uploader_index = target.subtype;
    ota.write(flash, previous.as_ref(), &state)?;
    Ok(())
}
