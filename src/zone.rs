//! # Zone
//!
//! One physical zone of the device: the write pointer, remaining
//! capacity, lifetime hints, and the back-references (`ZoneExtentInfo`)
//! to every extent that has been written into it. Zones are shared as
//! `Arc<Zone>` between the pool, files, and extents; all mutable state
//! sits behind locks so the `Arc` graph stays cycle-free (extent infos
//! reference their owning file by `file_id`, never by pointer).
//!
//! ## Locking
//!
//! Three locks with distinct jobs:
//!
//! - `append_lock`: at most one in-flight device append per zone; held
//!   for the duration of the device call. The write pointer only moves
//!   under this lock (or under `reset`, which takes it too).
//! - `del_lock`: serialises `reset` against positioned reads still
//!   copying bytes out of the zone.
//! - `state`: short critical sections over capacity, flags, and the
//!   extent-info list.
//!
//! `used_capacity` is an atomic counter so extent invalidation from file
//! deletion paths never contends with the state mutex.
//!
//! ## Invariants
//!
//! - Writes land only at the write pointer, which grows monotonically
//!   until the zone is finished or reset.
//! - A zone is *empty* iff `write_pointer == start`, *full* iff
//!   `remaining_capacity == 0`, *used* iff any extent info is valid.
//! - `used_capacity` equals the summed length of valid extent infos.
//! - Invalidation flips `valid` exactly once; a second invalidation of
//!   the same extent asserts in debug builds and is logged in release.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};

use crate::device::{ZoneBlockDevice, ZoneInfo};
use crate::error::ZoneFsError;

/// Ordinal estimate of how long written data will live; used to co-locate
/// data expected to die together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteLifetimeHint {
    #[default]
    NotSet,
    Short,
    Medium,
    Long,
    Extreme,
}

impl WriteLifetimeHint {
    /// Stable integral code used in metadata records and the
    /// secondary-lifetime weighting.
    pub fn code(self) -> u8 {
        match self {
            WriteLifetimeHint::NotSet => 0,
            WriteLifetimeHint::Short => 1,
            WriteLifetimeHint::Medium => 2,
            WriteLifetimeHint::Long => 3,
            WriteLifetimeHint::Extreme => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => WriteLifetimeHint::NotSet,
            1 => WriteLifetimeHint::Short,
            2 => WriteLifetimeHint::Medium,
            3 => WriteLifetimeHint::Long,
            4 => WriteLifetimeHint::Extreme,
            other => {
                return Err(
                    ZoneFsError::Corruption(format!("unknown lifetime code {other}")).into(),
                )
            }
        })
    }
}

/// Zone-side record of one extent living in this zone. Points back at the
/// owning file by id; the file registry resolves it when zone cleaning
/// needs to migrate the extent.
#[derive(Debug, Clone)]
pub struct ZoneExtentInfo {
    pub start: u64,
    pub length: u64,
    pub valid: bool,
    pub file_id: u64,
    pub filename: String,
    pub lifetime: WriteLifetimeHint,
    pub level: i32,
}

struct ZoneState {
    write_pointer: u64,
    remaining_capacity: u64,
    open_for_write: bool,
    lifetime: WriteLifetimeHint,
    /// Length-weighted sum/weight of lifetime codes written to the zone.
    secondary_sum: f64,
    secondary_weight: u64,
    extent_infos: Vec<ZoneExtentInfo>,
}

/// One physical zone.
pub struct Zone {
    id: u32,
    start: u64,
    max_capacity: u64,
    device: Arc<dyn ZoneBlockDevice>,
    state: Mutex<ZoneState>,
    used_capacity: AtomicU64,
    append_lock: Mutex<()>,
    del_lock: Mutex<()>,
}

impl Zone {
    pub fn new(device: Arc<dyn ZoneBlockDevice>, info: &ZoneInfo, id: u32) -> Self {
        Self {
            id,
            start: info.start,
            max_capacity: info.max_capacity,
            device,
            state: Mutex::new(ZoneState {
                write_pointer: info.write_pointer,
                remaining_capacity: info.max_capacity - (info.write_pointer - info.start),
                open_for_write: false,
                lifetime: WriteLifetimeHint::NotSet,
                secondary_sum: 0.0,
                secondary_weight: 0,
                extent_infos: Vec::new(),
            }),
            used_capacity: AtomicU64::new(0),
            append_lock: Mutex::new(()),
            del_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    pub fn write_pointer(&self) -> u64 {
        self.state.lock().write_pointer
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.state.lock().remaining_capacity
    }

    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.remaining_capacity() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.write_pointer() == self.start
    }

    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.state.lock().lifetime
    }

    pub fn set_lifetime(&self, lifetime: WriteLifetimeHint) {
        self.state.lock().lifetime = lifetime;
    }

    pub fn open_for_write(&self) -> bool {
        self.state.lock().open_for_write
    }

    pub fn set_open_for_write(&self, open: bool) {
        self.state.lock().open_for_write = open;
    }

    /// Bytes written into the zone that no longer belong to any valid
    /// extent, measured against full capacity the way the zone cleaner
    /// ranks victims.
    pub fn invalid_bytes(&self) -> u64 {
        self.max_capacity.saturating_sub(self.used_capacity())
    }

    /// Length-weighted mean lifetime code of the data migrated into this
    /// zone. Falls back to the primary hint's code while no weighted
    /// samples exist.
    pub fn secondary_lifetime(&self) -> f64 {
        let state = self.state.lock();
        if state.secondary_weight == 0 {
            f64::from(state.lifetime.code())
        } else {
            state.secondary_sum / state.secondary_weight as f64
        }
    }

    /// Folds `length` bytes of `lifetime` data into the weighted mean.
    /// The weighting (arithmetic mean over byte-weights of the integral
    /// codes) is part of the on-going allocation contract and must stay
    /// stable across versions.
    pub fn update_secondary_lifetime(&self, lifetime: WriteLifetimeHint, length: u64) {
        let mut state = self.state.lock();
        state.secondary_sum += f64::from(lifetime.code()) * length as f64;
        state.secondary_weight += length;
    }

    /// Appends a block-aligned buffer at the write pointer. Returns the
    /// device offset the data landed at. Fails with no-space, leaving the
    /// zone unchanged, when the buffer exceeds remaining capacity.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        let block = self.device.block_size();
        ensure!(
            buf.len() as u64 % block == 0,
            ZoneFsError::InvalidArgument(format!(
                "append of {} bytes to zone {} is not block-aligned",
                buf.len(),
                self.id
            ))
        );

        let _appending = self.append_lock.lock();

        {
            let state = self.state.lock();
            if buf.len() as u64 > state.remaining_capacity {
                return Err(ZoneFsError::NoSpace.into());
            }
        }

        let offset = self
            .device
            .append(self.start, buf)
            .wrap_err_with(|| format!("append to zone {} failed", self.id))?;

        let mut state = self.state.lock();
        debug_assert_eq!(offset, state.write_pointer);
        state.write_pointer += buf.len() as u64;
        state.remaining_capacity -= buf.len() as u64;
        Ok(offset)
    }

    /// Registers an extent written into this zone and accounts its length
    /// as used capacity.
    pub fn push_extent_info(&self, info: ZoneExtentInfo) {
        debug_assert!(info.start >= self.start && info.start + info.length <= self.start + self.max_capacity);
        self.used_capacity.fetch_add(info.length, Ordering::AcqRel);
        self.state.lock().extent_infos.push(info);
    }

    /// Marks the extent at `start` invalid and releases its used
    /// capacity. Invalidating twice is a caller bug: it asserts in debug
    /// builds and is logged and ignored in release builds.
    pub fn invalidate(&self, start: u64, length: u64) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(info) = state
            .extent_infos
            .iter_mut()
            .find(|i| i.valid && i.start == start && i.length == length)
        {
            info.valid = false;
            self.used_capacity.fetch_sub(length, Ordering::AcqRel);
            return Ok(());
        }

        if state
            .extent_infos
            .iter()
            .any(|i| !i.valid && i.start == start && i.length == length)
        {
            debug_assert!(false, "double invalidation of extent at {start} in zone {}", self.id);
            log::warn!(
                "ignoring double invalidation of extent at {start} in zone {}",
                self.id
            );
            return Ok(());
        }

        Err(ZoneFsError::Corruption(format!(
            "no extent at {start}+{length} registered in zone {}",
            self.id
        ))
        .into())
    }

    /// Snapshot of the still-valid extent infos, for zone cleaning.
    pub fn valid_extents(&self) -> Vec<ZoneExtentInfo> {
        self.state
            .lock()
            .extent_infos
            .iter()
            .filter(|i| i.valid)
            .cloned()
            .collect()
    }

    /// Guard serialising this zone's reset against in-flight reads.
    pub fn read_guard(&self) -> MutexGuard<'_, ()> {
        self.del_lock.lock()
    }

    /// Resets the zone: requires every extent info to be invalid, rewinds
    /// the device write pointer, and clears all zone-side state.
    pub fn reset(&self) -> Result<()> {
        let _appending = self.append_lock.lock();
        let _deleting = self.del_lock.lock();

        {
            let state = self.state.lock();
            ensure!(
                state.extent_infos.iter().all(|i| !i.valid),
                "reset of zone {} with valid extents",
                self.id
            );
        }

        self.device
            .reset(self.start)
            .wrap_err_with(|| format!("reset of zone {} failed", self.id))?;

        let mut state = self.state.lock();
        state.write_pointer = self.start;
        state.remaining_capacity = self.max_capacity;
        state.open_for_write = false;
        state.lifetime = WriteLifetimeHint::NotSet;
        state.secondary_sum = 0.0;
        state.secondary_weight = 0;
        state.extent_infos.clear();
        self.used_capacity.store(0, Ordering::Release);
        Ok(())
    }

    /// Finishes the zone: the write pointer jumps to the end and the zone
    /// stops accepting appends until reset.
    pub fn finish(&self) -> Result<()> {
        let _appending = self.append_lock.lock();
        self.device
            .finish(self.start)
            .wrap_err_with(|| format!("finish of zone {} failed", self.id))?;

        let mut state = self.state.lock();
        state.write_pointer = self.start + self.max_capacity;
        state.remaining_capacity = 0;
        state.open_for_write = false;
        Ok(())
    }

    /// Explicit device-level close of an open zone.
    pub fn close(&self) -> Result<()> {
        self.device
            .close(self.start)
            .wrap_err_with(|| format!("close of zone {} failed", self.id))
    }

    /// Relinquishes the zone after a writer is done with it. Returns true
    /// when the zone is full (the caller notifies the pool accordingly).
    pub fn close_wr(&self) -> Result<bool> {
        let full = {
            let mut state = self.state.lock();
            state.open_for_write = false;
            state.remaining_capacity == 0
        };
        if !full {
            self.close()?;
        }
        Ok(full)
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("write_pointer", &self.write_pointer())
            .field("remaining", &self.remaining_capacity())
            .field("used", &self.used_capacity())
            .finish()
    }
}
