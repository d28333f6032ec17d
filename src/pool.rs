//! # ZonePool
//!
//! The mount context: owns every zone of the device, the file registry,
//! and the open/active zone accounting that keeps the pool inside the
//! device's quota. Zones at the front of the device belong to the
//! metadata journal; the rest are I/O zones handed out by the allocator.
//!
//! ## Allocation policy
//!
//! `allocate_zone` first passes admission control (a condvar wait for an
//! open-zone slot, bounded by `allocation_wait`), then walks a fixed
//! preference ladder over the allocatable zones:
//!
//! 1. key locality: a zone already holding an SST whose key range
//!    touches the requester's, at the same LSM level
//! 2. a partially-written zone with matching lifetime hint holding data
//!    of the same level
//! 3. for level-0 files, the zone already holding the most level-0
//!    files (ties to the smaller zone id)
//! 4. any partially-written zone with a matching lifetime hint, closest
//!    first by secondary lifetime
//! 5. a fresh empty zone (consumes an active-zone slot)
//!
//! Within a rung, ties go to the zone with the smallest non-zero
//! remaining capacity, then the smaller zone id, so allocation is
//! deterministic for a given pool state. When the ladder comes up empty
//! the allocator wakes the zone cleaner and surfaces a typed no-space
//! error; the caller may retry after cleaning frees capacity.
//!
//! ## Accounting
//!
//! `open_io_zones` counts zones currently accepting appends;
//! `active_io_zones` counts non-empty, non-full zones (the ones holding
//! a device active-zone resource). Normal allocation is capped at
//! `max_open_zones - reserved_zones_for_gc` so zone cleaning always
//! finds a landing slot; cleaning itself allocates against the full
//! quota.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;

use crate::config::ZoneFsOptions;
use crate::device::{ZoneBlockDevice, ZoneKind};
use crate::error::ZoneFsError;
use crate::file::ZoneFile;
use crate::reclaim::ZoneCleaner;
use crate::zone::{Zone, WriteLifetimeHint};

struct ZoneResources {
    open_io_zones: u32,
    active_io_zones: u32,
}

/// Mount context over one zoned device.
pub struct ZonePool {
    device: Arc<dyn ZoneBlockDevice>,
    options: ZoneFsOptions,
    /// All zones in id order; ids are the enumeration index.
    zones: Vec<Arc<Zone>>,
    meta_zone_ids: Vec<u32>,
    io_zone_ids: Vec<u32>,
    resources: Mutex<ZoneResources>,
    resources_changed: Condvar,
    /// Serialises zone selection so two allocators never pick the same
    /// zone.
    allocation_lock: Mutex<()>,
    files: RwLock<HashMap<String, Arc<ZoneFile>>>,
    next_file_id: AtomicU64,
    /// SST table number to the zones its extents landed in; feeds the
    /// key-locality rung of the allocator.
    sst_zones: Mutex<HashMap<u64, SmallVec<[u32; 4]>>>,
    /// Zones currently being emptied by the cleaner; never handed out.
    cleaning_victims: Mutex<HashSet<u32>>,
    finish_threshold_pct: AtomicU8,
    cleaner: Mutex<Weak<ZoneCleaner>>,
}

impl ZonePool {
    /// Builds the pool from the device's zone report. The first
    /// `meta_zone_count` sequential zones become metadata zones; the
    /// rest are I/O zones. Open/active counters start from what the
    /// report says is already written.
    pub fn new(device: Arc<dyn ZoneBlockDevice>, options: ZoneFsOptions) -> Result<Self> {
        let infos = device.enumerate_zones()?;
        let mut zones = Vec::with_capacity(infos.len());
        let mut meta_zone_ids = Vec::new();
        let mut io_zone_ids = Vec::new();

        for (idx, info) in infos.iter().enumerate() {
            let id = idx as u32;
            zones.push(Arc::new(Zone::new(device.clone(), info, id)));
            if info.kind == ZoneKind::SequentialWriteRequired
                && meta_zone_ids.len() < options.meta_zone_count as usize
            {
                meta_zone_ids.push(id);
            } else {
                io_zone_ids.push(id);
            }
        }

        ensure!(
            meta_zone_ids.len() == options.meta_zone_count as usize,
            ZoneFsError::InvalidArgument(format!(
                "device offers {} sequential zones, {} metadata zones required",
                meta_zone_ids.len(),
                options.meta_zone_count
            ))
        );
        ensure!(
            io_zone_ids.len() > options.reserved_zones_for_gc as usize,
            ZoneFsError::InvalidArgument(format!(
                "{} I/O zones cannot cover {} reserved for cleaning",
                io_zone_ids.len(),
                options.reserved_zones_for_gc
            ))
        );

        let active = io_zone_ids
            .iter()
            .filter(|&&id| {
                let z = &zones[id as usize];
                !z.is_empty() && !z.is_full()
            })
            .count() as u32;

        let finish_threshold_pct = AtomicU8::new(options.finish_threshold_pct);
        Ok(Self {
            device,
            options,
            zones,
            meta_zone_ids,
            io_zone_ids,
            resources: Mutex::new(ZoneResources {
                open_io_zones: 0,
                active_io_zones: active,
            }),
            resources_changed: Condvar::new(),
            allocation_lock: Mutex::new(()),
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU64::new(1),
            sst_zones: Mutex::new(HashMap::new()),
            cleaning_victims: Mutex::new(HashSet::new()),
            finish_threshold_pct,
            cleaner: Mutex::new(Weak::new()),
        })
    }

    pub fn device(&self) -> &Arc<dyn ZoneBlockDevice> {
        &self.device
    }

    pub fn options(&self) -> &ZoneFsOptions {
        &self.options
    }

    pub fn block_size(&self) -> u64 {
        self.device.block_size()
    }

    pub fn zone_by_id(&self, id: u32) -> Option<Arc<Zone>> {
        self.zones.get(id as usize).cloned()
    }

    pub fn io_zones(&self) -> Vec<Arc<Zone>> {
        self.io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].clone())
            .collect()
    }

    pub fn meta_zones(&self) -> Vec<Arc<Zone>> {
        self.meta_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].clone())
            .collect()
    }

    /// Hooks up the zone cleaner the pool wakes on space pressure.
    pub fn set_cleaner(&self, cleaner: Weak<ZoneCleaner>) {
        *self.cleaner.lock() = cleaner;
    }

    pub fn set_finish_threshold(&self, pct: u8) {
        self.finish_threshold_pct.store(pct, Ordering::Release);
    }

    /// Finishes every unowned zone whose remaining capacity is under the
    /// finish threshold, releasing their active slots. Returns how many
    /// zones were finished.
    pub fn finish_cheap_victims(&self) -> usize {
        let mut finished = 0;
        while self.finish_victim_zone() {
            finished += 1;
        }
        finished
    }

    /// Wakes the cleaner if one is attached; never blocks.
    pub fn trigger_zone_cleaning(&self) {
        if let Some(cleaner) = self.cleaner.lock().upgrade() {
            cleaner.wake();
        }
    }

    // ---- space accounting ----

    /// Capacity still writable across all I/O zones.
    pub fn free_space(&self) -> u64 {
        self.io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].remaining_capacity())
            .sum()
    }

    /// Bytes referenced by valid extents.
    pub fn used_space(&self) -> u64 {
        self.io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].used_capacity())
            .sum()
    }

    /// Written bytes no valid extent references; what zone cleaning can
    /// win back.
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zone_ids
            .iter()
            .map(|&id| {
                let z = &self.zones[id as usize];
                (z.write_pointer() - z.start()).saturating_sub(z.used_capacity())
            })
            .sum()
    }

    fn io_capacity(&self) -> u64 {
        self.io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].max_capacity())
            .sum()
    }

    // ---- allocation ----

    /// Allocates a zone for `file_id` to append into, per the preference
    /// ladder in the module docs. Blocks up to `allocation_wait` for an
    /// open-zone slot; wakes the cleaner and returns a typed no-space
    /// error when the device is exhausted.
    pub fn allocate_zone(
        &self,
        file_id: u64,
        lifetime: WriteLifetimeHint,
        smallest: &[u8],
        largest: &[u8],
        level: i32,
    ) -> Result<Arc<Zone>> {
        let capacity = self.io_capacity();
        if capacity > 0
            && self.free_space() * 100 < u64::from(self.options.gc_trigger_free_pct) * capacity
        {
            self.trigger_zone_cleaning();
        }

        let open_limit = self
            .options
            .max_open_zones
            .saturating_sub(u32::from(self.options.reserved_zones_for_gc))
            .max(1);
        let active_limit = self
            .options
            .max_active_zones
            .saturating_sub(u32::from(self.options.reserved_zones_for_gc))
            .max(1);

        self.acquire_open_slot(open_limit)?;

        let selection = self.select_io_zone(file_id, lifetime, smallest, largest, level, active_limit);
        match selection {
            Ok(zone) => Ok(zone),
            Err(err) => {
                self.release_open_slot();
                self.trigger_zone_cleaning();
                Err(err)
            }
        }
    }

    /// Allocates an empty landing zone for extent migration. Runs against
    /// the full open/active quota, so the slots held back from normal
    /// writers keep cleaning from deadlocking on its own admission.
    pub fn allocate_zone_for_cleaning(&self, excluded: &HashSet<u32>) -> Result<Arc<Zone>> {
        self.acquire_open_slot(self.options.max_open_zones)?;

        let _selecting = self.allocation_lock.lock();
        let victims = self.cleaning_victims.lock().clone();
        let candidate = self
            .io_zone_ids
            .iter()
            .map(|&id| &self.zones[id as usize])
            .find(|z| {
                z.is_empty()
                    && !z.open_for_write()
                    && !excluded.contains(&z.id())
                    && !victims.contains(&z.id())
            })
            .cloned();

        let Some(zone) = candidate else {
            self.release_open_slot();
            return Err(ZoneFsError::NoSpace.into());
        };

        if !self.try_activate(self.options.max_active_zones) {
            self.release_open_slot();
            return Err(ZoneFsError::NoSpace.into());
        }
        zone.set_open_for_write(true);
        Ok(zone)
    }

    /// Picks an empty metadata zone for journal rotation. Metadata zones
    /// sit outside the I/O quota.
    pub fn allocate_meta_zone(&self, exclude: Option<u32>) -> Result<Arc<Zone>> {
        for &id in &self.meta_zone_ids {
            if Some(id) == exclude {
                continue;
            }
            let zone = &self.zones[id as usize];
            if zone.is_empty() {
                return Ok(zone.clone());
            }
        }
        Err(ZoneFsError::NoMetadataSpace.into())
    }

    fn acquire_open_slot(&self, limit: u32) -> Result<()> {
        let deadline = Instant::now() + self.options.allocation_wait;
        let mut res = self.resources.lock();
        while res.open_io_zones >= limit {
            if self
                .resources_changed
                .wait_until(&mut res, deadline)
                .timed_out()
            {
                drop(res);
                self.trigger_zone_cleaning();
                return Err(ZoneFsError::NoSpace.into());
            }
        }
        res.open_io_zones += 1;
        Ok(())
    }

    fn release_open_slot(&self) {
        let mut res = self.resources.lock();
        res.open_io_zones = res.open_io_zones.saturating_sub(1);
        self.resources_changed.notify_all();
    }

    /// Claims an active-zone slot, finishing a nearly-full zone first
    /// when the finish threshold allows it. Returns false when the
    /// active quota is exhausted.
    fn try_activate(&self, limit: u32) -> bool {
        {
            let mut res = self.resources.lock();
            if res.active_io_zones < limit {
                res.active_io_zones += 1;
                return true;
            }
        }

        if self.finish_victim_zone() {
            let mut res = self.resources.lock();
            if res.active_io_zones < limit {
                res.active_io_zones += 1;
                return true;
            }
        }
        false
    }

    /// Finishes the active zone closest to full, provided its remaining
    /// capacity is under the finish threshold. Frees one active slot.
    fn finish_victim_zone(&self) -> bool {
        let threshold = u64::from(self.finish_threshold_pct.load(Ordering::Acquire));
        if threshold == 0 {
            return false;
        }

        let victim = self
            .io_zone_ids
            .iter()
            .map(|&id| &self.zones[id as usize])
            .filter(|z| {
                !z.open_for_write()
                    && !z.is_empty()
                    && !z.is_full()
                    && z.remaining_capacity() * 100 <= threshold * z.max_capacity()
            })
            .min_by_key(|z| (z.remaining_capacity(), z.id()))
            .cloned();

        let Some(zone) = victim else { return false };
        match zone.finish() {
            Ok(()) => {
                log::debug!(
                    "finished zone {} under threshold, freeing an active slot",
                    zone.id()
                );
                let mut res = self.resources.lock();
                res.active_io_zones = res.active_io_zones.saturating_sub(1);
                self.resources_changed.notify_all();
                true
            }
            Err(err) => {
                log::warn!("finishing zone {} failed: {err:#}", zone.id());
                false
            }
        }
    }

    fn select_io_zone(
        &self,
        file_id: u64,
        lifetime: WriteLifetimeHint,
        smallest: &[u8],
        largest: &[u8],
        level: i32,
        active_limit: u32,
    ) -> Result<Arc<Zone>> {
        let _selecting = self.allocation_lock.lock();

        let victims = self.cleaning_victims.lock().clone();
        let candidates: Vec<Arc<Zone>> = self
            .io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].clone())
            .filter(|z| {
                !z.open_for_write() && z.remaining_capacity() > 0 && !victims.contains(&z.id())
            })
            .collect();

        // Rung 1: key locality. Zones already holding a neighbouring SST
        // of the same level.
        if level >= 0 && !(smallest.is_empty() && largest.is_empty()) {
            let nearby = self.zones_with_adjacent_keys(file_id, smallest, largest, level);
            if let Some(zone) = Self::pick(candidates.iter().filter(|z| nearby.contains(&z.id())))
            {
                zone.set_open_for_write(true);
                return Ok(zone);
            }
        }

        // Rung 2: same lifetime, already holding data of the same level.
        if level >= 0 {
            let same_level_lifetime = candidates.iter().filter(|z| {
                !z.is_empty()
                    && z.lifetime() == lifetime
                    && z.valid_extents().iter().any(|e| e.level == level)
            });
            if let Some(zone) = Self::pick(same_level_lifetime) {
                zone.set_open_for_write(true);
                return Ok(zone);
            }
        }

        // Rung 3: level-0 affinity. L0 tables die together, so a new L0
        // table goes to the zone already holding the most L0 files.
        if level == 0 {
            let most_l0 = candidates
                .iter()
                .filter(|z| !z.is_empty())
                .filter_map(|z| {
                    let mut owners = HashSet::new();
                    for info in z.valid_extents() {
                        if info.level == 0 {
                            owners.insert(info.file_id);
                        }
                    }
                    if owners.is_empty() {
                        None
                    } else {
                        Some((owners.len(), z))
                    }
                })
                .max_by(|(na, za), (nb, zb)| na.cmp(nb).then_with(|| zb.id().cmp(&za.id())))
                .map(|(_, z)| z.clone());
            if let Some(zone) = most_l0 {
                zone.set_open_for_write(true);
                return Ok(zone);
            }
        }

        // Rung 4: lifetime match on any partially-written zone, nearest
        // secondary lifetime first.
        let target = f64::from(lifetime.code());
        if let Some(zone) = candidates
            .iter()
            .filter(|z| !z.is_empty() && z.lifetime() == lifetime)
            .min_by(|a, b| {
                let da = (a.secondary_lifetime() - target).abs();
                let db = (b.secondary_lifetime() - target).abs();
                da.partial_cmp(&db)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.remaining_capacity().cmp(&b.remaining_capacity()))
                    .then_with(|| a.id().cmp(&b.id()))
            })
        {
            zone.set_open_for_write(true);
            return Ok(zone.clone());
        }

        // Rung 5: fresh zone; costs an active slot.
        if let Some(zone) = candidates
            .iter()
            .filter(|z| z.is_empty())
            .min_by_key(|z| z.id())
        {
            if self.try_activate(active_limit) {
                zone.set_lifetime(lifetime);
                zone.set_open_for_write(true);
                return Ok(zone.clone());
            }
        }

        Err(ZoneFsError::NoSpace.into())
    }

    /// Smallest non-zero remaining capacity wins, then smaller id.
    fn pick<'a>(zones: impl Iterator<Item = &'a Arc<Zone>>) -> Option<Arc<Zone>> {
        zones
            .min_by_key(|z| (z.remaining_capacity(), z.id()))
            .cloned()
    }

    /// Zones holding extents of SSTs whose key range touches
    /// `[smallest, largest]` at `level`. Scans the registry but skips the
    /// requesting file; files whose state lock is write-held (an append
    /// in flight elsewhere) are skipped rather than waited on, since the
    /// appender may itself be parked in admission control.
    fn zones_with_adjacent_keys(
        &self,
        file_id: u64,
        smallest: &[u8],
        largest: &[u8],
        level: i32,
    ) -> HashSet<u32> {
        let mut nearby = HashSet::new();
        let sst_zones = self.sst_zones.lock();
        let files = self.files.read();

        for file in files.values() {
            if file.id() == file_id {
                continue;
            }
            let Some(inner) = file.try_read_inner() else {
                continue;
            };
            if inner.level != level || inner.smallest_key.is_empty() {
                continue;
            }
            let disjoint = largest < &inner.smallest_key[..] || smallest > &inner.largest_key[..];
            if disjoint {
                continue;
            }
            if let Some(ids) = inner.sst_number.and_then(|n| sst_zones.get(&n)) {
                nearby.extend(ids.iter().copied());
            }
        }
        nearby
    }

    /// Records that SST `sst_number` grew an extent in `zone_id`.
    pub(crate) fn note_sst_extent(&self, sst_number: u64, zone_id: u32) {
        let mut sst_zones = self.sst_zones.lock();
        let zones = sst_zones.entry(sst_number).or_default();
        if !zones.contains(&zone_id) {
            zones.push(zone_id);
        }
    }

    // ---- zone lifecycle notifications ----

    /// A writer filled its zone to capacity: the open slot comes back and
    /// the zone stops holding an active-zone resource.
    pub fn notify_io_zone_full(&self) {
        let mut res = self.resources.lock();
        res.open_io_zones = res.open_io_zones.saturating_sub(1);
        res.active_io_zones = res.active_io_zones.saturating_sub(1);
        self.resources_changed.notify_all();
    }

    /// A writer released a zone that still has capacity; only the open
    /// slot comes back.
    pub fn notify_io_zone_closed(&self) {
        self.release_open_slot();
    }

    /// Clears the open flag on a zone a writer filled mid-append and
    /// returns its slots.
    pub(crate) fn relinquish_full_zone(&self, zone: &Zone) {
        zone.set_open_for_write(false);
        self.notify_io_zone_full();
    }

    /// Resets every I/O zone whose extents are all invalid. Returns how
    /// many zones were recovered.
    pub fn reset_unused_io_zones(&self) -> Result<usize> {
        let mut recovered = 0;
        for &id in &self.io_zone_ids {
            let zone = &self.zones[id as usize];
            if zone.open_for_write() || zone.is_empty() || zone.is_used() {
                continue;
            }
            let was_full = zone.is_full();
            zone.reset()?;
            recovered += 1;

            if !was_full {
                let mut res = self.resources.lock();
                res.active_io_zones = res.active_io_zones.saturating_sub(1);
            }
            self.resources_changed.notify_all();
        }
        if recovered > 0 {
            log::info!("reset {recovered} unused I/O zones");
        }
        Ok(recovered)
    }

    /// Called by the cleaner after it reset an emptied victim.
    pub(crate) fn notify_io_zone_reset(&self, was_full: bool) {
        if !was_full {
            let mut res = self.resources.lock();
            res.active_io_zones = res.active_io_zones.saturating_sub(1);
        }
        self.resources_changed.notify_all();
    }

    pub(crate) fn mark_cleaning_victim(&self, zone_id: u32) {
        self.cleaning_victims.lock().insert(zone_id);
    }

    pub(crate) fn clear_cleaning_victim(&self, zone_id: u32) {
        self.cleaning_victims.lock().remove(&zone_id);
    }

    /// Cleaning candidates ordered by reclaimable bytes, most first.
    /// Open and empty zones never qualify.
    pub fn zc_candidates(&self) -> Vec<Arc<Zone>> {
        let victims = self.cleaning_victims.lock().clone();
        let mut candidates: Vec<Arc<Zone>> = self
            .io_zone_ids
            .iter()
            .map(|&id| self.zones[id as usize].clone())
            .filter(|z| !z.open_for_write() && !z.is_empty() && !victims.contains(&z.id()))
            .collect();
        candidates.sort_by_key(|z| (std::cmp::Reverse(z.invalid_bytes()), z.id()));
        candidates
    }

    // ---- file registry ----

    /// Creates and registers an empty file. Fails if the name is taken.
    pub fn create_file(&self, filename: &str) -> Result<Arc<ZoneFile>> {
        let mut files = self.files.write();
        ensure!(
            !files.contains_key(filename),
            ZoneFsError::InvalidArgument(format!("file '{filename}' already exists"))
        );
        let id = self.next_file_id.fetch_add(1, Ordering::AcqRel);
        let file = Arc::new(ZoneFile::new(self.device.clone(), filename.to_string(), id));
        files.insert(filename.to_string(), file.clone());
        Ok(file)
    }

    pub fn get_file(&self, filename: &str) -> Option<Arc<ZoneFile>> {
        self.files.read().get(filename).cloned()
    }

    pub fn get_file_by_id(&self, id: u64) -> Option<Arc<ZoneFile>> {
        self.files
            .read()
            .values()
            .find(|f| f.id() == id)
            .cloned()
    }

    pub fn files(&self) -> Vec<Arc<ZoneFile>> {
        self.files.read().values().cloned().collect()
    }

    /// Unregisters the file and invalidates its extents, surfacing the
    /// zones for reclamation. The caller journals the deletion; the
    /// returned handle keeps the bytes addressable for readers that
    /// already hold it.
    pub fn delete_file(&self, filename: &str) -> Result<Arc<ZoneFile>> {
        let file = self.files.write().remove(filename).ok_or_else(|| {
            ZoneFsError::InvalidArgument(format!("no such file '{filename}'"))
        })?;
        file.mark_for_deletion();
        // Seal any in-progress extent first so every written byte is
        // accounted before it is invalidated.
        file.push_extent();
        file.invalidate_extents()?;
        Ok(file)
    }

    /// Re-keys the registry entry and renames the file. The caller
    /// journals the rename.
    pub fn rename_file(&self, from: &str, to: &str) -> Result<Arc<ZoneFile>> {
        let mut files = self.files.write();
        ensure!(
            !files.contains_key(to),
            ZoneFsError::InvalidArgument(format!("file '{to}' already exists"))
        );
        let file = files.remove(from).ok_or_else(|| {
            ZoneFsError::InvalidArgument(format!("no such file '{from}'"))
        })?;
        file.rename(to.to_string());
        files.insert(to.to_string(), file.clone());
        Ok(file)
    }

    /// Installs a file decoded from the metadata journal during recovery:
    /// registers its extents with their zones and reserves its id.
    pub fn install_file(&self, file: Arc<ZoneFile>) -> Result<()> {
        file.register_extents_with_zones(0);
        self.next_file_id.fetch_max(file.id() + 1, Ordering::AcqRel);
        let mut files = self.files.write();
        ensure!(
            files.insert(file.filename(), file).is_none(),
            ZoneFsError::Corruption("duplicate file in metadata journal".to_string())
        );
        Ok(())
    }

    /// Re-inserts `file` under its current filename if the registry key
    /// went stale (a rename replayed from the journal).
    pub(crate) fn rekey_file(&self, file: &Arc<ZoneFile>) -> Result<()> {
        let name = file.filename();
        let mut files = self.files.write();
        let stale = files
            .iter()
            .find(|(key, f)| f.id() == file.id() && **key != name)
            .map(|(key, _)| key.clone());
        if let Some(key) = stale {
            files.remove(&key);
            ensure!(
                files.insert(name, file.clone()).is_none(),
                ZoneFsError::Corruption("rename collides with a live file".to_string())
            );
        }
        Ok(())
    }

    /// Drops a registry entry during recovery replay of a delete record.
    pub fn remove_file_by_id(&self, id: u64) -> Option<Arc<ZoneFile>> {
        let mut files = self.files.write();
        let name = files
            .iter()
            .find(|(_, f)| f.id() == id)
            .map(|(name, _)| name.clone())?;
        files.remove(&name)
    }

    #[cfg(test)]
    pub(crate) fn open_io_zone_count(&self) -> u32 {
        self.resources.lock().open_io_zones
    }

    #[cfg(test)]
    pub(crate) fn active_io_zone_count(&self) -> u32 {
        self.resources.lock().active_io_zones
    }
}

impl std::fmt::Debug for ZonePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let res = self.resources.lock();
        f.debug_struct("ZonePool")
            .field("io_zones", &self.io_zone_ids.len())
            .field("meta_zones", &self.meta_zone_ids.len())
            .field("open", &res.open_io_zones)
            .field("active", &res.active_io_zones)
            .field("files", &self.files.read().len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::device::{FileBackedZbd, Geometry};

    /// Emulated device with 4 KiB blocks and 64 KiB zones. The backing
    /// tempdir is leaked for the duration of the test process.
    pub(crate) fn test_device(nr_zones: u32) -> Arc<dyn ZoneBlockDevice> {
        test_device_with(nr_zones, 4096, 1 << 16)
    }

    pub(crate) fn test_device_with(
        nr_zones: u32,
        block_size: u64,
        zone_size: u64,
    ) -> Arc<dyn ZoneBlockDevice> {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let dev = FileBackedZbd::create(
            dir.path().join("zbd"),
            Geometry {
                block_size,
                zone_size,
                nr_zones,
            },
        )
        .expect("should create emulated device");
        std::mem::forget(dir);
        Arc::new(dev)
    }

    pub(crate) fn test_pool(nr_zones: u32) -> Arc<ZonePool> {
        let device = test_device(nr_zones);
        Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should build pool"))
    }
}
