//! # Zone Cleaning
//!
//! Reclaims zones whose written bytes are mostly dead. A cleaning pass
//! snapshots the candidate queue (zones ordered by reclaimable bytes),
//! picks the best victim, migrates each still-valid extent into a
//! landing zone allocated from the reserved quota, journals a full
//! snapshot for every touched file, and finally resets the victim.
//!
//! Extent migration runs under the owning file's extent write lock, so
//! readers observe either the old or the new location, never a torn
//! extent list. The victim is registered as a cleaning victim for the
//! duration of the pass so the allocator cannot hand it out while it is
//! being emptied.
//!
//! The cleaner can run inline (`run_once`, used by tests and by
//! explicit triggers) or as a background thread (`spawn`) woken by the
//! allocator on space pressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use crate::error::ZoneFsError;
use crate::file::{ZoneExtent, ZoneFile};
use crate::meta::MetaJournal;
use crate::pool::ZonePool;
use crate::zone::{Zone, ZoneExtentInfo};

/// Upper bound on the copy buffer used while relocating an extent.
const MIGRATION_CHUNK: u64 = 1 << 20;

pub struct ZoneCleaner {
    pool: Arc<ZonePool>,
    journal: Arc<MetaJournal>,
    /// At most one cleaning pass at a time.
    pass_lock: Mutex<()>,
    wake_flag: Mutex<bool>,
    wake_cond: Condvar,
    stop: AtomicBool,
}

impl ZoneCleaner {
    /// Builds the cleaner and registers it with the pool so allocation
    /// failures can wake it. The pool holds only a weak reference.
    pub fn new(pool: Arc<ZonePool>, journal: Arc<MetaJournal>) -> Arc<Self> {
        let cleaner = Arc::new(Self {
            pool: pool.clone(),
            journal,
            pass_lock: Mutex::new(()),
            wake_flag: Mutex::new(false),
            wake_cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        pool.set_cleaner(Arc::downgrade(&cleaner));
        cleaner
    }

    /// Nudges the background thread (if any). Never blocks.
    pub fn wake(&self) {
        let mut pending = self.wake_flag.lock();
        *pending = true;
        self.wake_cond.notify_one();
    }

    /// Starts the background cleaning thread. It wakes on demand and on
    /// a coarse timer, and cleans while free space sits below the
    /// configured watermark.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let cleaner = self.clone();
        std::thread::Builder::new()
            .name("zone-cleaner".to_string())
            .spawn(move || cleaner.run_loop())
            .wrap_err("spawning zone cleaner thread")
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    fn run_loop(&self) {
        while !self.stop.load(Ordering::Acquire) {
            {
                let mut pending = self.wake_flag.lock();
                if !*pending {
                    self.wake_cond
                        .wait_for(&mut pending, Duration::from_secs(10));
                }
                *pending = false;
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let trigger = u64::from(self.pool.options().gc_trigger_free_pct);
            loop {
                let capacity: u64 = self
                    .pool
                    .io_zones()
                    .iter()
                    .map(|z| z.max_capacity())
                    .sum();
                let below_watermark =
                    capacity > 0 && self.pool.free_space() * 100 < trigger * capacity;
                if !below_watermark {
                    break;
                }
                match self.run_once() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        log::warn!("zone cleaning pass failed: {err:#}");
                        break;
                    }
                }
            }
        }
    }

    /// One cleaning pass: empties and resets the best victim. Returns
    /// false when no zone has anything to reclaim.
    pub fn run_once(&self) -> Result<bool> {
        let _pass = self.pass_lock.lock();

        let victim = self
            .pool
            .zc_candidates()
            .into_iter()
            .find(|z| reclaimable(z) > 0);
        let Some(victim) = victim else {
            return Ok(false);
        };

        self.pool.mark_cleaning_victim(victim.id());
        let outcome = self.clean_zone(&victim);
        self.pool.clear_cleaning_victim(victim.id());
        outcome?;
        Ok(true)
    }

    fn clean_zone(&self, victim: &Arc<Zone>) -> Result<()> {
        log::info!(
            "cleaning zone {}: {} reclaimable bytes, {} valid extents",
            victim.id(),
            reclaimable(victim),
            victim.valid_extents().len()
        );

        let mut dest = MigrationDest::new(&self.pool, victim.id());
        let mut dirty: HashSet<u64> = HashSet::new();

        for info in victim.valid_extents() {
            let Some(file) = self.pool.get_file_by_id(info.file_id) else {
                // Deleted while we were snapshotting; its invalidation
                // already ran or is about to.
                continue;
            };
            if self.migrate_extent(victim, &info, &file, &mut dest)? {
                dirty.insert(info.file_id);
            }
        }
        dest.release();

        // Journal the rewritten extent lists before the bytes they used
        // to point at disappear.
        for file_id in dirty {
            if let Some(file) = self.pool.get_file_by_id(file_id) {
                self.journal.persist_snapshot(&file)?;
            }
        }

        let was_full = victim.is_full();
        victim
            .reset()
            .wrap_err_with(|| format!("resetting cleaned zone {}", victim.id()))?;
        self.pool.notify_io_zone_reset(was_full);
        Ok(())
    }

    /// Copies one valid extent out of `victim` and swaps the file's
    /// extent entry to the new location. Returns false when the extent
    /// vanished before the file lock was taken (a concurrent delete).
    fn migrate_extent(
        &self,
        victim: &Arc<Zone>,
        info: &ZoneExtentInfo,
        file: &Arc<ZoneFile>,
        dest: &mut MigrationDest<'_>,
    ) -> Result<bool> {
        let mut inner = file.write_inner();

        let index = inner.extents.iter().position(|e| {
            e.zone.id() == victim.id() && e.start == info.start && e.length == info.length
        });
        let Some(index) = index else {
            log::debug!(
                "extent {}+{} left zone {} before migration",
                info.start,
                info.length,
                victim.id()
            );
            return Ok(false);
        };

        let zone = dest.zone_with_room(info.length)?;
        let new_start = zone.write_pointer();

        let device = self.pool.device();
        let mut copied = 0u64;
        let mut buf = vec![0u8; info.length.min(MIGRATION_CHUNK) as usize];
        while copied < info.length {
            let chunk = (info.length - copied).min(MIGRATION_CHUNK) as usize;
            device
                .read_at(info.start + copied, &mut buf[..chunk], true)
                .wrap_err("reading extent during migration")?;
            zone.append(&buf[..chunk])
                .wrap_err("writing migrated extent")?;
            copied += chunk as u64;
        }

        zone.push_extent_info(ZoneExtentInfo {
            start: new_start,
            length: info.length,
            valid: true,
            file_id: info.file_id,
            filename: info.filename.clone(),
            lifetime: info.lifetime,
            level: info.level,
        });
        zone.update_secondary_lifetime(info.lifetime, info.length);

        inner.extents[index] = ZoneExtent {
            start: new_start,
            length: info.length,
            zone: zone.clone(),
        };
        // The journaled extent list no longer matches; the next persist
        // must be a full snapshot.
        inner.nr_synced_extents = 0;
        drop(inner);

        victim.invalidate(info.start, info.length)?;
        Ok(true)
    }
}

/// Written bytes in the zone that no valid extent references.
fn reclaimable(zone: &Zone) -> u64 {
    (zone.write_pointer() - zone.start()).saturating_sub(zone.used_capacity())
}

/// Landing zone for a cleaning pass, re-allocated when it fills up.
struct MigrationDest<'a> {
    pool: &'a ZonePool,
    victim_id: u32,
    zone: Option<Arc<Zone>>,
}

impl<'a> MigrationDest<'a> {
    fn new(pool: &'a ZonePool, victim_id: u32) -> Self {
        Self {
            pool,
            victim_id,
            zone: None,
        }
    }

    fn zone_with_room(&mut self, length: u64) -> Result<Arc<Zone>> {
        if let Some(zone) = &self.zone {
            if zone.remaining_capacity() >= length {
                return Ok(zone.clone());
            }
        }
        self.release();

        let mut excluded = HashSet::new();
        excluded.insert(self.victim_id);
        let zone = self
            .pool
            .allocate_zone_for_cleaning(&excluded)
            .wrap_err("allocating landing zone for cleaning")?;
        if zone.max_capacity() < length {
            // Extents never exceed a zone by construction.
            return Err(ZoneFsError::Corruption(format!(
                "extent of {length} bytes exceeds zone capacity {}",
                zone.max_capacity()
            ))
            .into());
        }
        self.zone = Some(zone.clone());
        Ok(zone)
    }

    fn release(&mut self) {
        if let Some(zone) = self.zone.take() {
            zone.set_open_for_write(false);
            if zone.is_full() {
                self.pool.notify_io_zone_full();
            } else {
                self.pool.notify_io_zone_closed();
            }
        }
    }
}

impl Drop for MigrationDest<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneFsOptions;
    use crate::meta::MetadataWriter;
    use crate::pool::tests_support::test_device;

    fn pool_and_journal() -> (Arc<ZonePool>, Arc<MetaJournal>) {
        let device = test_device(10);
        let pool =
            Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should build pool"));
        let journal = Arc::new(MetaJournal::open(pool.clone()).expect("should format"));
        (pool, journal)
    }

    fn write_file(
        pool: &Arc<ZonePool>,
        journal: &MetaJournal,
        name: &str,
        byte: u8,
        len: usize,
    ) -> Arc<ZoneFile> {
        let file = pool.create_file(name).expect("should create");
        file.append(pool, &vec![byte; len], len as u64)
            .expect("should append");
        file.close_wr(pool).expect("should close");
        journal.persist(&file).expect("should persist");
        file
    }

    #[test]
    fn fully_invalid_zone_is_reset_without_migration() {
        let (pool, journal) = pool_and_journal();
        let cleaner = ZoneCleaner::new(pool.clone(), journal.clone());

        write_file(&pool, &journal, "dead.sst", 1, 8192);
        pool.delete_file("dead.sst").expect("should delete");
        assert!(pool.reclaimable_space() > 0);

        assert!(cleaner.run_once().expect("should clean"));
        assert_eq!(pool.reclaimable_space(), 0);
        assert_eq!(pool.used_space(), 0);
    }

    #[test]
    fn survivor_extents_are_migrated_and_stay_readable() {
        let (pool, journal) = pool_and_journal();
        let cleaner = ZoneCleaner::new(pool.clone(), journal.clone());

        // Two files sharing one zone, then one dies. The dead file
        // closes first so the survivor's allocation reuses its zone via
        // the lifetime-match rung.
        let dead = write_file(&pool, &journal, "dead.sst", 0xDD, 40960);
        let survivor = pool.create_file("live.sst").expect("create live");
        survivor
            .append(&pool, &vec![0x55; 8192], 8192)
            .expect("append live");
        survivor.close_wr(&pool).expect("close live");
        journal.persist(&survivor).expect("persist live");
        assert_eq!(
            survivor.extent_locations()[0].0,
            dead.extent_locations()[0].0,
            "files share a zone"
        );

        let old_location = survivor.extent_locations()[0];
        pool.delete_file("dead.sst").expect("delete dead");

        assert!(cleaner.run_once().expect("should clean"));

        let new_location = survivor.extent_locations()[0];
        assert_ne!(new_location.0, old_location.0, "extent left the victim");
        assert_eq!(new_location.2, old_location.2, "length preserved");
        assert_eq!(survivor.nr_synced_extents(), 1, "snapshot journaled");

        let mut buf = vec![0u8; 8192];
        let n = survivor
            .positioned_read(0, &mut buf, false)
            .expect("should read");
        assert_eq!(n, 8192);
        assert!(buf.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn cleaning_reports_nothing_to_do_on_a_quiet_pool() {
        let (pool, journal) = pool_and_journal();
        let cleaner = ZoneCleaner::new(pool.clone(), journal.clone());
        assert!(!cleaner.run_once().expect("pass runs"));

        write_file(&pool, &journal, "live.sst", 9, 4096);
        // Everything valid: still nothing to reclaim.
        assert!(!cleaner.run_once().expect("pass runs"));
    }
}
