//! # ZoneFile
//!
//! A logical file as an ordered list of extents scattered across zones.
//! Appends accumulate into the file's *active zone* until the zone runs
//! out of capacity; the in-progress extent is then sealed
//! ([`ZoneFile::push_extent`]) and the remainder recurses into a freshly
//! allocated zone. Concatenating the extent list in order yields the
//! file's logical bytes for `[0, file_size)`.
//!
//! ## Concurrency
//!
//! One writer, many readers. The extent list and every field that moves
//! with it live behind a `parking_lot::RwLock` (a writer-preferring
//! primitive, so zone-cleaning migrations are not starved by read-heavy
//! workloads): `append`, `push_extent`, `close_wr`, `merge_update`, and
//! zone-cleaning migration take the write side; `positioned_read` and
//! the metadata encoders take the read side. `is_appending` and
//! `marked_for_del` are atomics owned by the single writer / deleter.
//!
//! ## Metadata Records
//!
//! `encode_snapshot_to` emits the full extent list; `encode_update_to`
//! emits only extents past `nr_synced_extents` (the prefix already
//! durably journaled). `decode_from`/`merge_update` are the replay side:
//! a snapshot materialises a file, a delta appended onto it reconstructs
//! the same state the writer had at its last sync.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::device::ZoneBlockDevice;
use crate::encoding::{self, Reader};
use crate::error::ZoneFsError;
use crate::pool::ZonePool;
use crate::zone::{Zone, ZoneExtentInfo, WriteLifetimeHint};

/// Version tag leading every encoded file record.
pub const FILE_RECORD_VERSION: u8 = 1;

/// Rounds `n` up to the next multiple of `align`.
pub(crate) fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

/// A maximal contiguous byte run of a file inside one zone. Immutable
/// once written; the backing bytes survive until the owning zone resets.
#[derive(Clone)]
pub struct ZoneExtent {
    /// Absolute device offset of the first byte.
    pub start: u64,
    /// Physical length in bytes (always block-aligned).
    pub length: u64,
    /// Non-owning handle to the zone holding the bytes.
    pub zone: Arc<Zone>,
}

impl std::fmt::Debug for ZoneExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneExtent")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("zone", &self.zone.id())
            .finish()
    }
}

/// Owned, alignment-padded write buffer queued by `full_buffer`.
pub struct PaddedBuffer {
    data: Vec<u8>,
    valid_size: u64,
}

impl PaddedBuffer {
    /// Copies `data`, zero-padding the copy up to a block boundary.
    /// `valid_size` of the original bytes count toward file size.
    pub fn new(data: &[u8], valid_size: u64, block_size: u64) -> Self {
        let padded = round_up(data.len() as u64, block_size) as usize;
        let mut copy = Vec::with_capacity(padded);
        copy.extend_from_slice(data);
        copy.resize(padded, 0);
        Self {
            data: copy,
            valid_size,
        }
    }
}

pub(crate) struct FileInner {
    pub(crate) filename: String,
    pub(crate) file_size: u64,
    pub(crate) lifetime: WriteLifetimeHint,
    pub(crate) smallest_key: Vec<u8>,
    pub(crate) largest_key: Vec<u8>,
    pub(crate) level: i32,
    pub(crate) sst_number: Option<u64>,
    pub(crate) extents: SmallVec<[ZoneExtent; 8]>,
    pub(crate) active_zone: Option<Arc<Zone>>,
    /// Device offset where the in-progress extent began.
    pub(crate) extent_start: u64,
    /// Prefix of `extents` already durably recorded in metadata.
    pub(crate) nr_synced_extents: usize,
    pub(crate) full_buffer: VecDeque<PaddedBuffer>,
}

/// Logical file backed by zone extents.
pub struct ZoneFile {
    id: u64,
    device: Arc<dyn ZoneBlockDevice>,
    inner: RwLock<FileInner>,
    is_appending: AtomicBool,
    marked_for_del: AtomicBool,
}

impl ZoneFile {
    pub fn new(device: Arc<dyn ZoneBlockDevice>, filename: String, id: u64) -> Self {
        Self {
            id,
            device,
            inner: RwLock::new(FileInner {
                filename,
                file_size: 0,
                lifetime: WriteLifetimeHint::NotSet,
                smallest_key: Vec::new(),
                largest_key: Vec::new(),
                level: -1,
                sst_number: None,
                extents: SmallVec::new(),
                active_zone: None,
                extent_start: 0,
                nr_synced_extents: 0,
                full_buffer: VecDeque::new(),
            }),
            is_appending: AtomicBool::new(false),
            marked_for_del: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filename(&self) -> String {
        self.inner.read().filename.clone()
    }

    pub fn file_size(&self) -> u64 {
        self.inner.read().file_size
    }

    pub fn lifetime(&self) -> WriteLifetimeHint {
        self.inner.read().lifetime
    }

    pub fn block_size(&self) -> u64 {
        self.device.block_size()
    }

    pub fn level(&self) -> i32 {
        self.inner.read().level
    }

    pub fn is_appending(&self) -> bool {
        self.is_appending.load(Ordering::Acquire)
    }

    /// Claims the single-appender slot. Returns false if a writable
    /// handle is already open on this file.
    pub(crate) fn acquire_appender(&self) -> bool {
        self.is_appending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_appending(&self, appending: bool) {
        self.is_appending.store(appending, Ordering::Release);
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_del.load(Ordering::Acquire)
    }

    /// Monotonic false-to-true transition; the registry drops the file
    /// once no readers remain.
    pub fn mark_for_deletion(&self) {
        self.marked_for_del.store(true, Ordering::Release);
    }

    pub fn set_write_lifetime_hint(&self, lifetime: WriteLifetimeHint) {
        self.inner.write().lifetime = lifetime;
    }

    /// Attaches the SST key range, LSM level, and table number the upper
    /// layer knows about; drives key-locality zone allocation.
    pub fn set_min_max_key_and_level(
        &self,
        smallest: &[u8],
        largest: &[u8],
        level: i32,
        sst_number: u64,
    ) {
        let mut inner = self.inner.write();
        inner.smallest_key = smallest.to_vec();
        inner.largest_key = largest.to_vec();
        inner.level = level;
        inner.sst_number = Some(sst_number);
    }

    /// Renames the file in place. Journaling the rename is the caller's
    /// responsibility.
    pub fn rename(&self, name: String) {
        self.inner.write().filename = name;
    }

    /// Deterministic identifier, stable for the process lifetime, for
    /// upper-layer cache correlation.
    pub fn get_unique_id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&self.id.to_le_bytes());
        id[8..].copy_from_slice(&self.id.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_le_bytes());
        id
    }

    /// The committed extent covering `offset`, if one exists. Bytes past
    /// the last `push_extent` still live in the active zone and have no
    /// extent yet.
    pub fn get_extent(&self, offset: u64) -> Option<ZoneExtent> {
        let inner = self.inner.read();
        let mut logical = 0u64;
        for extent in &inner.extents {
            if offset < logical + extent.length {
                return Some(extent.clone());
            }
            logical += extent.length;
        }
        None
    }

    /// Snapshot of `(zone_id, start, length)` per extent, in logical order.
    pub fn extent_locations(&self) -> Vec<(u32, u64, u64)> {
        self.inner
            .read()
            .extents
            .iter()
            .map(|e| (e.zone.id(), e.start, e.length))
            .collect()
    }

    /// Non-blocking read access for allocator heuristics that must not
    /// wait behind an in-flight append.
    pub(crate) fn try_read_inner(&self) -> Option<RwLockReadGuard<'_, FileInner>> {
        self.inner.try_read()
    }

    pub(crate) fn write_inner(&self) -> RwLockWriteGuard<'_, FileInner> {
        self.inner.write()
    }

    /// Appends `data` to the file. `data` must be block-aligned in
    /// length; `valid_size` of it counts toward file size (the tail is
    /// padding past the logical end). Seals the current extent and
    /// recurses into a new zone whenever the active zone runs out of
    /// capacity.
    pub fn append(&self, pool: &ZonePool, data: &[u8], valid_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        self.append_locked(&mut inner, pool, data, valid_size)
    }

    fn append_locked(
        &self,
        inner: &mut FileInner,
        pool: &ZonePool,
        data: &[u8],
        valid_size: u64,
    ) -> Result<()> {
        let block = self.device.block_size();
        ensure!(
            data.len() as u64 % block == 0,
            ZoneFsError::InvalidArgument(format!(
                "append of {} bytes is not block-aligned",
                data.len()
            ))
        );
        ensure!(
            valid_size <= data.len() as u64,
            ZoneFsError::InvalidArgument(format!(
                "valid size {} exceeds data size {}",
                valid_size,
                data.len()
            ))
        );

        let mut remaining = data;
        while !remaining.is_empty() {
            let zone = match inner.active_zone.clone() {
                Some(zone) => zone,
                None => {
                    let zone = pool
                        .allocate_zone(
                            self.id,
                            inner.lifetime,
                            &inner.smallest_key,
                            &inner.largest_key,
                            inner.level,
                        )
                        .wrap_err_with(|| format!("allocating zone for '{}'", inner.filename))?;
                    if let Some(sst) = inner.sst_number {
                        pool.note_sst_extent(sst, zone.id());
                    }
                    inner.extent_start = zone.write_pointer();
                    inner.active_zone = Some(zone.clone());
                    zone
                }
            };
            let left = zone.remaining_capacity();

            if left == 0 {
                self.push_extent_locked(inner);
                pool.relinquish_full_zone(&zone);
                inner.active_zone = None;
                continue;
            }

            let take = (remaining.len() as u64).min(left) as usize;
            zone.append(&remaining[..take])
                .wrap_err_with(|| format!("appending to '{}'", inner.filename))?;
            remaining = &remaining[take..];

            if !remaining.is_empty() {
                // Zone exhausted mid-write: seal and move on.
                self.push_extent_locked(inner);
                pool.relinquish_full_zone(&zone);
                inner.active_zone = None;
            }
        }

        inner.file_size += valid_size;
        Ok(())
    }

    /// Queues an owned, alignment-padded copy of `data` for a deferred
    /// batched flush (`append_buffer`). Typical for SST table builders
    /// that want their whole output to land contiguously on close.
    pub fn full_buffer(&self, data: &[u8], valid_size: u64) {
        let buffer = PaddedBuffer::new(data, valid_size, self.device.block_size());
        self.inner.write().full_buffer.push_back(buffer);
    }

    /// Drains the deferred buffers in FIFO order through `append`.
    pub fn append_buffer(&self, pool: &ZonePool) -> Result<()> {
        let mut inner = self.inner.write();
        while let Some(buffer) = inner.full_buffer.pop_front() {
            self.append_locked(&mut inner, pool, &buffer.data, buffer.valid_size)?;
        }
        Ok(())
    }

    /// Seals the in-progress extent: records it on the file and registers
    /// the zone-side back-reference.
    pub fn push_extent(&self) {
        let mut inner = self.inner.write();
        self.push_extent_locked(&mut inner);
    }

    pub(crate) fn push_extent_locked(&self, inner: &mut FileInner) {
        let Some(zone) = inner.active_zone.clone() else {
            return;
        };
        let length = zone.write_pointer() - inner.extent_start;
        if length == 0 {
            return;
        }

        zone.push_extent_info(ZoneExtentInfo {
            start: inner.extent_start,
            length,
            valid: true,
            file_id: self.id,
            filename: inner.filename.clone(),
            lifetime: inner.lifetime,
            level: inner.level,
        });
        zone.update_secondary_lifetime(inner.lifetime, length);
        inner.extents.push(ZoneExtent {
            start: inner.extent_start,
            length,
            zone: zone.clone(),
        });
        inner.extent_start = zone.write_pointer();
    }

    /// Finishes writing: seals the tail extent, relinquishes the active
    /// zone, and clears the appending flag. Any partial-block padding
    /// must already have been appended by the caller (the writable
    /// handle pads its staging buffer before calling this).
    pub fn close_wr(&self, pool: &ZonePool) -> Result<()> {
        let mut inner = self.inner.write();
        self.push_extent_locked(&mut inner);

        if let Some(zone) = inner.active_zone.take() {
            let full = zone.close_wr()?;
            if full {
                pool.notify_io_zone_full();
            } else {
                pool.notify_io_zone_closed();
            }
        }
        self.set_appending(false);
        Ok(())
    }

    /// Reads at `offset` into `buf`, stopping at the covering extent's
    /// boundary; returns bytes read (possibly fewer than requested, so
    /// the caller loops) or 0 at end of file.
    pub fn positioned_read(&self, offset: u64, buf: &mut [u8], direct: bool) -> Result<usize> {
        let inner = self.inner.read();

        if offset >= inner.file_size || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(inner.file_size - offset);

        let mut logical = 0u64;
        for extent in &inner.extents {
            if offset < logical + extent.length {
                let within = offset - logical;
                let n = wanted.min(extent.length - within) as usize;
                let dev_offset = extent.start + within;

                // Hold the zone's deletion lock so a concurrent reset
                // cannot pull the bytes out from under the read.
                let _guard = extent.zone.read_guard();
                self.device
                    .read_at(dev_offset, &mut buf[..n], direct)
                    .wrap_err_with(|| {
                        format!(
                            "reading '{}' at logical offset {offset} (device offset {dev_offset})",
                            inner.filename
                        )
                    })?;
                return Ok(n);
            }
            logical += extent.length;
        }

        // Bytes appended since the last push_extent live in the active
        // zone between extent_start and the write pointer.
        if let Some(zone) = &inner.active_zone {
            let unsealed = zone.write_pointer() - inner.extent_start;
            if offset < logical + unsealed {
                let within = offset - logical;
                let n = wanted.min(unsealed - within) as usize;
                let dev_offset = inner.extent_start + within;
                let _guard = zone.read_guard();
                self.device
                    .read_at(dev_offset, &mut buf[..n], direct)
                    .wrap_err_with(|| {
                        format!("reading unsealed tail of '{}' at {offset}", inner.filename)
                    })?;
                return Ok(n);
            }
        }

        Err(ZoneFsError::Corruption(format!(
            "offset {offset} inside file size {} not covered by any extent",
            inner.file_size
        ))
        .into())
    }

    fn encode_to(&self, inner: &FileInner, out: &mut Vec<u8>, extent_start: usize) {
        encoding::put_u8(out, FILE_RECORD_VERSION);
        encoding::put_u64(out, self.id);
        encoding::put_string(out, &inner.filename);
        encoding::put_u8(out, inner.lifetime.code());
        encoding::put_u64(out, inner.file_size);
        encoding::put_bytes(out, &inner.smallest_key);
        encoding::put_bytes(out, &inner.largest_key);
        encoding::put_i32(out, inner.level);
        let extents = &inner.extents[extent_start.min(inner.extents.len())..];
        encoding::put_u32(out, extents.len() as u32);
        for extent in extents {
            encoding::put_u64(out, extent.start);
            encoding::put_u32(out, extent.length as u32);
            encoding::put_u32(out, extent.zone.id());
        }
    }

    /// Full metadata record: every extent.
    pub fn encode_snapshot_to(&self, out: &mut Vec<u8>) {
        let inner = self.inner.read();
        self.encode_to(&inner, out, 0);
    }

    /// Delta record: only extents past the synced prefix.
    pub fn encode_update_to(&self, out: &mut Vec<u8>) {
        let inner = self.inner.read();
        self.encode_to(&inner, out, inner.nr_synced_extents);
    }

    /// Advances the synced prefix to cover the whole extent list. Called
    /// after the metadata writer durably recorded a snapshot or delta.
    pub fn metadata_synced(&self) {
        let mut inner = self.inner.write();
        inner.nr_synced_extents = inner.extents.len();
    }

    pub fn nr_synced_extents(&self) -> usize {
        self.inner.read().nr_synced_extents
    }

    /// Decodes a metadata record into a fresh in-memory file. `resolve`
    /// maps zone ids from the record to live zones; extents with bounds
    /// outside their zone are corruption.
    pub fn decode_from(
        device: Arc<dyn ZoneBlockDevice>,
        r: &mut Reader<'_>,
        resolve: &dyn Fn(u32) -> Option<Arc<Zone>>,
    ) -> Result<ZoneFile> {
        let version = r.get_u8()?;
        ensure!(
            version == FILE_RECORD_VERSION,
            ZoneFsError::Corruption(format!("unsupported file record version {version}"))
        );

        let id = r.get_u64()?;
        let filename = r.get_string()?;
        let lifetime = WriteLifetimeHint::from_code(r.get_u8()?)?;
        let file_size = r.get_u64()?;
        let smallest_key = r.get_bytes()?;
        let largest_key = r.get_bytes()?;
        let level = r.get_i32()?;

        let count = r.get_u32()? as usize;
        let mut extents: SmallVec<[ZoneExtent; 8]> = SmallVec::with_capacity(count);
        for _ in 0..count {
            let start = r.get_u64()?;
            let length = u64::from(r.get_u32()?);
            let zone_id = r.get_u32()?;
            let zone = resolve(zone_id).ok_or_else(|| {
                ZoneFsError::Corruption(format!("record references unknown zone {zone_id}"))
            })?;
            ensure!(
                start >= zone.start() && start + length <= zone.start() + zone.max_capacity(),
                ZoneFsError::Corruption(format!(
                    "extent {start}+{length} outside zone {zone_id}"
                ))
            );
            extents.push(ZoneExtent {
                start,
                length,
                zone,
            });
        }

        let file = ZoneFile::new(device, filename, id);
        {
            let mut inner = file.inner.write();
            inner.file_size = file_size;
            inner.lifetime = lifetime;
            inner.smallest_key = smallest_key;
            inner.largest_key = largest_key;
            inner.level = level;
            inner.extents = extents;
        }
        Ok(file)
    }

    /// Replays a decoded delta onto this file: appends the new extents
    /// and adopts the updated size, keys, and hints. Fails if the record
    /// belongs to a different file. Returns the extent count before the
    /// merge so callers can register only the appended extents with
    /// their zones.
    pub fn merge_update(&self, update: &ZoneFile) -> Result<usize> {
        ensure!(
            self.id == update.id,
            ZoneFsError::Corruption(format!(
                "merge of file id {} into file id {}",
                update.id, self.id
            ))
        );

        let update_inner = update.inner.read();
        let mut inner = self.inner.write();
        let before = inner.extents.len();

        inner.filename = update_inner.filename.clone();
        inner.file_size = update_inner.file_size;
        inner.lifetime = update_inner.lifetime;
        inner.smallest_key = update_inner.smallest_key.clone();
        inner.largest_key = update_inner.largest_key.clone();
        inner.level = update_inner.level;
        for extent in &update_inner.extents {
            inner.extents.push(extent.clone());
        }
        Ok(before)
    }

    /// Registers zone-side back-references for `extents[from..]`. Used
    /// when a decoded file (or a merged delta) is installed into the
    /// registry, so zone used-capacity accounting survives recovery.
    pub fn register_extents_with_zones(&self, from: usize) {
        let inner = self.inner.read();
        for extent in &inner.extents[from.min(inner.extents.len())..] {
            extent.zone.push_extent_info(ZoneExtentInfo {
                start: extent.start,
                length: extent.length,
                valid: true,
                file_id: self.id,
                filename: inner.filename.clone(),
                lifetime: inner.lifetime,
                level: inner.level,
            });
        }
    }

    /// Invalidates every extent of the file on its owning zones. Called
    /// on deletion; zones whose last valid extent disappears become
    /// reclaimable by zone cleaning or `reset_unused_io_zones`.
    pub fn invalidate_extents(&self) -> Result<()> {
        let inner = self.inner.read();
        for extent in &inner.extents {
            extent
                .zone
                .invalidate(extent.start, extent.length)
                .wrap_err_with(|| format!("invalidating extents of '{}'", inner.filename))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ZoneFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ZoneFile")
            .field("id", &self.id)
            .field("filename", &inner.filename)
            .field("file_size", &inner.file_size)
            .field("extents", &inner.extents.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_identity_on_aligned_values() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(1, 512), 512);
    }

    #[test]
    fn padded_buffer_pads_to_block_boundary() {
        let buf = PaddedBuffer::new(&[7u8; 3000], 3000, 4096);
        assert_eq!(buf.data.len(), 4096);
        assert_eq!(&buf.data[..3000], &[7u8; 3000][..]);
        assert_eq!(&buf.data[3000..], &[0u8; 1096][..]);
        assert_eq!(buf.valid_size, 3000);
    }

    #[test]
    fn unique_id_is_deterministic_and_distinct() {
        let dev = crate::pool::tests_support::test_device(4);
        let a = ZoneFile::new(dev.clone(), "a".into(), 7);
        let b = ZoneFile::new(dev, "b".into(), 8);

        assert_eq!(a.get_unique_id(), a.get_unique_id());
        assert_ne!(a.get_unique_id(), b.get_unique_id());
        assert_eq!(&a.get_unique_id()[..8], &7u64.to_le_bytes());
    }

    #[test]
    fn mark_for_deletion_is_monotonic() {
        let dev = crate::pool::tests_support::test_device(4);
        let file = ZoneFile::new(dev, "doomed".into(), 1);
        assert!(!file.marked_for_deletion());
        file.mark_for_deletion();
        file.mark_for_deletion();
        assert!(file.marked_for_deletion());
    }
}
