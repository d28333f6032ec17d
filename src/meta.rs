//! # Metadata Journal
//!
//! Durable file metadata as a rotating record log over the metadata
//! zones. Each record is a fixed header (tag, payload length, CRC64 of
//! the payload) followed by the payload, padded out to a block boundary
//! so every journal write is a legal zone append.
//!
//! ## Record stream
//!
//! A journal zone opens with a `ZoneHead` record carrying a sequence
//! number, followed by any mix of `FileSnapshot` (full extent list),
//! `FileUpdate` (extents past the synced prefix), and `FileDelete`
//! records. When the current zone cannot fit the next record the journal
//! rotates: it picks an empty metadata zone, writes a fresh head with a
//! higher sequence number and a snapshot of every live file, then resets
//! the superseded zone. At most one non-current metadata zone therefore
//! holds data at any instant, and only transiently.
//!
//! ## Recovery
//!
//! Mount scans every metadata zone, parses heads, and replays the zone
//! with the highest sequence number record by record. Replay stops
//! cleanly at the first zeroed tag, truncated header, or CRC mismatch;
//! a torn tail write thus costs at most the records after the last
//! complete sync, never the journal.

use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::encoding::{self, Reader};
use crate::error::ZoneFsError;
use crate::file::{round_up, ZoneFile};
use crate::pool::ZonePool;
use crate::zone::Zone;

const META_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const TAG_ZONE_HEAD: u8 = 1;
const TAG_FILE_SNAPSHOT: u8 = 2;
const TAG_FILE_UPDATE: u8 = 3;
const TAG_FILE_DELETE: u8 = 4;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct RecordHeader {
    tag: u8,
    _pad: [u8; 3],
    len: U32,
    crc: U64,
}

const HEADER_LEN: usize = std::mem::size_of::<RecordHeader>();

/// Sink for file metadata; file sync paths persist through this so the
/// I/O layer never depends on the journal concretely.
pub trait MetadataWriter: Send + Sync {
    /// Durably records the file's current state (delta form) and marks
    /// its extents synced.
    fn persist(&self, file: &ZoneFile) -> Result<()>;
}

struct JournalState {
    current: Arc<Zone>,
    seq: u64,
}

/// Rotating metadata record log.
pub struct MetaJournal {
    pool: Arc<ZonePool>,
    state: Mutex<JournalState>,
}

impl MetaJournal {
    /// Opens the journal at mount: replays the newest metadata zone into
    /// the pool's file registry, or formats a fresh journal when every
    /// metadata zone is empty.
    pub fn open(pool: Arc<ZonePool>) -> Result<Self> {
        let mut newest: Option<(Arc<Zone>, u64, Vec<u8>)> = None;
        for zone in pool.meta_zones() {
            let Some((seq, records)) = read_journal_zone(&pool, &zone)? else {
                continue;
            };
            if newest.as_ref().map_or(true, |(_, best, _)| seq > *best) {
                newest = Some((zone, seq, records));
            }
        }

        let Some((current, seq, records)) = newest else {
            return Self::format(pool);
        };

        replay_records(&pool, &records)?;
        for file in pool.files() {
            file.metadata_synced();
        }

        // Anything superseded (a rotation that lost power mid-cleanup)
        // goes back to empty here.
        for zone in pool.meta_zones() {
            if zone.id() != current.id() && !zone.is_empty() {
                zone.reset().wrap_err("resetting superseded metadata zone")?;
            }
        }

        log::info!(
            "metadata journal recovered: zone {} seq {} with {} live files",
            current.id(),
            seq,
            pool.files().len()
        );
        Ok(Self {
            pool,
            state: Mutex::new(JournalState { current, seq }),
        })
    }

    fn format(pool: Arc<ZonePool>) -> Result<Self> {
        for zone in pool.meta_zones() {
            if !zone.is_empty() {
                zone.reset().wrap_err("formatting metadata zone")?;
            }
        }
        let current = pool.allocate_meta_zone(None)?;
        let journal = Self {
            pool,
            state: Mutex::new(JournalState { current, seq: 0 }),
        };
        {
            let mut state = journal.state.lock();
            state.seq = 1;
            let head = encode_head(1);
            journal.append_record(&state.current, TAG_ZONE_HEAD, &head)?;
        }
        Ok(journal)
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().seq
    }

    pub fn current_zone_id(&self) -> u32 {
        self.state.lock().current.id()
    }

    /// Journals a deletion. The file should already be unregistered and
    /// its extents invalidated.
    pub fn persist_delete(&self, file: &ZoneFile) -> Result<()> {
        let mut payload = Vec::with_capacity(8);
        encoding::put_u64(&mut payload, file.id());
        self.write_record(TAG_FILE_DELETE, &payload)
    }

    /// Journals the file's full state. Used after zone cleaning rewrites
    /// an extent list from scratch.
    pub fn persist_snapshot(&self, file: &ZoneFile) -> Result<()> {
        file.push_extent();
        let mut payload = Vec::new();
        file.encode_snapshot_to(&mut payload);
        self.write_record(TAG_FILE_SNAPSHOT, &payload)?;
        file.metadata_synced();
        Ok(())
    }

    fn write_record(&self, tag: u8, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        match self.append_record(&state.current, tag, payload) {
            Ok(()) => Ok(()),
            Err(err) if crate::error::is_no_space(&err) => {
                self.rotate(&mut state)?;
                self.append_record(&state.current, tag, payload)
            }
            Err(err) => Err(err),
        }
    }

    /// Moves the journal to a fresh zone: new head with the next
    /// sequence number, a snapshot of every live file, then the old zone
    /// is reset. Compaction and rotation are the same operation.
    fn rotate(&self, state: &mut JournalState) -> Result<()> {
        let old = state.current.clone();
        let next = self
            .pool
            .allocate_meta_zone(Some(old.id()))
            .wrap_err("rotating metadata journal")?;

        let seq = state.seq + 1;
        self.append_record(&next, TAG_ZONE_HEAD, &encode_head(seq))?;
        for file in self.pool.files() {
            let mut payload = Vec::new();
            file.encode_snapshot_to(&mut payload);
            self.append_record(&next, TAG_FILE_SNAPSHOT, &payload)
                .wrap_err("snapshotting files into fresh metadata zone")?;
            file.metadata_synced();
        }

        state.current = next;
        state.seq = seq;
        old.reset().wrap_err("resetting rotated metadata zone")?;
        log::debug!(
            "metadata journal rotated to zone {} seq {seq}",
            state.current.id()
        );
        Ok(())
    }

    /// Frames `payload` and appends it to `zone`, padded to a block
    /// boundary, then syncs the device.
    fn append_record(&self, zone: &Zone, tag: u8, payload: &[u8]) -> Result<()> {
        let header = RecordHeader {
            tag,
            _pad: [0; 3],
            len: U32::new(payload.len() as u32),
            crc: U64::new(META_CRC.checksum(payload)),
        };

        let block = self.pool.block_size();
        let total = round_up((HEADER_LEN + payload.len()) as u64, block) as usize;
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(payload);
        buf.resize(total, 0);

        zone.append(&buf)?;
        self.pool.device().sync()?;
        Ok(())
    }
}

impl MetadataWriter for MetaJournal {
    fn persist(&self, file: &ZoneFile) -> Result<()> {
        // Seal the in-progress extent so the record covers every byte
        // appended so far.
        file.push_extent();
        let mut payload = Vec::new();
        file.encode_update_to(&mut payload);
        self.write_record(TAG_FILE_UPDATE, &payload)?;
        file.metadata_synced();
        Ok(())
    }
}

fn encode_head(seq: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    encoding::put_u64(&mut payload, seq);
    payload
}

/// Reads a metadata zone's written region and validates its head.
/// Returns the head sequence and the raw record region (head excluded),
/// or `None` for zones without a valid head record.
fn read_journal_zone(pool: &ZonePool, zone: &Zone) -> Result<Option<(u64, Vec<u8>)>> {
    let written = zone.write_pointer() - zone.start();
    if written == 0 {
        return Ok(None);
    }

    let mut raw = vec![0u8; written as usize];
    pool.device()
        .read_at(zone.start(), &mut raw, false)
        .wrap_err_with(|| format!("reading metadata zone {}", zone.id()))?;

    let block = pool.block_size() as usize;
    let Some((tag, payload, rest)) = next_record(&raw, block)? else {
        return Ok(None);
    };
    if tag != TAG_ZONE_HEAD {
        log::warn!("metadata zone {} starts without a head record", zone.id());
        return Ok(None);
    }
    let seq = Reader::new(payload).get_u64()?;
    let offset = raw.len() - rest.len();
    Ok(Some((seq, raw[offset..].to_vec())))
}

/// Parses the next framed record. `Ok(None)` means clean end of journal
/// (zeroed tag or truncation); CRC mismatch is also treated as end since
/// it marks a torn tail write.
fn next_record(buf: &[u8], block: usize) -> Result<Option<(u8, &[u8], &[u8])>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let Ok((header, _)) = RecordHeader::ref_from_prefix(buf) else {
        return Ok(None);
    };
    if header.tag == 0 || header.tag > TAG_FILE_DELETE {
        if header.tag != 0 {
            log::warn!(
                "journal record with unknown tag {}, treating as end of log",
                header.tag
            );
        }
        return Ok(None);
    }

    let len = header.len.get() as usize;
    let framed = round_up((HEADER_LEN + len) as u64, block as u64) as usize;
    if buf.len() < framed {
        return Ok(None);
    }
    let payload = &buf[HEADER_LEN..HEADER_LEN + len];
    if META_CRC.checksum(payload) != header.crc.get() {
        log::warn!("journal record with bad checksum, treating as end of log");
        return Ok(None);
    }
    Ok(Some((header.tag, payload, &buf[framed..])))
}

/// Replays snapshot, update, and delete records into the pool registry.
fn replay_records(pool: &ZonePool, mut records: &[u8]) -> Result<()> {
    let block = pool.block_size() as usize;
    while let Some((tag, payload, rest)) = next_record(records, block)? {
        records = rest;
        match tag {
            TAG_FILE_SNAPSHOT => {
                let mut r = Reader::new(payload);
                let file = ZoneFile::decode_from(pool.device().clone(), &mut r, &|id| {
                    pool.zone_by_id(id)
                })?;
                // A snapshot supersedes whatever earlier records built up
                // for this file (zone cleaning journals one after moving
                // extents). Retire the old state before installing.
                if let Some(superseded) = pool.remove_file_by_id(file.id()) {
                    superseded.invalidate_extents()?;
                }
                pool.install_file(Arc::new(file))?;
            }
            TAG_FILE_UPDATE => {
                let mut r = Reader::new(payload);
                let update = ZoneFile::decode_from(pool.device().clone(), &mut r, &|id| {
                    pool.zone_by_id(id)
                })?;
                match pool.get_file_by_id(update.id()) {
                    Some(existing) => {
                        let before = existing.merge_update(&update)?;
                        existing.register_extents_with_zones(before);
                        // A rename is journaled as an update; the merge
                        // changed the name, the registry key follows.
                        pool.rekey_file(&existing)?;
                    }
                    None => pool.install_file(Arc::new(update))?,
                }
            }
            TAG_FILE_DELETE => {
                let mut r = Reader::new(payload);
                let id = r.get_u64()?;
                if let Some(file) = pool.remove_file_by_id(id) {
                    file.mark_for_deletion();
                    file.invalidate_extents()?;
                } else {
                    log::warn!("journal deletes unknown file id {id}");
                }
            }
            TAG_ZONE_HEAD => {
                return Err(ZoneFsError::Corruption(
                    "head record in the middle of a journal zone".to_string(),
                )
                .into());
            }
            _ => unreachable!("tag validated by next_record"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneFsOptions;
    use crate::pool::tests_support::test_device;
    use crate::zone::WriteLifetimeHint;

    fn pool_on(device: Arc<dyn crate::device::ZoneBlockDevice>) -> Arc<ZonePool> {
        Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should build pool"))
    }

    #[test]
    fn fresh_device_formats_a_journal_with_sequence_one() {
        let pool = pool_on(test_device(8));
        let journal = MetaJournal::open(pool.clone()).expect("should format");
        assert_eq!(journal.sequence(), 1);
        let current = pool
            .zone_by_id(journal.current_zone_id())
            .expect("current zone exists");
        assert!(!current.is_empty(), "head record written");
    }

    #[test]
    fn persisted_file_survives_reopen() {
        let device = test_device(8);
        {
            let pool = pool_on(device.clone());
            let journal = MetaJournal::open(pool.clone()).expect("should format");
            let file = pool.create_file("000007.sst").expect("should create");
            file.set_write_lifetime_hint(WriteLifetimeHint::Long);
            file.append(&pool, &[0xAB; 8192], 8192).expect("should append");
            journal.persist(&*file).expect("should persist");
        }

        let pool = pool_on(device);
        let journal = MetaJournal::open(pool.clone()).expect("should recover");
        assert_eq!(journal.sequence(), 1);
        let file = pool.get_file("000007.sst").expect("file recovered");
        assert_eq!(file.file_size(), 8192);
        assert_eq!(file.lifetime(), WriteLifetimeHint::Long);
        assert_eq!(file.nr_synced_extents(), file.extent_locations().len());
    }

    #[test]
    fn delete_record_removes_the_file_on_replay() {
        let device = test_device(8);
        {
            let pool = pool_on(device.clone());
            let journal = MetaJournal::open(pool.clone()).expect("should format");
            let file = pool.create_file("gone.sst").expect("should create");
            file.append(&pool, &[1u8; 4096], 4096).expect("should append");
            journal.persist(&*file).expect("should persist");

            let deleted = pool.delete_file("gone.sst").expect("should delete");
            journal.persist_delete(&deleted).expect("should journal delete");
        }

        let pool = pool_on(device);
        MetaJournal::open(pool.clone()).expect("should recover");
        assert!(pool.get_file("gone.sst").is_none());
        // Its zone bytes are reclaimable again.
        assert_eq!(pool.used_space(), 0);
    }

    #[test]
    fn torn_tail_write_is_ignored_on_replay() {
        let device = test_device(8);
        let survivor_size;
        {
            let pool = pool_on(device.clone());
            let journal = MetaJournal::open(pool.clone()).expect("should format");
            let file = pool.create_file("ok.sst").expect("should create");
            file.append(&pool, &[2u8; 4096], 4096).expect("should append");
            journal.persist(&*file).expect("should persist");
            survivor_size = file.file_size();

            // Simulate a torn record: raw zone append of garbage that
            // never got its frame completed.
            let current = pool
                .zone_by_id(journal.current_zone_id())
                .expect("current zone");
            current
                .append(&vec![0xFFu8; pool.block_size() as usize])
                .expect("raw append");
        }

        let pool = pool_on(device);
        MetaJournal::open(pool.clone()).expect("should recover past torn tail");
        let file = pool.get_file("ok.sst").expect("file recovered");
        assert_eq!(file.file_size(), survivor_size);
    }

    #[test]
    fn rotation_compacts_into_a_single_zone() {
        let device = test_device(8);
        let pool = pool_on(device);
        let journal = MetaJournal::open(pool.clone()).expect("should format");
        let file = pool.create_file("churn.sst").expect("should create");
        file.append(&pool, &[3u8; 4096], 4096).expect("should append");

        // Churn updates until the 64 KiB meta zone must rotate at least
        // once: each update record occupies one 4 KiB block.
        let start_seq = journal.sequence();
        for _ in 0..40 {
            journal.persist(&*file).expect("should persist");
        }
        assert!(journal.sequence() > start_seq, "journal rotated");

        let nonempty: Vec<u32> = pool
            .meta_zones()
            .iter()
            .filter(|z| !z.is_empty())
            .map(|z| z.id())
            .collect();
        assert_eq!(nonempty, vec![journal.current_zone_id()]);
    }
}
