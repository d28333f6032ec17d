//! Crash and recovery behaviour: a recovered file is exactly its
//! last-synced prefix, and journal deltas replayed over snapshots
//! rebuild the full extent list.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use zonefs::{
    FileBackedZbd, Geometry, MetaJournal, MetadataWriter, ZoneFsOptions, ZonePool,
    ZonedRandomAccessFile, ZonedWritableFile,
};

const BLOCK: u64 = 4096;

fn create_store(path: &Path) -> (Arc<ZonePool>, Arc<MetaJournal>) {
    let device = Arc::new(
        FileBackedZbd::create(
            path,
            Geometry {
                block_size: BLOCK,
                zone_size: 1 << 16,
                nr_zones: 12,
            },
        )
        .expect("should create emulated device"),
    );
    let pool = Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should mount"));
    let journal = Arc::new(MetaJournal::open(pool.clone()).expect("should open journal"));
    (pool, journal)
}

fn reopen_store(path: &Path) -> (Arc<ZonePool>, Arc<MetaJournal>) {
    let device = Arc::new(FileBackedZbd::open(path).expect("should reopen device"));
    let pool = Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should remount"));
    let journal = Arc::new(MetaJournal::open(pool.clone()).expect("should recover journal"));
    (pool, journal)
}

fn zbd_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("zbd.img")
}

#[test]
fn a_crashed_writer_leaves_exactly_the_synced_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = zbd_path(&dir);

    {
        let (pool, journal) = create_store(&path);
        let file = pool.create_file("wal.log").expect("should create");
        let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
            .expect("should open for append");

        handle.append(&[0xAA; 3 * BLOCK as usize]).expect("append");
        handle.sync().expect("should sync");

        // More data the crash will eat: never synced, never closed.
        handle.append(&[0xBB; 2 * BLOCK as usize]).expect("append");
        std::mem::forget(handle);
    }

    let (pool, _journal) = reopen_store(&path);
    let file = pool.get_file("wal.log").expect("file survives the crash");
    assert_eq!(file.file_size(), 3 * BLOCK, "only the synced prefix");

    let reader = ZonedRandomAccessFile::new(file, false);
    let mut buf = vec![0u8; 3 * BLOCK as usize];
    assert_eq!(
        reader.read(0, &mut buf).expect("should read"),
        3 * BLOCK as usize
    );
    assert!(buf.iter().all(|&b| b == 0xAA));
}

#[test]
fn a_partial_tail_is_not_durable_until_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = zbd_path(&dir);

    {
        let (pool, journal) = create_store(&path);
        let file = pool.create_file("tail.log").expect("should create");
        let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
            .expect("should open for append");

        // One whole block plus 700 staged bytes; sync flushes only the
        // block, the tail stays in memory.
        handle.append(&[0xCC; BLOCK as usize + 700]).expect("append");
        handle.sync().expect("should sync");
        std::mem::forget(handle);
    }

    let (pool, _journal) = reopen_store(&path);
    let file = pool.get_file("tail.log").expect("file recovered");
    assert_eq!(file.file_size(), BLOCK, "staged tail lost with the crash");
}

#[test]
fn deltas_replayed_over_the_snapshot_rebuild_every_extent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = zbd_path(&dir);
    let mut payload = Vec::new();

    {
        let (pool, journal) = create_store(&path);
        let file = pool.create_file("layered.sst").expect("should create");
        let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
            .expect("should open for append");

        // Each sync seals the in-progress extent, so five rounds build
        // five extents journaled across five delta records.
        for round in 0..5u8 {
            let chunk = vec![round + 1; BLOCK as usize];
            handle.append(&chunk).expect("append");
            handle.sync().expect("sync");
            payload.extend_from_slice(&chunk);
        }
        handle.close().expect("close");
    }

    let (pool, _journal) = reopen_store(&path);
    let file = pool.get_file("layered.sst").expect("file recovered");
    assert_eq!(file.file_size(), payload.len() as u64);
    assert_eq!(file.extent_locations().len(), 5);

    let reader = ZonedRandomAccessFile::new(file, false);
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(
        reader.read(0, &mut buf).expect("should read"),
        payload.len()
    );
    assert_eq!(buf, payload);
}

#[test]
fn renames_and_deletes_survive_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = zbd_path(&dir);

    {
        let (pool, journal) = create_store(&path);

        let keep = pool.create_file("000010.sst").expect("create keep");
        let mut handle =
            ZonedWritableFile::new(keep, pool.clone(), journal.clone(), true).expect("open keep");
        handle.append(&[0x11; BLOCK as usize]).expect("append");
        handle.close().expect("close");

        let gone = pool.create_file("000011.sst").expect("create gone");
        let mut handle =
            ZonedWritableFile::new(gone, pool.clone(), journal.clone(), true).expect("open gone");
        handle.append(&[0x22; BLOCK as usize]).expect("append");
        handle.close().expect("close");

        let renamed = pool
            .rename_file("000010.sst", "000012.sst")
            .expect("should rename");
        journal.persist(&renamed).expect("journal rename");

        let deleted = pool.delete_file("000011.sst").expect("should delete");
        journal.persist_delete(&deleted).expect("journal delete");
    }

    let (pool, _journal) = reopen_store(&path);
    assert!(pool.get_file("000010.sst").is_none());
    assert!(pool.get_file("000011.sst").is_none());
    let file = pool.get_file("000012.sst").expect("renamed file recovered");
    assert_eq!(file.file_size(), BLOCK);
    assert_eq!(pool.used_space(), BLOCK, "deleted file freed its bytes");
}
