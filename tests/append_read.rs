//! End-to-end append and read-back coverage: files that fit one zone,
//! files that span zones, and deletion returning space to the pool.

use std::sync::Arc;

use tempfile::TempDir;
use zonefs::{
    FileBackedZbd, Geometry, MetaJournal, ZoneFsOptions, ZonePool, ZonedRandomAccessFile,
    ZonedSequentialFile, ZonedWritableFile,
};

const BLOCK: u64 = 4096;
const ZONE: u64 = 1 << 16;

fn open_store(dir: &TempDir) -> (Arc<ZonePool>, Arc<MetaJournal>) {
    let device = Arc::new(
        FileBackedZbd::create(
            dir.path().join("zbd.img"),
            Geometry {
                block_size: BLOCK,
                zone_size: ZONE,
                nr_zones: 12,
            },
        )
        .expect("should create emulated device"),
    );
    let pool = Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should mount"));
    let journal = Arc::new(MetaJournal::open(pool.clone()).expect("should open journal"));
    (pool, journal)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn many_small_appends_read_back_byte_for_byte() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (pool, journal) = open_store(&dir);

    let file = pool.create_file("000001.log").expect("should create");
    let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
        .expect("should open for append");

    let payload = patterned(12 * 1000);
    for chunk in payload.chunks(1000) {
        handle.append(chunk).expect("should append");
    }
    handle.close().expect("should close");

    let file = pool.get_file("000001.log").expect("registered");
    assert_eq!(file.file_size(), payload.len() as u64);

    let reader = ZonedRandomAccessFile::new(file, false);
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(
        reader.read(0, &mut buf).expect("should read"),
        payload.len()
    );
    assert_eq!(buf, payload);

    // Unaligned offsets inside the file work too.
    let mut slice = vec![0u8; 777];
    assert_eq!(reader.read(4321, &mut slice).expect("should read"), 777);
    assert_eq!(slice, payload[4321..4321 + 777]);
}

#[test]
fn a_file_larger_than_a_zone_spans_extents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (pool, journal) = open_store(&dir);

    // One and a half zones of data.
    let payload = patterned((ZONE + ZONE / 2) as usize);
    let file = pool.create_file("big.sst").expect("should create");
    let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
        .expect("should open for append");
    handle.append(&payload).expect("should append");
    handle.close().expect("should close");

    let file = pool.get_file("big.sst").expect("registered");
    let locations = file.extent_locations();
    assert_eq!(locations.len(), 2, "extents: {locations:?}");
    assert_ne!(locations[0].0, locations[1].0, "extents in distinct zones");
    assert_eq!(locations[0].2, ZONE, "first extent fills its zone");

    let mut reader = ZonedSequentialFile::new(file, false);
    let mut buf = vec![0u8; payload.len()];
    let mut done = 0;
    loop {
        let n = reader.read(&mut buf[done..]).expect("should read");
        if n == 0 {
            break;
        }
        done += n;
    }
    assert_eq!(done, payload.len());
    assert_eq!(buf, payload);
}

#[test]
fn reads_past_the_end_return_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (pool, journal) = open_store(&dir);

    let file = pool.create_file("short.log").expect("should create");
    let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)
        .expect("should open for append");
    handle.append(&patterned(100)).expect("should append");
    handle.close().expect("should close");

    let file = pool.get_file("short.log").expect("registered");
    let reader = ZonedRandomAccessFile::new(file, false);

    let mut buf = vec![0u8; 64];
    assert_eq!(reader.read(1000, &mut buf).expect("past end"), 0);
    // A read straddling the end is truncated to the file size.
    assert_eq!(reader.read(80, &mut buf).expect("straddling"), 20);
}

#[test]
fn deleting_a_file_makes_its_space_reclaimable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (pool, journal) = open_store(&dir);

    let file = pool.create_file("doomed.sst").expect("should create");
    let mut handle = ZonedWritableFile::new(file, pool.clone(), journal.clone(), true)
        .expect("should open for append");
    handle.append(&patterned(8 * BLOCK as usize)).expect("append");
    handle.close().expect("should close");

    assert_eq!(pool.used_space(), 8 * BLOCK);
    assert_eq!(pool.reclaimable_space(), 0);

    let deleted = pool.delete_file("doomed.sst").expect("should delete");
    journal.persist_delete(&deleted).expect("should journal");

    assert_eq!(pool.used_space(), 0);
    assert_eq!(pool.reclaimable_space(), 8 * BLOCK);
    assert!(pool.get_file("doomed.sst").is_none());

    // The zones come back without a full cleaning pass since nothing
    // valid is left in them.
    assert!(pool.reset_unused_io_zones().expect("should reset") >= 1);
    assert_eq!(pool.reclaimable_space(), 0);
}
