//! # File Handles
//!
//! The access-pattern views over a [`ZoneFile`]: a single writable
//! handle for appends, a sequential reader with a cursor, and a
//! positional random-access reader. At most one writable handle exists
//! per file; readers are unlimited and may coexist with the writer.
//!
//! ## Write buffering
//!
//! Zone appends must be block-multiples, so the writable handle stages
//! sub-block tails in memory. `sync` flushes every whole block and
//! journals the metadata; a partial tail stays staged, which means a
//! crash after sync preserves the synced prefix exactly. Zero padding
//! is only ever written at `close`, so concatenating a file's extents
//! always reproduces its logical bytes.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};

use crate::error::ZoneFsError;
use crate::file::ZoneFile;
use crate::meta::MetadataWriter;
use crate::pool::ZonePool;
use crate::zone::WriteLifetimeHint;

/// Append-only handle; one per file at a time.
pub struct ZonedWritableFile {
    file: Arc<ZoneFile>,
    pool: Arc<ZonePool>,
    meta: Arc<dyn MetadataWriter>,
    buffered: bool,
    /// Staged bytes shorter than one block, waiting for more data or
    /// for close.
    staging: Vec<u8>,
    /// Logical write position including staged bytes.
    position: u64,
    open: bool,
}

impl ZonedWritableFile {
    /// Opens the file for appending. `buffered` allows writes of any
    /// size; unbuffered handles require block-multiple writes (direct
    /// I/O callers already align). Fails if a writable handle is
    /// already open, or when resuming a file whose size is not
    /// block-aligned.
    pub fn new(
        file: Arc<ZoneFile>,
        pool: Arc<ZonePool>,
        meta: Arc<dyn MetadataWriter>,
        buffered: bool,
    ) -> Result<Self> {
        let size = file.file_size();
        ensure!(
            size % file.block_size() == 0,
            ZoneFsError::Unsupported(format!(
                "cannot reopen '{}' for append: size {size} has an unaligned tail",
                file.filename()
            ))
        );
        ensure!(
            file.acquire_appender(),
            ZoneFsError::InvalidArgument(format!(
                "'{}' is already open for append",
                file.filename()
            ))
        );
        Ok(Self {
            file,
            pool,
            meta,
            buffered,
            staging: Vec::new(),
            position: size,
            open: true,
        })
    }

    /// Logical size including staged bytes.
    pub fn size(&self) -> u64 {
        self.position
    }

    /// Unbuffered handles take block-aligned writes straight to the
    /// device, so the upper layer must treat them as direct I/O.
    pub fn use_direct_io(&self) -> bool {
        !self.buffered
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            self.open,
            ZoneFsError::InvalidArgument("append on a closed handle".to_string())
        );
        let block = self.file.block_size() as usize;

        if !self.buffered {
            ensure!(
                data.len() % block == 0,
                ZoneFsError::InvalidArgument(format!(
                    "unbuffered append of {} bytes is not block-aligned",
                    data.len()
                ))
            );
            self.file.append(&self.pool, data, data.len() as u64)?;
            self.position += data.len() as u64;
            return Ok(());
        }

        self.staging.extend_from_slice(data);
        self.position += data.len() as u64;
        self.flush_whole_blocks()
    }

    /// Append that re-states the target offset; the upper layer uses it
    /// to detect lost writes. Anything but the current end of file is
    /// rejected.
    pub fn positioned_append(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(
            offset == self.position,
            ZoneFsError::InvalidArgument(format!(
                "positioned append at {offset}, write position is {}",
                self.position
            ))
        );
        self.append(data)
    }

    /// Only whole-file no-op truncation is possible on zone extents;
    /// shrinking would need to rewrite sealed zones.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        ensure!(
            size == self.position,
            ZoneFsError::Unsupported(format!(
                "truncate to {size} (size {}): zone extents cannot shrink",
                self.position
            ))
        );
        Ok(())
    }

    /// Flushes every staged whole block and journals the file's extent
    /// list. A sub-block tail stays staged: after a crash the file comes
    /// back as exactly the synced prefix.
    pub fn sync(&mut self) -> Result<()> {
        ensure!(
            self.open,
            ZoneFsError::InvalidArgument("sync on a closed handle".to_string())
        );
        self.flush_whole_blocks()?;
        self.meta
            .persist(&self.file)
            .wrap_err_with(|| format!("syncing metadata for '{}'", self.file.filename()))
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.sync()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sync()
    }

    /// Extents are device-contiguous and appended in order, so a ranged
    /// sync can only be the full sync.
    pub fn range_sync(&mut self, _offset: u64, _length: u64) -> Result<()> {
        self.sync()
    }

    pub fn set_write_lifetime_hint(&self, lifetime: WriteLifetimeHint) {
        self.file.set_write_lifetime_hint(lifetime);
    }

    pub fn set_min_max_key_and_level(
        &self,
        smallest: &[u8],
        largest: &[u8],
        level: i32,
        sst_number: u64,
    ) {
        self.file
            .set_min_max_key_and_level(smallest, largest, level, sst_number);
    }

    /// Pads and flushes the staged tail, seals the extent list, and
    /// releases the zone and the appender slot.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        if !self.staging.is_empty() {
            let valid = self.staging.len() as u64;
            let block = self.file.block_size() as usize;
            let padded = self.staging.len().div_ceil(block) * block;
            self.staging.resize(padded, 0);
            let staged = std::mem::take(&mut self.staging);
            self.file.append(&self.pool, &staged, valid)?;
        }

        self.file.close_wr(&self.pool)?;
        self.meta
            .persist(&self.file)
            .wrap_err_with(|| format!("closing '{}'", self.file.filename()))
    }

    fn flush_whole_blocks(&mut self) -> Result<()> {
        let block = self.file.block_size() as usize;
        let whole = (self.staging.len() / block) * block;
        if whole == 0 {
            return Ok(());
        }
        self.file
            .append(&self.pool, &self.staging[..whole], whole as u64)?;
        self.staging.drain(..whole);
        Ok(())
    }
}

impl Drop for ZonedWritableFile {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.close() {
                log::error!(
                    "closing '{}' on drop failed: {err:#}",
                    self.file.filename()
                );
            }
        }
    }
}

/// Cursor-based reader.
pub struct ZonedSequentialFile {
    file: Arc<ZoneFile>,
    position: u64,
    direct: bool,
}

impl ZonedSequentialFile {
    pub fn new(file: Arc<ZoneFile>, direct: bool) -> Self {
        Self {
            file,
            position: 0,
            direct,
        }
    }

    /// Reads from the cursor, crossing extent boundaries as needed.
    /// Returns the bytes read; 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = read_full(&self.file, self.position, buf, self.direct)?;
        self.position += n as u64;
        Ok(n)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        let target = self.position.checked_add(n);
        ensure!(
            target.is_some_and(|t| t <= self.file.file_size()),
            ZoneFsError::InvalidArgument(format!(
                "skip of {n} bytes past end of '{}'",
                self.file.filename()
            ))
        );
        self.position += n;
        Ok(())
    }

    /// One-shot read at an absolute offset; the cursor does not move.
    pub fn positioned_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        read_full(&self.file, offset, buf, self.direct)
    }

    /// True when the handle was opened for direct reads.
    pub fn use_direct_io(&self) -> bool {
        self.direct
    }
}

/// A batched random-access request; filled in by `multi_read` when it
/// gains a real implementation.
pub struct ReadRequest {
    pub offset: u64,
    pub buf: Vec<u8>,
}

/// Positional reader for table readers.
pub struct ZonedRandomAccessFile {
    file: Arc<ZoneFile>,
    direct: bool,
}

impl ZonedRandomAccessFile {
    pub fn new(file: Arc<ZoneFile>, direct: bool) -> Self {
        Self { file, direct }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        read_full(&self.file, offset, buf, self.direct)
    }

    /// Batched reads are not wired up; callers fall back to `read`.
    pub fn multi_read(&self, _requests: &mut [ReadRequest]) -> Result<()> {
        Err(ZoneFsError::NotImplemented("batched multi-read").into())
    }

    /// Readahead hint; extents are device-contiguous so there is nothing
    /// to stage.
    pub fn prefetch(&self, _offset: u64, _length: u64) -> Result<()> {
        Ok(())
    }

    pub fn get_unique_id(&self) -> [u8; 16] {
        self.file.get_unique_id()
    }

    /// Table readers address extents by device offset; random access is
    /// always reported as direct I/O.
    pub fn use_direct_io(&self) -> bool {
        true
    }
}

/// Loops `positioned_read` across extent boundaries until `buf` is full
/// or the file ends.
fn read_full(file: &ZoneFile, offset: u64, buf: &mut [u8], direct: bool) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.positioned_read(offset + done as u64, &mut buf[done..], direct)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneFsOptions;
    use crate::meta::MetaJournal;
    use crate::pool::tests_support::test_device;

    fn fixture() -> (Arc<ZonePool>, Arc<MetaJournal>) {
        let device = test_device(8);
        let pool =
            Arc::new(ZonePool::new(device, ZoneFsOptions::small()).expect("should build pool"));
        let journal = Arc::new(MetaJournal::open(pool.clone()).expect("should format"));
        (pool, journal)
    }

    fn writable(
        pool: &Arc<ZonePool>,
        journal: &Arc<MetaJournal>,
        name: &str,
    ) -> ZonedWritableFile {
        let file = pool.create_file(name).expect("should create");
        ZonedWritableFile::new(file, pool.clone(), journal.clone(), true)
            .expect("should open writable")
    }

    #[test]
    fn small_appends_coalesce_and_pad_only_at_close() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "wal.log");

        for i in 0..10u8 {
            w.append(&vec![i; 1000]).expect("should append");
        }
        assert_eq!(w.size(), 10_000);
        w.close().expect("should close");

        let file = pool.get_file("wal.log").expect("registered");
        assert_eq!(file.file_size(), 10_000);

        let reader = ZonedRandomAccessFile::new(file, false);
        let mut buf = vec![0u8; 10_000];
        assert_eq!(reader.read(0, &mut buf).expect("should read"), 10_000);
        for i in 0..10usize {
            assert!(buf[i * 1000..(i + 1) * 1000].iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn sync_persists_whole_blocks_and_keeps_the_tail_staged() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "tail.log");

        w.append(&[7u8; 5000]).expect("should append");
        w.sync().expect("should sync");

        // One whole block flushed and journaled, 904 bytes staged.
        let file = pool.get_file("tail.log").expect("registered");
        assert_eq!(file.file_size(), 4096);
        assert_eq!(file.nr_synced_extents(), 1);

        w.close().expect("should close");
        assert_eq!(file.file_size(), 5000);
    }

    #[test]
    fn only_one_writable_handle_per_file() {
        let (pool, journal) = fixture();
        let file = pool.create_file("solo.sst").expect("should create");

        let _first =
            ZonedWritableFile::new(file.clone(), pool.clone(), journal.clone(), true)
                .expect("first handle");
        let err = match ZonedWritableFile::new(file, pool.clone(), journal.clone(), true) {
            Ok(_) => panic!("second writable handle must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn positioned_append_rejects_gaps() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "gap.log");
        w.positioned_append(0, &[1u8; 100]).expect("at the end");

        let err = w.positioned_append(4096, &[1u8; 100]).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::InvalidArgument(_))
        ));
        w.positioned_append(100, &[1u8; 100]).expect("at the end");
    }

    #[test]
    fn truncate_shrink_is_unsupported() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "trunc.log");
        w.append(&[0u8; 8192]).expect("should append");

        w.truncate(8192).expect("no-op truncate");
        let err = w.truncate(4096).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::Unsupported(_))
        ));
    }

    #[test]
    fn unbuffered_appends_must_be_aligned() {
        let (pool, journal) = fixture();
        let file = pool.create_file("direct.sst").expect("should create");
        let mut w = ZonedWritableFile::new(file, pool.clone(), journal.clone(), false)
            .expect("should open");

        assert!(w.append(&[0u8; 4096]).is_ok());
        let err = w.append(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sequential_reader_tracks_its_cursor() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "seq.log");
        let payload: Vec<u8> = (0..8192u32).map(|i| i as u8).collect();
        w.append(&payload).expect("should append");
        w.close().expect("should close");

        let file = pool.get_file("seq.log").expect("registered");
        let mut reader = ZonedSequentialFile::new(file, false);

        let mut head = vec![0u8; 100];
        assert_eq!(reader.read(&mut head).expect("read"), 100);
        assert_eq!(head, payload[..100]);

        reader.skip(1000).expect("should skip");
        let mut mid = vec![0u8; 100];
        assert_eq!(reader.read(&mut mid).expect("read"), 100);
        assert_eq!(mid, payload[1100..1200]);

        assert!(reader.skip(1 << 20).is_err());
    }

    #[test]
    fn multi_read_is_not_implemented() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "mr.sst");
        w.append(&[0u8; 4096]).expect("should append");
        w.close().expect("should close");

        let reader = ZonedRandomAccessFile::new(pool.get_file("mr.sst").expect("file"), false);
        let err = reader.multi_read(&mut []).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::NotImplemented(_))
        ));
        reader.prefetch(0, 4096).expect("prefetch is a no-op");
    }

    #[test]
    fn skip_rejects_counts_that_overflow_the_cursor() {
        let (pool, journal) = fixture();
        let mut w = writable(&pool, &journal, "huge.log");
        let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        w.append(&payload).expect("should append");
        w.close().expect("should close");

        let mut reader = ZonedSequentialFile::new(pool.get_file("huge.log").expect("file"), false);
        reader.skip(100).expect("should skip");

        let err = reader.skip(u64::MAX).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(ZoneFsError::InvalidArgument(_))
        ));

        // The failed skip leaves the cursor where it was.
        let mut buf = vec![0u8; 16];
        assert_eq!(reader.read(&mut buf).expect("read"), 16);
        assert_eq!(buf, payload[100..116]);
    }

    #[test]
    fn handles_report_their_direct_io_mode() {
        let (pool, journal) = fixture();

        let mut buffered = writable(&pool, &journal, "mode.log");
        assert!(!buffered.use_direct_io());
        buffered.append(&[0u8; 4096]).expect("should append");
        buffered.close().expect("should close");

        let raw = pool.create_file("mode.sst").expect("should create");
        let unbuffered = ZonedWritableFile::new(raw, pool.clone(), journal.clone(), false)
            .expect("should open");
        assert!(unbuffered.use_direct_io());
        drop(unbuffered);

        let file = pool.get_file("mode.log").expect("registered");
        assert!(!ZonedSequentialFile::new(file.clone(), false).use_direct_io());
        assert!(ZonedSequentialFile::new(file.clone(), true).use_direct_io());
        assert!(ZonedRandomAccessFile::new(file, false).use_direct_io());
    }
}
