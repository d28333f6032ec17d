//! # Device Adapter
//!
//! Thin contract over a zoned block device (ZBD). A ZBD divides its
//! address space into fixed-size zones; each zone accepts only sequential
//! writes at a monotonically advancing write pointer and is erased by
//! resetting the whole zone. The rest of the crate talks to the device
//! exclusively through the [`ZoneBlockDevice`] trait:
//!
//! - `enumerate_zones`: one-shot zone report consumed at mount.
//! - `append`: sequential write of a block-aligned buffer at the zone's
//!   write pointer; returns the device offset the data landed at.
//! - `reset` / `finish` / `close`: ZBD zone state transitions.
//! - `read_at`: positioned read through either the buffered or the
//!   direct descriptor, selected per call.
//!
//! ## Failure Contract
//!
//! Every failure surfaces as an I/O error report. Callers may retry
//! `read_at`; a failed `append` or `reset` is fatal to the surrounding
//! logical operation and must be propagated.
//!
//! ## Implementations
//!
//! Production deployments bind this trait to a kernel zoned block device;
//! that driver is an external collaborator and lives outside this crate.
//! [`FileBackedZbd`] emulates the contract over a regular file and backs
//! every test in the crate.

mod file_backed;

pub use file_backed::{FileBackedZbd, Geometry};

use eyre::Result;

/// Zone classification from the device report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// Random-write region; not managed by the zone pool.
    Conventional,
    /// Sequential-write-required zone with a write pointer.
    SequentialWriteRequired,
}

/// One entry of the mount-time zone report.
#[derive(Debug, Clone, Copy)]
pub struct ZoneInfo {
    /// Device byte offset where the zone starts.
    pub start: u64,
    /// Writable capacity in bytes.
    pub max_capacity: u64,
    /// Current write pointer, `start..=start + max_capacity`.
    pub write_pointer: u64,
    pub kind: ZoneKind,
}

/// Contract the core consumes from the zoned block device driver.
pub trait ZoneBlockDevice: Send + Sync {
    /// Device block size; all appends are multiples of this.
    fn block_size(&self) -> u64;

    /// Zone size (power-of-two multiple of the block size).
    fn zone_size(&self) -> u64;

    fn nr_zones(&self) -> u32;

    /// Zone report, ordered by start offset. Consumed once at mount.
    fn enumerate_zones(&self) -> Result<Vec<ZoneInfo>>;

    /// Sequentially writes `buf` at the zone's write pointer. `buf` must
    /// be a multiple of [`block_size`](Self::block_size) long. Returns the
    /// device offset the write landed at.
    fn append(&self, zone_start: u64, buf: &[u8]) -> Result<u64>;

    /// Rewinds the zone's write pointer to its start, discarding contents.
    fn reset(&self, zone_start: u64) -> Result<()>;

    /// Advances the write pointer to the zone end; the zone stops counting
    /// against the device's open/active budget.
    fn finish(&self, zone_start: u64) -> Result<()>;

    /// Transitions an open zone to closed without filling it.
    fn close(&self, zone_start: u64) -> Result<()>;

    /// Positioned read at an absolute device offset. `direct` selects the
    /// direct descriptor, bypassing the page cache where the device
    /// supports it. Returns bytes read; only this operation is retryable.
    fn read_at(&self, offset: u64, buf: &mut [u8], direct: bool) -> Result<usize>;

    /// Flushes device write caches.
    fn sync(&self) -> Result<()>;
}
