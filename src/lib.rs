//! # ZoneFS - LSM Storage Engine for Zoned Block Devices
//!
//! ZoneFS places the files of an LSM-tree store directly onto a zoned
//! block device: a device whose address space is divided into zones that
//! only accept sequential writes at a per-zone write pointer and must be
//! reset as a whole to be rewritten. Instead of hiding those rules
//! behind a generic filesystem, ZoneFS embraces them - files are ordered
//! lists of extents, extents land wherever the allocator steers them,
//! and space comes back through zone cleaning rather than block-level
//! free lists.
//!
//! ## Quick Start
//!
//! ```ignore
//! use zonefs::{FileBackedZbd, Geometry, MetaJournal, ZoneCleaner, ZonePool,
//!              ZoneFsOptions, ZonedWritableFile};
//! use std::sync::Arc;
//!
//! let device = Arc::new(FileBackedZbd::create("./zbd.img", Geometry {
//!     block_size: 4096,
//!     zone_size: 1 << 28,
//!     nr_zones: 64,
//! })?);
//! let pool = Arc::new(ZonePool::new(device, ZoneFsOptions::default())?);
//! let journal = Arc::new(MetaJournal::open(pool.clone())?);
//! let cleaner = ZoneCleaner::new(pool.clone(), journal.clone());
//!
//! let file = pool.create_file("000042.sst")?;
//! let mut handle = ZonedWritableFile::new(file, pool.clone(), journal, true)?;
//! handle.append(b"table bytes")?;
//! handle.sync()?;
//! handle.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  File Handles (writable / seq / random)   │   io
//! ├───────────────────────────────────────────┤
//! │  ZoneFile: extent lists, metadata codec   │   file
//! ├──────────────────────────┬────────────────┤
//! │  ZonePool: allocation,   │  MetaJournal:  │   pool, meta
//! │  quotas, file registry   │  record log    │
//! ├──────────────────────────┴────────────────┤
//! │  ZoneCleaner: victim selection, migration │   reclaim
//! ├───────────────────────────────────────────┤
//! │  Zone: write pointer, extent back-refs    │   zone
//! ├───────────────────────────────────────────┤
//! │  ZoneBlockDevice trait + file emulation   │   device
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Data reaches the device on every zone append. Metadata (which bytes
//! belong to which file) reaches the device when a handle syncs or
//! closes, as delta records in a CRC-framed journal. After a crash a
//! file is exactly its last-synced prefix; the journal replays from the
//! newest metadata zone and ignores torn tails.

pub mod config;
pub mod device;
pub mod encoding;
pub mod error;
pub mod file;
pub mod io;
pub mod meta;
pub mod pool;
pub mod reclaim;
pub mod zone;

pub use config::ZoneFsOptions;
pub use device::{FileBackedZbd, Geometry, ZoneBlockDevice, ZoneInfo, ZoneKind};
pub use error::ZoneFsError;
pub use file::{ZoneExtent, ZoneFile};
pub use io::{ZonedRandomAccessFile, ZonedSequentialFile, ZonedWritableFile};
pub use meta::{MetaJournal, MetadataWriter};
pub use pool::ZonePool;
pub use reclaim::ZoneCleaner;
pub use zone::{WriteLifetimeHint, Zone, ZoneExtentInfo};
