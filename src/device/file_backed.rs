//! # File-Backed ZBD Emulation
//!
//! Emulates a zoned block device over a regular file: a fixed geometry of
//! `nr_zones` zones of `zone_size` bytes, block granularity `block_size`,
//! and per-zone write pointers enforced in software. The backing file is
//! allocated at full device size up front so positioned reads never see a
//! short file.
//!
//! ## Write-Pointer Persistence
//!
//! Real devices keep write pointers in hardware and report them through
//! the zone report. The emulation persists them in a small sidecar file
//! (`<path>.zones`) rewritten on every append, reset, and finish, so a
//! reopened device reports the same state a real ZBD would after power
//! cycling. The sidecar is bookkeeping for the emulation only; it is not
//! part of the on-device format.
//!
//! ## Descriptors
//!
//! Two read descriptors are kept open, mirroring the buffered/direct
//! split of production deployments. The emulation cannot promise page
//! cache bypass, but routing through distinct descriptors keeps the
//! calling convention identical.
//!
//! ## Thread Safety
//!
//! Zone state sits behind a `parking_lot::Mutex`; positioned reads and
//! writes go through `FileExt` and need no locking of their own.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use super::{ZoneBlockDevice, ZoneInfo, ZoneKind};

const SIDECAR_MAGIC: &[u8; 8] = b"ZFSZONES";

/// Geometry of an emulated device.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_size: u64,
    pub zone_size: u64,
    pub nr_zones: u32,
}

struct ZoneState {
    write_pointer: u64,
}

/// Zoned block device emulated over a regular file.
pub struct FileBackedZbd {
    geometry: Geometry,
    data: File,
    data_direct: File,
    sidecar_path: PathBuf,
    zones: Mutex<Vec<ZoneState>>,
}

impl FileBackedZbd {
    /// Creates a fresh emulated device. Fails if the backing file exists.
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let path = path.as_ref();
        Self::validate_geometry(&geometry)?;
        ensure!(
            !path.exists(),
            "backing file '{}' already exists",
            path.display()
        );

        let data = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create backing file '{}'", path.display()))?;
        data.set_len(geometry.zone_size * u64::from(geometry.nr_zones))
            .wrap_err("failed to size backing file")?;

        let zones = (0..geometry.nr_zones)
            .map(|i| ZoneState {
                write_pointer: u64::from(i) * geometry.zone_size,
            })
            .collect();

        let dev = Self {
            data_direct: File::open(path)
                .wrap_err("failed to open direct read descriptor")?,
            data,
            sidecar_path: Self::sidecar_path(path),
            geometry,
            zones: Mutex::new(zones),
        };
        dev.persist_sidecar()?;
        Ok(dev)
    }

    /// Reopens an existing emulated device, restoring write pointers from
    /// the sidecar.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open backing file '{}'", path.display()))?;

        let sidecar_path = Self::sidecar_path(path);
        let (geometry, wps) = Self::load_sidecar(&sidecar_path)?;

        let zones = wps
            .into_iter()
            .map(|write_pointer| ZoneState { write_pointer })
            .collect();

        Ok(Self {
            data_direct: File::open(path)
                .wrap_err("failed to open direct read descriptor")?,
            data,
            sidecar_path,
            geometry,
            zones: Mutex::new(zones),
        })
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(".zones");
        PathBuf::from(s)
    }

    fn validate_geometry(g: &Geometry) -> Result<()> {
        ensure!(g.block_size > 0, "block size must be non-zero");
        ensure!(
            g.zone_size % g.block_size == 0,
            "zone size {} is not a multiple of block size {}",
            g.zone_size,
            g.block_size
        );
        ensure!(g.nr_zones > 0, "device must have at least one zone");
        Ok(())
    }

    fn persist_sidecar(&self) -> Result<()> {
        let zones = self.zones.lock();
        let mut buf = Vec::with_capacity(8 + 24 + zones.len() * 8);
        buf.extend_from_slice(SIDECAR_MAGIC);
        buf.extend_from_slice(&self.geometry.block_size.to_le_bytes());
        buf.extend_from_slice(&self.geometry.zone_size.to_le_bytes());
        buf.extend_from_slice(&u64::from(self.geometry.nr_zones).to_le_bytes());
        for z in zones.iter() {
            buf.extend_from_slice(&z.write_pointer.to_le_bytes());
        }
        std::fs::write(&self.sidecar_path, &buf)
            .wrap_err_with(|| format!("failed to write sidecar '{}'", self.sidecar_path.display()))
    }

    fn load_sidecar(path: &Path) -> Result<(Geometry, Vec<u64>)> {
        let buf = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read sidecar '{}'", path.display()))?;
        ensure!(
            buf.len() >= 32 && &buf[..8] == SIDECAR_MAGIC,
            "sidecar '{}' is malformed",
            path.display()
        );

        let word = |i: usize| u64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        let geometry = Geometry {
            block_size: word(8),
            zone_size: word(16),
            nr_zones: word(24) as u32,
        };

        let expected = 32 + geometry.nr_zones as usize * 8;
        ensure!(
            buf.len() == expected,
            "sidecar '{}' has {} bytes, expected {}",
            path.display(),
            buf.len(),
            expected
        );

        let wps = (0..geometry.nr_zones as usize)
            .map(|i| word(32 + i * 8))
            .collect();
        Ok((geometry, wps))
    }

    fn zone_index(&self, zone_start: u64) -> Result<usize> {
        ensure!(
            zone_start % self.geometry.zone_size == 0,
            "offset {} is not a zone start",
            zone_start
        );
        let idx = (zone_start / self.geometry.zone_size) as usize;
        ensure!(
            idx < self.geometry.nr_zones as usize,
            "zone start {} is past the end of the device",
            zone_start
        );
        Ok(idx)
    }
}

impl ZoneBlockDevice for FileBackedZbd {
    fn block_size(&self) -> u64 {
        self.geometry.block_size
    }

    fn zone_size(&self) -> u64 {
        self.geometry.zone_size
    }

    fn nr_zones(&self) -> u32 {
        self.geometry.nr_zones
    }

    fn enumerate_zones(&self) -> Result<Vec<ZoneInfo>> {
        let zones = self.zones.lock();
        Ok(zones
            .iter()
            .enumerate()
            .map(|(i, z)| ZoneInfo {
                start: i as u64 * self.geometry.zone_size,
                max_capacity: self.geometry.zone_size,
                write_pointer: z.write_pointer,
                kind: ZoneKind::SequentialWriteRequired,
            })
            .collect())
    }

    fn append(&self, zone_start: u64, buf: &[u8]) -> Result<u64> {
        ensure!(
            buf.len() as u64 % self.geometry.block_size == 0,
            "append of {} bytes is not block-aligned (block size {})",
            buf.len(),
            self.geometry.block_size
        );

        let idx = self.zone_index(zone_start)?;
        let wp = {
            let mut zones = self.zones.lock();
            let zone = &mut zones[idx];
            let end = zone_start + self.geometry.zone_size;
            ensure!(
                zone.write_pointer + buf.len() as u64 <= end,
                "append of {} bytes overflows zone at {} (wp {}, end {})",
                buf.len(),
                zone_start,
                zone.write_pointer,
                end
            );
            let wp = zone.write_pointer;
            zone.write_pointer += buf.len() as u64;
            wp
        };

        self.data
            .write_all_at(buf, wp)
            .wrap_err_with(|| format!("device append failed at offset {wp}"))?;
        self.persist_sidecar()?;
        Ok(wp)
    }

    fn reset(&self, zone_start: u64) -> Result<()> {
        let idx = self.zone_index(zone_start)?;
        self.zones.lock()[idx].write_pointer = zone_start;
        self.persist_sidecar()
    }

    fn finish(&self, zone_start: u64) -> Result<()> {
        let idx = self.zone_index(zone_start)?;
        self.zones.lock()[idx].write_pointer = zone_start + self.geometry.zone_size;
        self.persist_sidecar()
    }

    fn close(&self, _zone_start: u64) -> Result<()> {
        // The emulation has no hardware open-zone table to release.
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8], direct: bool) -> Result<usize> {
        let end = self.geometry.zone_size * u64::from(self.geometry.nr_zones);
        ensure!(
            offset + buf.len() as u64 <= end,
            "read of {} bytes at {} is past device end {}",
            buf.len(),
            offset,
            end
        );

        let fd = if direct { &self.data_direct } else { &self.data };
        fd.read_exact_at(buf, offset)
            .wrap_err_with(|| format!("device read failed at offset {offset}"))?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        self.data.sync_all().wrap_err("device sync failed")
    }
}
