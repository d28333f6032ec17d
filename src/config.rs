//! # Configuration
//!
//! Mount-time options for the zone pool. Zoned devices advertise hard
//! limits on how many zones may be open (accepting appends) or active
//! (holding unreset data) at once; the pool enforces those limits through
//! admission control, and the remaining knobs tune when zones are finished
//! early and when zone cleaning kicks in.
//!
//! Per-handle options (direct vs buffered reads, buffered writes) travel
//! with the file handle constructors in [`crate::io`], not here.

use std::time::Duration;

/// Mount-time configuration for a [`crate::pool::ZonePool`].
#[derive(Debug, Clone)]
pub struct ZoneFsOptions {
    /// Cap on simultaneously open I/O zones (zones accepting appends).
    pub max_open_zones: u32,
    /// Cap on active I/O zones (zones holding written, unreset data).
    pub max_active_zones: u32,
    /// Zones whose remaining capacity falls below this percentage are
    /// proactively finished so they stop counting against the active cap.
    pub finish_threshold_pct: u8,
    /// I/O zones held back empty as landing space for zone cleaning.
    pub reserved_zones_for_gc: u8,
    /// Zones reserved at the front of the device for the metadata journal.
    pub meta_zone_count: u8,
    /// Free-space watermark (percent of I/O capacity) below which the
    /// allocator triggers zone cleaning.
    pub gc_trigger_free_pct: u8,
    /// Bound on how long `allocate_zone` waits for open/active slack
    /// before attempting zone cleaning and surfacing no-space.
    pub allocation_wait: Duration,
}

impl Default for ZoneFsOptions {
    fn default() -> Self {
        Self {
            max_open_zones: 12,
            max_active_zones: 12,
            finish_threshold_pct: 0,
            reserved_zones_for_gc: 2,
            meta_zone_count: 3,
            gc_trigger_free_pct: 20,
            allocation_wait: Duration::from_millis(500),
        }
    }
}

impl ZoneFsOptions {
    /// Options sized for small emulated devices in tests: tight quotas,
    /// a single reserved zone, and short admission waits.
    pub fn small() -> Self {
        Self {
            max_open_zones: 2,
            max_active_zones: 8,
            reserved_zones_for_gc: 1,
            meta_zone_count: 2,
            allocation_wait: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_quotas_positive() {
        let opts = ZoneFsOptions::default();
        assert!(opts.max_open_zones > 0);
        assert!(opts.max_active_zones >= opts.max_open_zones);
        assert!(opts.meta_zone_count >= 1);
    }

    #[test]
    fn small_profile_tightens_open_quota() {
        let opts = ZoneFsOptions::small();
        assert_eq!(opts.max_open_zones, 2);
        assert!(opts.allocation_wait < ZoneFsOptions::default().allocation_wait);
    }
}
