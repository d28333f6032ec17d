//! # Error Kinds
//!
//! zonefs propagates errors as `eyre::Report` so call sites can attach
//! context (`wrap_err`) the same way the rest of the storage layer does.
//! Callers that need to *classify* a failure (the allocator reacting to
//! no-space, tests asserting alignment rejection) downcast to [`ZoneFsError`],
//! which enumerates the failure kinds the engine distinguishes:
//!
//! - `Io`: the device reported a failure. Appends and resets are fatal to
//!   the surrounding operation; only positioned reads may be retried.
//! - `NoSpace`: no allocatable zone after a bounded wait and a zone
//!   cleaning attempt.
//! - `NoMetadataSpace`: every metadata zone is non-empty; the metadata
//!   journal must compact before further persists can succeed.
//! - `InvalidArgument`: misaligned buffer or a positioned append at an
//!   offset other than the write pointer.
//! - `NotImplemented`: deliberately unsupported surface (`multi_read`).
//! - `Corruption`: metadata decode failure or an extent whose bounds fall
//!   outside its zone.
//! - `Unsupported`: an operation the zone model cannot express, such as
//!   truncating a file below its committed extents.
//!
//! ## Usage
//!
//! ```ignore
//! use zonefs::error::ZoneFsError;
//!
//! let err = file.positioned_append(&buf, 3000).unwrap_err();
//! assert!(matches!(
//!     err.downcast_ref::<ZoneFsError>(),
//!     Some(ZoneFsError::InvalidArgument(_))
//! ));
//! ```

use thiserror::Error;

/// Failure kinds surfaced by the zonefs core.
#[derive(Debug, Error)]
pub enum ZoneFsError {
    /// Device-level I/O failure.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No allocatable zone remains within the admission bounds.
    #[error("no space: no allocatable zone")]
    NoSpace,

    /// All metadata zones hold data; the journal must compact.
    #[error("no metadata space: all metadata zones are non-empty")]
    NoMetadataSpace,

    /// Caller violated an alignment or positioning contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Surface intentionally left unimplemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// On-disk state failed validation.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Operation the append-only zone model cannot express.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Returns the typed kind behind an `eyre::Report`, if the report was
/// built from a [`ZoneFsError`].
pub fn kind(report: &eyre::Report) -> Option<&ZoneFsError> {
    report.downcast_ref::<ZoneFsError>()
}

/// True when the report carries [`ZoneFsError::NoSpace`].
pub fn is_no_space(report: &eyre::Report) -> bool {
    matches!(kind(report), Some(ZoneFsError::NoSpace))
}
