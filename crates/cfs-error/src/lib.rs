#![forbid(unsafe_code)]
//! Error types for compactfs.
//!
//! # Error Taxonomy
//!
//! compactfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | Fixed-record format violations detected during byte parsing |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Errors surfaced to the enclosing filesystem layer |
//!
//! ## Mapping Policy: ParseError → CfsError
//!
//! `cfs-error` is intentionally independent of `cfs-types` and `cfs-ondisk`.
//! The conversion from `ParseError` to `CfsError` lives in `cfs-core`, which
//! depends on both crates. Every `ParseError` variant maps to
//! `CfsError::Corrupted`: a fixed record that cannot be decoded means the
//! image fails a structural invariant.
//!
//! ## errno Mapping
//!
//! Every `CfsError` variant maps to exactly one POSIX errno via
//! [`CfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `InvalidArgument` | `EINVAL` |
//! | `Corrupted` | `EUCLEAN` (the kernel's `EFSCORRUPTED`) |
//! | `Io` | raw OS error, else `EIO` |
//! | `TooBig` | `E2BIG` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `NotFound` | `ENOENT` |
//!
//! ## Negative Results
//!
//! A directory lookup or xattr query that finds nothing is not an error; those
//! operations return `Ok(None)`. `NotFound` is only produced by path
//! resolution, where a missing component fails the whole request.

use thiserror::Error;

/// Unified error type for all compactfs read operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// A caller-supplied ceiling or buffer size was violated, or a field the
    /// operation requires is empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The image fails a bounds, overflow, termination, or size check.
    ///
    /// `offset` is the header-relative offset of the offending region or
    /// record (0 for the header itself), kept for triage when dumping a
    /// damaged image.
    #[error("corrupted image at offset {offset}: {detail}")]
    Corrupted { offset: u64, detail: String },

    /// The backing store failed, or returned less data than promised.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's output buffer is too small.
    ///
    /// Callers are expected to discover the size with an empty buffer first
    /// and retry with at least `needed` bytes.
    #[error("output buffer too small: need {needed} bytes, have {capacity}")]
    TooBig { needed: usize, capacity: usize },

    /// The platform cannot represent the image's address width.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A path component does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CfsError {
    /// Shorthand for a `Corrupted` error with a static description.
    #[must_use]
    pub fn corrupted(offset: u64, detail: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            detail: detail.into(),
        }
    }

    /// Whether this error reports on-disk damage rather than a caller mistake.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }

    /// Convert this error into a POSIX errno for the enclosing filesystem layer.
    ///
    /// The mapping is exhaustive; every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::Corrupted { .. } => libc::EUCLEAN,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::TooBig { .. } => libc::E2BIG,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::InvalidArgument("test".into()), libc::EINVAL),
            (CfsError::corrupted(16, "test"), libc::EUCLEAN),
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CfsError::TooBig {
                    needed: 3,
                    capacity: 2,
                },
                libc::E2BIG,
            ),
            (CfsError::Unsupported("32-bit".into()), libc::EOPNOTSUPP),
            (CfsError::NotFound("etc".into()), libc::ENOENT),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = CfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::corrupted(48, "string is not NUL terminated");
        assert_eq!(
            err.to_string(),
            "corrupted image at offset 48: string is not NUL terminated"
        );

        let too_big = CfsError::TooBig {
            needed: 10,
            capacity: 4,
        };
        assert_eq!(
            too_big.to_string(),
            "output buffer too small: need 10 bytes, have 4"
        );

        let invalid = CfsError::InvalidArgument("empty payload".into());
        assert_eq!(invalid.to_string(), "invalid argument: empty payload");
    }

    #[test]
    fn corruption_is_distinguished_from_caller_errors() {
        assert!(CfsError::corrupted(0, "x").is_corruption());
        assert!(!CfsError::InvalidArgument("x".into()).is_corruption());
        assert_ne!(
            CfsError::corrupted(0, "x").to_errno(),
            CfsError::InvalidArgument("x".into()).to_errno()
        );
    }
}
