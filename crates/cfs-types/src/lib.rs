#![forbid(unsafe_code)]
//! Shared constants, parse errors, and checked byte helpers for compactfs.

use thiserror::Error;

// ── Image geometry ──────────────────────────────────────────────────────────

/// On-disk format version understood by this decoder.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the fixed image header at blob offset 0.
pub const HEADER_SIZE: u64 = 16;
/// Size of one inode record.
pub const INODE_SIZE: u64 = 32;
/// Size of one inode-metadata record.
pub const INODE_METADATA_SIZE: u64 = 24;
/// Size of one directory entry record.
pub const DENTRY_SIZE: u64 = 16;
/// Size of one extended-attribute header record.
pub const XATTR_HEADER_SIZE: u64 = 16;
/// Size of an on-disk region descriptor (`off: u32`, `len: u32`).
pub const REGION_DESCRIPTOR_SIZE: usize = 8;

/// Smallest blob that can hold a header and a root inode.
pub const MIN_IMAGE_SIZE: u64 = HEADER_SIZE + INODE_SIZE;

// ── Limits ──────────────────────────────────────────────────────────────────

/// Ceiling on a dentry name descriptor, NUL terminator included.
pub const NAME_MAX: usize = 255;
/// Ceiling on an extended-attribute key.
pub const XATTR_NAME_MAX: usize = 255;
/// Ceiling on a payload path descriptor, NUL terminator included.
pub const PATH_MAX: usize = 4096;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("unsupported format version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u8, actual: u8 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize`, returning `ParseError::IntegerConversion` on overflow.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Widen a `usize` to `u64`, returning `ParseError::IntegerConversion` on overflow.
pub fn usize_to_u64(value: usize, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Extract the file-type bits of a mode.
#[must_use]
pub fn file_type_bits(mode: u32) -> u32 {
    mode & S_IFMT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let data = [1_u8, 0, 0, 0, 2, 0, 0, 0, 0xAA, 0xBB];
        assert_eq!(read_le_u32(&data, 0).unwrap(), 1);
        assert_eq!(read_le_u64(&data, 0).unwrap(), 0x0000_0002_0000_0001);
        assert_eq!(read_fixed::<2>(&data, 8).unwrap(), [0xAA, 0xBB]);
        assert!(read_le_u32(&data, 8).is_err());
    }

    #[test]
    fn ensure_slice_reports_short_reads() {
        let data = [0_u8; 6];
        assert_eq!(
            ensure_slice(&data, 4, 4).unwrap_err(),
            ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2,
            }
        );
        assert_eq!(
            ensure_slice(&data, 10, 1).unwrap_err(),
            ParseError::InsufficientData {
                needed: 1,
                offset: 10,
                actual: 0,
            }
        );
    }

    #[test]
    fn ensure_slice_rejects_overflow() {
        let data = [0_u8; 4];
        assert_eq!(
            ensure_slice(&data, usize::MAX, 2).unwrap_err(),
            ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            }
        );
    }

    #[test]
    fn file_type_bits_masks_permissions() {
        assert_eq!(file_type_bits(S_IFDIR | 0o755), S_IFDIR);
        assert_eq!(file_type_bits(S_IFLNK | 0o777), S_IFLNK);
        assert_eq!(file_type_bits(0o644), 0);
    }

    #[test]
    fn integer_conversions() {
        assert_eq!(u64_to_usize(42, "test"), Ok(42));
        assert_eq!(usize_to_u64(7, "test"), Ok(7));
        #[cfg(target_pointer_width = "32")]
        assert!(u64_to_usize(u64::MAX, "test").is_err());
    }

    #[test]
    fn record_sizes_are_consistent() {
        assert_eq!(MIN_IMAGE_SIZE, 48);
        assert_eq!(DENTRY_SIZE, 2 * REGION_DESCRIPTOR_SIZE as u64);
        assert_eq!(XATTR_HEADER_SIZE, 2 * REGION_DESCRIPTOR_SIZE as u64);
    }
}
