#![forbid(unsafe_code)]
//! On-disk format parsing for compactfs metadata images.
//!
//! Pure parsing crate with no I/O. Decodes byte slices into
//! the fixed-size records of an image (header, inodes, inode metadata,
//! directory entries, xattr headers) and encodes them back for tooling.
//! Variable-length data is only ever addressed, never parsed here; bounds
//! checking of region descriptors against a blob is `cfs-core`'s job.

pub mod format;

pub use format::{
    DirectoryEntry, FileType, Header, Inode, InodeMetadata, InodePayload, RegionDescriptor,
    XattrHeader,
};
