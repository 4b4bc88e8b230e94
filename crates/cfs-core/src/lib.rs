#![forbid(unsafe_code)]
//! Read-side decoder for compactfs metadata images.
//!
//! A [`Context`] owns a validated header and a [`BackingStore`]; every
//! accessor is a self-contained, bounds-checked random read into the blob.
//! Nothing is cached and nothing is mutated after open, so a context can be
//! shared across threads. Callers supply the destination buffers; the only
//! scratch space the decoder uses is fixed-size stack arrays bounded by
//! [`NAME_MAX`] and [`XATTR_NAME_MAX`].
//!
//! Module map:
//! - [`region`]: region reader and string accessor.
//! - [`dir`]: directory enumeration, lookup, and path resolution.
//! - [`xattr`]: extended-attribute listing and lookup.
//! - [`verify`]: optional whole-image integrity pass.

pub mod dir;
pub mod region;
pub mod verify;
pub mod xattr;

pub use cfs_error::{CfsError, Result};
pub use cfs_ondisk::{
    DirectoryEntry, FileType, Header, Inode, InodeMetadata, InodePayload, RegionDescriptor,
    XattrHeader,
};
pub use cfs_store::{BackingStore, FileStore, MemoryStore, StreamStore};
pub use cfs_types::{
    DENTRY_SIZE, HEADER_SIZE, INODE_METADATA_SIZE, INODE_SIZE, MIN_IMAGE_SIZE, NAME_MAX, PATH_MAX,
    XATTR_HEADER_SIZE, XATTR_NAME_MAX,
};
pub use verify::{Problem, ProblemKind, VerifyLimits, VerifyReport, verify_image};

use cfs_types::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Options controlling [`Context::open_with_options`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Run [`verify_image`] before handing out the context and refuse images
    /// with any problem.
    pub verify_on_open: bool,
    /// Entry budget for the verification walk.
    pub max_verify_entries: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            verify_on_open: false,
            max_verify_entries: VerifyLimits::default().max_entries,
        }
    }
}

/// Map a fixed-record parse failure to the runtime error surface.
///
/// `offset` locates the record that failed to decode.
fn parse_error_to_cfs(e: &ParseError, offset: u64) -> CfsError {
    match e {
        ParseError::InsufficientData { .. }
        | ParseError::UnsupportedVersion { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => CfsError::Corrupted {
            offset,
            detail: e.to_string(),
        },
    }
}

/// An inode together with its metadata, the unit most callers navigate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    /// Header-relative byte offset of the inode record.
    pub index: u64,
    pub inode: Inode,
    pub metadata: InodeMetadata,
}

impl Node {
    /// Kind-specific fields, decoded by the metadata's file type.
    #[must_use]
    pub fn payload(&self) -> InodePayload {
        self.inode.payload(self.metadata.mode)
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.metadata.file_type()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    /// The directory entry table, or `InvalidArgument` if this is not a directory.
    pub fn dir_table(&self) -> Result<RegionDescriptor> {
        match self.payload() {
            InodePayload::Directory { table } => Ok(table),
            InodePayload::File { .. } | InodePayload::Special => Err(CfsError::InvalidArgument(
                format!("inode {} is not a directory", self.index),
            )),
        }
    }
}

/// An open, validated image.
pub struct Context {
    header: Header,
    store: Box<dyn BackingStore>,
    len: u64,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("header", &self.header)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Open an image file with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    /// Open an image file with custom options.
    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let store = FileStore::open(path.as_ref())?;
        if store.len_bytes() == 0 {
            warn!(path = %path.as_ref().display(), "refusing empty image file");
            return Err(CfsError::InvalidArgument(format!(
                "image file {} is empty",
                path.as_ref().display()
            )));
        }
        Self::from_store_with_options(Box::new(store), options)
    }

    /// Open an image held in memory.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        Self::from_store(Box::new(MemoryStore::new(bytes)))
    }

    /// Open an image on an already-constructed store.
    pub fn from_store(store: Box<dyn BackingStore>) -> Result<Self> {
        Self::from_store_with_options(store, &OpenOptions::default())
    }

    /// Open an image on an already-constructed store with custom options.
    pub fn from_store_with_options(
        store: Box<dyn BackingStore>,
        options: &OpenOptions,
    ) -> Result<Self> {
        if cfg!(not(target_pointer_width = "64")) {
            return Err(CfsError::Unsupported(
                "image offsets are 64-bit but this platform's usize is narrower".to_owned(),
            ));
        }

        let len = store.len_bytes();
        if len < MIN_IMAGE_SIZE {
            warn!(len, "image too small for a header and root inode");
            return Err(CfsError::corrupted(
                0,
                format!("image is {len} bytes, need at least {MIN_IMAGE_SIZE}"),
            ));
        }

        let mut raw = [0_u8; HEADER_SIZE as usize];
        region::fill_from_store(&*store, 0, &mut raw)?;
        let header = Header::parse_from_bytes(&raw).map_err(|e| parse_error_to_cfs(&e, 0))?;
        if let Err(e) = header.validate() {
            warn!(?header, error = %e, "rejecting image header");
            return Err(parse_error_to_cfs(&e, 0));
        }

        let ctx = Self { header, store, len };
        debug!(
            len,
            version = header.version,
            root_index = ctx.root_index(),
            "opened compactfs image"
        );

        if options.verify_on_open {
            let limits = VerifyLimits {
                max_entries: options.max_verify_entries,
            };
            let report = verify_image(&ctx, &limits);
            if let Some(problem) = report.problems.first() {
                warn!(problems = report.problems.len(), "image failed verification");
                return Err(CfsError::corrupted(
                    problem.inode_index,
                    format!("verification failed: {problem}"),
                ));
            }
        }

        Ok(ctx)
    }

    /// Release the backing store.
    pub fn close(self) {
        trace!(len = self.len, "closing compactfs image");
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Total blob length in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    // ── Record accessors ────────────────────────────────────────────────

    /// Index of the root inode: the last inode record in the blob.
    ///
    /// Pure arithmetic; the result is only trusted once `get_inode` has
    /// bounds-checked it.
    #[must_use]
    pub fn root_index(&self) -> u64 {
        self.len.saturating_sub(HEADER_SIZE).saturating_sub(INODE_SIZE)
    }

    /// Read a fixed-size record into a stack array.
    fn read_record<const N: usize>(&self, desc: RegionDescriptor) -> Result<[u8; N]> {
        let mut raw = [0_u8; N];
        self.read_region(desc, &mut raw)?;
        Ok(raw)
    }

    pub fn get_inode(&self, index: u64) -> Result<Inode> {
        let raw = self.read_record::<{ INODE_SIZE as usize }>(RegionDescriptor::new(
            index, INODE_SIZE,
        ))?;
        Inode::parse_from_bytes(&raw).map_err(|e| parse_error_to_cfs(&e, index))
    }

    pub fn get_inode_metadata(&self, index: u64) -> Result<InodeMetadata> {
        let raw = self.read_record::<{ INODE_METADATA_SIZE as usize }>(RegionDescriptor::new(
            index,
            INODE_METADATA_SIZE,
        ))?;
        InodeMetadata::parse_from_bytes(&raw).map_err(|e| parse_error_to_cfs(&e, index))
    }

    pub fn resolve_inode_metadata(&self, inode: &Inode) -> Result<InodeMetadata> {
        self.get_inode_metadata(inode.metadata_index)
    }

    /// Read the directory entry at header-relative byte `offset`.
    pub fn get_dentry(&self, offset: u64) -> Result<DirectoryEntry> {
        let raw = self
            .read_record::<{ DENTRY_SIZE as usize }>(RegionDescriptor::new(offset, DENTRY_SIZE))?;
        DirectoryEntry::parse_from_bytes(&raw).map_err(|e| parse_error_to_cfs(&e, offset))
    }

    pub fn resolve_dentry_inode(&self, dentry: &DirectoryEntry) -> Result<Inode> {
        self.get_inode(dentry.inode_index)
    }

    /// Read an inode and its metadata.
    pub fn get_node(&self, index: u64) -> Result<Node> {
        let inode = self.get_inode(index)?;
        let metadata = self.resolve_inode_metadata(&inode)?;
        Ok(Node {
            index,
            inode,
            metadata,
        })
    }

    pub fn root(&self) -> Result<Node> {
        self.get_node(self.root_index())
    }

    // ── Payload accessor ────────────────────────────────────────────────

    /// Read the symlink target / backing path of a regular file or symlink.
    ///
    /// Returns the path without its NUL terminator, borrowed from `buf`.
    pub fn get_payload<'b>(&self, node: &Node, buf: &'b mut [u8]) -> Result<&'b [u8]> {
        let InodePayload::File { payload, .. } = node.payload() else {
            return Err(CfsError::InvalidArgument(format!(
                "inode {} carries no payload",
                node.index
            )));
        };
        if payload.is_empty() {
            return Err(CfsError::InvalidArgument(format!(
                "inode {} has an empty payload",
                node.index
            )));
        }

        match self.read_string(payload, PATH_MAX, buf) {
            Ok(path) => Ok(path),
            Err(e @ (CfsError::Corrupted { .. } | CfsError::Io(_))) => Err(e),
            Err(other) => Err(CfsError::Io(std::io::Error::other(other.to_string()))),
        }
    }
}
