#![forbid(unsafe_code)]

use cfs_types::{
    DENTRY_SIZE, FORMAT_VERSION, HEADER_SIZE, INODE_METADATA_SIZE, INODE_SIZE, ParseError,
    REGION_DESCRIPTOR_SIZE, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK,
    XATTR_HEADER_SIZE, ensure_slice, file_type_bits, read_fixed, read_le_u32, read_le_u64,
    u64_to_usize,
};
use serde::{Deserialize, Serialize};

const HEADER_VERSION_OFFSET: usize = 0x00;
const HEADER_INODE_LEN_OFFSET: usize = 0x04;
const HEADER_INODE_DATA_LEN_OFFSET: usize = 0x08;

const INODE_METADATA_INDEX_OFFSET: usize = 0x00;
const INODE_KIND_OFFSET: usize = 0x08;
const INODE_KIND_LEN: usize = 16;
const INODE_NLINK_OFFSET: usize = 0x18;
const INODE_RDEV_OFFSET: usize = 0x1C;

const META_MODE_OFFSET: usize = 0x00;
const META_UID_OFFSET: usize = 0x04;
const META_GID_OFFSET: usize = 0x08;
const META_MTIME_OFFSET: usize = 0x0C;
const META_XATTRS_OFFSET: usize = 0x10;

const DENTRY_NAME_OFFSET: usize = 0x00;
const DENTRY_INODE_INDEX_OFFSET: usize = 0x08;

const XATTR_KEY_OFFSET: usize = 0x00;
const XATTR_VALUE_OFFSET: usize = 0x08;

fn record_len(size: u64, field: &'static str) -> Result<usize, ParseError> {
    u64_to_usize(size, field)
}

fn require_len(bytes: &[u8], size: u64, field: &'static str) -> Result<(), ParseError> {
    let needed = record_len(size, field)?;
    if bytes.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: 0,
            actual: bytes.len(),
        });
    }
    Ok(())
}

// ── Region descriptors ──────────────────────────────────────────────────────

/// An (offset, length) reference into the payload region after the header.
///
/// Stored on disk as two little-endian `u32`s. In memory the fields are
/// widened to `u64` so that derived descriptors (table element addresses)
/// are computed with checked 64-bit arithmetic and can never wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub offset: u64,
    pub length: u64,
}

impl RegionDescriptor {
    pub const EMPTY: Self = Self {
        offset: 0,
        length: 0,
    };

    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn parse_from_bytes(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(bytes, offset, REGION_DESCRIPTOR_SIZE)?;
        Ok(Self {
            offset: u64::from(read_le_u32(bytes, offset)?),
            length: u64::from(read_le_u32(bytes, offset + 4)?),
        })
    }

    /// Encode as the on-disk `u32` pair.
    ///
    /// Fails when either field does not fit in 32 bits.
    pub fn to_bytes(self) -> Result<[u8; REGION_DESCRIPTOR_SIZE], ParseError> {
        let off = u32::try_from(self.offset).map_err(|_| ParseError::IntegerConversion {
            field: "region_offset",
        })?;
        let len = u32::try_from(self.length).map_err(|_| ParseError::IntegerConversion {
            field: "region_length",
        })?;
        let mut out = [0_u8; REGION_DESCRIPTOR_SIZE];
        out[0..4].copy_from_slice(&off.to_le_bytes());
        out[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(out)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.length == 0
    }

    /// Number of whole `record_size` elements in this region (truncating).
    #[must_use]
    pub fn element_count(self, record_size: u64) -> u64 {
        self.length.checked_div(record_size).unwrap_or(0)
    }

    /// Descriptor of the `index`th `record_size`-byte element of this table.
    ///
    /// Returns `None` if the element address overflows.
    #[must_use]
    pub fn element(self, index: u64, record_size: u64) -> Option<Self> {
        let rel = index.checked_mul(record_size)?;
        let offset = self.offset.checked_add(rel)?;
        Some(Self::new(offset, record_size))
    }
}

// ── Header ──────────────────────────────────────────────────────────────────

/// Fixed-size image header at blob offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub inode_len: u32,
    pub inode_data_len: u32,
}

impl Header {
    /// Parse the header without validating it.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, HEADER_SIZE, "header")?;
        let [version] = read_fixed::<1>(bytes, HEADER_VERSION_OFFSET)?;
        Ok(Self {
            version,
            inode_len: read_le_u32(bytes, HEADER_INODE_LEN_OFFSET)?,
            inode_data_len: read_le_u32(bytes, HEADER_INODE_DATA_LEN_OFFSET)?,
        })
    }

    /// Check that the header describes records this decoder understands.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.version != FORMAT_VERSION {
            return Err(ParseError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                actual: self.version,
            });
        }
        if u64::from(self.inode_len) != INODE_SIZE {
            return Err(ParseError::InvalidField {
                field: "inode_len",
                reason: "does not match the inode record size",
            });
        }
        if u64::from(self.inode_data_len) != INODE_METADATA_SIZE {
            return Err(ParseError::InvalidField {
                field: "inode_data_len",
                reason: "does not match the inode metadata record size",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn current() -> Self {
        Self {
            version: FORMAT_VERSION,
            inode_len: INODE_SIZE as u32,
            inode_data_len: INODE_METADATA_SIZE as u32,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0_u8; HEADER_SIZE as usize];
        out[HEADER_VERSION_OFFSET] = self.version;
        out[HEADER_INODE_LEN_OFFSET..HEADER_INODE_LEN_OFFSET + 4]
            .copy_from_slice(&self.inode_len.to_le_bytes());
        out[HEADER_INODE_DATA_LEN_OFFSET..HEADER_INODE_DATA_LEN_OFFSET + 4]
            .copy_from_slice(&self.inode_data_len.to_le_bytes());
        out
    }
}

// ── File types ──────────────────────────────────────────────────────────────

/// File type derived from the `S_IFMT` bits of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Unknown,
    RegFile,
    Dir,
    Chrdev,
    Blkdev,
    Fifo,
    Sock,
    Symlink,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match file_type_bits(mode) {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// Kind-specific inode fields, decoded according to the metadata mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodePayload {
    /// Directory: the entry table.
    Directory { table: RegionDescriptor },
    /// Regular file or symlink: size and target/backing path string.
    File {
        size: u64,
        payload: RegionDescriptor,
    },
    /// Devices, FIFOs, sockets, and unknown types carry no payload.
    Special,
}

/// A fixed-size inode record.
///
/// The kind-specific area is kept raw until the file type is known (it lives
/// in the metadata record); use [`Inode::payload`] to decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub metadata_index: u64,
    pub nlink: u32,
    pub rdev: u32,
    kind: [u8; INODE_KIND_LEN],
}

impl Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, INODE_SIZE, "inode")?;
        Ok(Self {
            metadata_index: read_le_u64(bytes, INODE_METADATA_INDEX_OFFSET)?,
            kind: read_fixed::<INODE_KIND_LEN>(bytes, INODE_KIND_OFFSET)?,
            nlink: read_le_u32(bytes, INODE_NLINK_OFFSET)?,
            rdev: read_le_u32(bytes, INODE_RDEV_OFFSET)?,
        })
    }

    /// Build an inode record from its decoded parts.
    pub fn new(
        metadata_index: u64,
        payload: InodePayload,
        nlink: u32,
        rdev: u32,
    ) -> Result<Self, ParseError> {
        let mut kind = [0_u8; INODE_KIND_LEN];
        match payload {
            InodePayload::Directory { table } => {
                kind[0..8].copy_from_slice(&table.to_bytes()?);
            }
            InodePayload::File { size, payload } => {
                kind[0..8].copy_from_slice(&size.to_le_bytes());
                kind[8..16].copy_from_slice(&payload.to_bytes()?);
            }
            InodePayload::Special => {}
        }
        Ok(Self {
            metadata_index,
            nlink,
            rdev,
            kind,
        })
    }

    /// Decode the kind-specific area for an inode whose metadata has `mode`.
    #[must_use]
    pub fn payload(&self, mode: u32) -> InodePayload {
        let kind = &self.kind;
        let descriptor = |at: usize| RegionDescriptor {
            offset: u64::from(u32::from_le_bytes([
                kind[at],
                kind[at + 1],
                kind[at + 2],
                kind[at + 3],
            ])),
            length: u64::from(u32::from_le_bytes([
                kind[at + 4],
                kind[at + 5],
                kind[at + 6],
                kind[at + 7],
            ])),
        };
        match FileType::from_mode(mode) {
            FileType::Dir => InodePayload::Directory {
                table: descriptor(0),
            },
            FileType::RegFile | FileType::Symlink => InodePayload::File {
                size: u64::from_le_bytes([
                    kind[0], kind[1], kind[2], kind[3], kind[4], kind[5], kind[6], kind[7],
                ]),
                payload: descriptor(8),
            },
            _ => InodePayload::Special,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; INODE_SIZE as usize] {
        let mut out = [0_u8; INODE_SIZE as usize];
        out[INODE_METADATA_INDEX_OFFSET..INODE_METADATA_INDEX_OFFSET + 8]
            .copy_from_slice(&self.metadata_index.to_le_bytes());
        out[INODE_KIND_OFFSET..INODE_KIND_OFFSET + INODE_KIND_LEN].copy_from_slice(&self.kind);
        out[INODE_NLINK_OFFSET..INODE_NLINK_OFFSET + 4].copy_from_slice(&self.nlink.to_le_bytes());
        out[INODE_RDEV_OFFSET..INODE_RDEV_OFFSET + 4].copy_from_slice(&self.rdev.to_le_bytes());
        out
    }
}

/// A fixed-size inode metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub xattrs: RegionDescriptor,
}

impl InodeMetadata {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, INODE_METADATA_SIZE, "inode_metadata")?;
        Ok(Self {
            mode: read_le_u32(bytes, META_MODE_OFFSET)?,
            uid: read_le_u32(bytes, META_UID_OFFSET)?,
            gid: read_le_u32(bytes, META_GID_OFFSET)?,
            mtime: read_le_u32(bytes, META_MTIME_OFFSET)?,
            xattrs: RegionDescriptor::parse_from_bytes(bytes, META_XATTRS_OFFSET)?,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; INODE_METADATA_SIZE as usize], ParseError> {
        let mut out = [0_u8; INODE_METADATA_SIZE as usize];
        out[META_MODE_OFFSET..META_MODE_OFFSET + 4].copy_from_slice(&self.mode.to_le_bytes());
        out[META_UID_OFFSET..META_UID_OFFSET + 4].copy_from_slice(&self.uid.to_le_bytes());
        out[META_GID_OFFSET..META_GID_OFFSET + 4].copy_from_slice(&self.gid.to_le_bytes());
        out[META_MTIME_OFFSET..META_MTIME_OFFSET + 4].copy_from_slice(&self.mtime.to_le_bytes());
        out[META_XATTRS_OFFSET..META_XATTRS_OFFSET + 8].copy_from_slice(&self.xattrs.to_bytes()?);
        Ok(out)
    }

    /// The `S_IFMT` bits of the mode.
    #[must_use]
    pub fn file_type_mode(&self) -> u32 {
        file_type_bits(self.mode)
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Dir
    }

    #[must_use]
    pub fn permission_bits(&self) -> u32 {
        self.mode & 0o7777
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// A fixed-size directory entry: name string plus child inode index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: RegionDescriptor,
    pub inode_index: u64,
}

impl DirectoryEntry {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, DENTRY_SIZE, "dentry")?;
        Ok(Self {
            name: RegionDescriptor::parse_from_bytes(bytes, DENTRY_NAME_OFFSET)?,
            inode_index: read_le_u64(bytes, DENTRY_INODE_INDEX_OFFSET)?,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; DENTRY_SIZE as usize], ParseError> {
        let mut out = [0_u8; DENTRY_SIZE as usize];
        out[DENTRY_NAME_OFFSET..DENTRY_NAME_OFFSET + 8].copy_from_slice(&self.name.to_bytes()?);
        out[DENTRY_INODE_INDEX_OFFSET..DENTRY_INODE_INDEX_OFFSET + 8]
            .copy_from_slice(&self.inode_index.to_le_bytes());
        Ok(out)
    }
}

// ── Extended attributes ─────────────────────────────────────────────────────

/// A fixed-size xattr header: key and value regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrHeader {
    pub key: RegionDescriptor,
    pub value: RegionDescriptor,
}

impl XattrHeader {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, XATTR_HEADER_SIZE, "xattr_header")?;
        Ok(Self {
            key: RegionDescriptor::parse_from_bytes(bytes, XATTR_KEY_OFFSET)?,
            value: RegionDescriptor::parse_from_bytes(bytes, XATTR_VALUE_OFFSET)?,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; XATTR_HEADER_SIZE as usize], ParseError> {
        let mut out = [0_u8; XATTR_HEADER_SIZE as usize];
        out[XATTR_KEY_OFFSET..XATTR_KEY_OFFSET + 8].copy_from_slice(&self.key.to_bytes()?);
        out[XATTR_VALUE_OFFSET..XATTR_VALUE_OFFSET + 8].copy_from_slice(&self.value.to_bytes()?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header_smoke() {
        let mut raw = [0_u8; 16];
        raw[0] = 1;
        raw[4..8].copy_from_slice(&32_u32.to_le_bytes());
        raw[8..12].copy_from_slice(&24_u32.to_le_bytes());
        let header = Header::parse_from_bytes(&raw).expect("header parse");
        assert_eq!(header, Header::current());
        header.validate().expect("validate");
    }

    #[test]
    fn header_validation_rejects_mismatches() {
        let mut header = Header::current();
        header.version = 2;
        assert_eq!(
            header.validate().unwrap_err(),
            ParseError::UnsupportedVersion {
                expected: 1,
                actual: 2,
            }
        );

        let mut header = Header::current();
        header.inode_len = 64;
        assert!(matches!(
            header.validate().unwrap_err(),
            ParseError::InvalidField {
                field: "inode_len",
                ..
            }
        ));

        let mut header = Header::current();
        header.inode_data_len = 0;
        assert!(matches!(
            header.validate().unwrap_err(),
            ParseError::InvalidField {
                field: "inode_data_len",
                ..
            }
        ));
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(matches!(
            Header::parse_from_bytes(&[0_u8; 15]).unwrap_err(),
            ParseError::InsufficientData { needed: 16, .. }
        ));
        assert!(Inode::parse_from_bytes(&[0_u8; 31]).is_err());
        assert!(InodeMetadata::parse_from_bytes(&[0_u8; 23]).is_err());
        assert!(DirectoryEntry::parse_from_bytes(&[0_u8; 15]).is_err());
        assert!(XattrHeader::parse_from_bytes(&[0_u8; 15]).is_err());
    }

    #[test]
    fn inode_payload_is_keyed_by_mode() {
        let mut raw = [0_u8; 32];
        raw[0..8].copy_from_slice(&96_u64.to_le_bytes());
        // kind area: dir table {off: 200, len: 48} / file size 0x30_0000_00C8
        raw[8..12].copy_from_slice(&200_u32.to_le_bytes());
        raw[12..16].copy_from_slice(&48_u32.to_le_bytes());
        raw[16..20].copy_from_slice(&300_u32.to_le_bytes());
        raw[20..24].copy_from_slice(&12_u32.to_le_bytes());
        raw[24..28].copy_from_slice(&3_u32.to_le_bytes());

        let inode = Inode::parse_from_bytes(&raw).expect("inode parse");
        assert_eq!(inode.metadata_index, 96);
        assert_eq!(inode.nlink, 3);

        assert_eq!(
            inode.payload(S_IFDIR | 0o755),
            InodePayload::Directory {
                table: RegionDescriptor::new(200, 48),
            }
        );
        assert_eq!(
            inode.payload(S_IFLNK | 0o777),
            InodePayload::File {
                size: (48_u64 << 32) | 200,
                payload: RegionDescriptor::new(300, 12),
            }
        );
        assert_eq!(inode.payload(S_IFCHR), InodePayload::Special);
        assert_eq!(inode.payload(0), InodePayload::Special);
    }

    #[test]
    fn inode_new_matches_parse() {
        let payload = InodePayload::File {
            size: 4096,
            payload: RegionDescriptor::new(10, 20),
        };
        let inode = Inode::new(24, payload, 1, 0).expect("build inode");
        let parsed = Inode::parse_from_bytes(&inode.to_bytes()).expect("parse");
        assert_eq!(parsed, inode);
        assert_eq!(parsed.payload(S_IFREG | 0o644), payload);
    }

    #[test]
    fn metadata_fields_decode() {
        let meta = InodeMetadata {
            mode: S_IFREG | 0o640,
            uid: 1000,
            gid: 100,
            mtime: 1_700_000_000,
            xattrs: RegionDescriptor::new(64, 32),
        };
        let parsed = InodeMetadata::parse_from_bytes(&meta.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.file_type(), FileType::RegFile);
        assert_eq!(parsed.file_type_mode(), S_IFREG);
        assert_eq!(parsed.permission_bits(), 0o640);
        assert!(!parsed.is_dir());
    }

    #[test]
    fn region_descriptor_encoding_rejects_wide_values() {
        let wide = RegionDescriptor::new(u64::from(u32::MAX) + 1, 1);
        assert_eq!(
            wide.to_bytes().unwrap_err(),
            ParseError::IntegerConversion {
                field: "region_offset",
            }
        );
    }

    #[test]
    fn region_descriptor_elements() {
        let table = RegionDescriptor::new(100, 50);
        assert_eq!(table.element_count(16), 3);
        assert_eq!(table.element_count(0), 0);
        assert_eq!(table.element(2, 16), Some(RegionDescriptor::new(132, 16)));
        assert_eq!(RegionDescriptor::new(u64::MAX, 16).element(1, 16), None);
        assert_eq!(table.element(u64::MAX, 16), None);
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR), FileType::Dir);
        assert_eq!(FileType::from_mode(S_IFSOCK | 0o600), FileType::Sock);
        assert_eq!(FileType::from_mode(S_IFBLK), FileType::Blkdev);
        assert_eq!(FileType::from_mode(S_IFIFO), FileType::Fifo);
        assert_eq!(FileType::from_mode(0o170_000), FileType::Unknown);
    }
}
