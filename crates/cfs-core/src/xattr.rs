#![forbid(unsafe_code)]
//! Extended-attribute accessors.
//!
//! An inode's xattrs live in a table of fixed-size headers, each pointing at
//! a raw key region and a raw value region. Keys are not NUL terminated on
//! disk; the listing output terminates each key.
//!
//! Both accessors follow the size-discovery convention: an empty output
//! buffer means "report how much space you need", anything else must be
//! large enough or the call fails with `TooBig`.

use crate::Context;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{InodeMetadata, RegionDescriptor, XattrHeader};
use cfs_types::{XATTR_HEADER_SIZE, XATTR_NAME_MAX, u64_to_usize};
use tracing::trace;

impl Context {
    fn xattr_header(&self, table: RegionDescriptor, index: u64) -> Result<XattrHeader> {
        let desc = table
            .element(index, XATTR_HEADER_SIZE)
            .ok_or_else(|| CfsError::corrupted(table.offset, "xattr header address overflows"))?;
        let mut raw = [0_u8; XATTR_HEADER_SIZE as usize];
        self.read_region(desc, &mut raw)?;
        XattrHeader::parse_from_bytes(&raw).map_err(|e| crate::parse_error_to_cfs(&e, desc.offset))
    }

    fn xattr_key<'b>(
        &self,
        header: &XattrHeader,
        buf: &'b mut [u8; XATTR_NAME_MAX],
    ) -> Result<&'b [u8]> {
        if header.key.length > XATTR_NAME_MAX as u64 {
            return Err(CfsError::corrupted(
                header.key.offset,
                format!(
                    "xattr key of {} bytes exceeds {XATTR_NAME_MAX}",
                    header.key.length
                ),
            ));
        }
        self.read_region(header.key, buf)
    }

    /// Write every xattr key of `meta`, each followed by a NUL, into `out`.
    ///
    /// Returns the number of bytes the full listing occupies. With an empty
    /// `out` nothing is written and only the size is computed.
    pub fn list_xattrs(&self, meta: &InodeMetadata, out: &mut [u8]) -> Result<usize> {
        let table = meta.xattrs;
        if table.is_empty() {
            return Ok(0);
        }
        self.probe(table)?;

        let capacity = out.len();
        let mut total = 0_usize;
        let mut key_buf = [0_u8; XATTR_NAME_MAX];
        for index in 0..table.element_count(XATTR_HEADER_SIZE) {
            let header = self.xattr_header(table, index)?;
            let key = self.xattr_key(&header, &mut key_buf)?;
            let needed = key.len() + 1;
            if capacity != 0 {
                if capacity - total < needed {
                    return Err(CfsError::TooBig {
                        needed: total + needed,
                        capacity,
                    });
                }
                out[total..total + key.len()].copy_from_slice(key);
                out[total + key.len()] = 0;
            }
            total += needed;
        }
        trace!(xattrs = ?table, total, "listed xattrs");
        Ok(total)
    }

    /// Look up the xattr `name` of `meta`.
    ///
    /// With an empty `out` this is a size query: a match returns the value
    /// length, terminator excluded. Otherwise a match writes the value
    /// followed by a NUL into `out` and returns the matched key's length. A
    /// missing key is `Ok(None)`.
    pub fn get_xattr(
        &self,
        meta: &InodeMetadata,
        name: &[u8],
        out: &mut [u8],
    ) -> Result<Option<usize>> {
        let table = meta.xattrs;
        if table.is_empty() || name.len() > XATTR_NAME_MAX {
            return Ok(None);
        }
        self.probe(table)?;

        let mut key_buf = [0_u8; XATTR_NAME_MAX];
        for index in 0..table.element_count(XATTR_HEADER_SIZE) {
            let header = self.xattr_header(table, index)?;
            if header.key.length != name.len() as u64 {
                continue;
            }
            if self.xattr_key(&header, &mut key_buf)? != name {
                continue;
            }

            let value_len = u64_to_usize(header.value.length, "xattr_value_length")
                .map_err(|e| CfsError::corrupted(header.value.offset, e.to_string()))?;
            // Callers size allocations from the discovery answer.
            self.probe(header.value)?;
            if out.is_empty() {
                return Ok(Some(value_len));
            }
            let needed = value_len.saturating_add(1);
            if out.len() < needed {
                return Err(CfsError::TooBig {
                    needed,
                    capacity: out.len(),
                });
            }
            self.read_region(header.value, out)?;
            out[value_len] = 0;
            let key_len = u64_to_usize(header.key.length, "xattr_key_length")
                .map_err(|e| CfsError::corrupted(header.key.offset, e.to_string()))?;
            return Ok(Some(key_len));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_ondisk::{Header, Inode, InodePayload};
    use cfs_types::S_IFREG;

    /// One special inode with two xattrs: `user.a = "1"`, `user.test = "42"`.
    ///
    /// Payload layout:
    ///   0  "user.a" (6)  6 "1" (1)  7 "user.test" (9)  16 "42" (2)
    ///   18 xattr headers (2 x 16)
    ///   50 metadata (24)
    ///   74 inode (32)
    fn image(xattrs: RegionDescriptor) -> Vec<u8> {
        let headers = [
            XattrHeader {
                key: RegionDescriptor::new(0, 6),
                value: RegionDescriptor::new(6, 1),
            },
            XattrHeader {
                key: RegionDescriptor::new(7, 9),
                value: RegionDescriptor::new(16, 2),
            },
        ];
        let meta = InodeMetadata {
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
            xattrs,
        };
        let inode = Inode::new(
            50,
            InodePayload::File {
                size: 0,
                payload: RegionDescriptor::EMPTY,
            },
            1,
            0,
        )
        .unwrap();

        let mut image = Header::current().to_bytes().to_vec();
        image.extend_from_slice(b"user.a1user.test42");
        for header in &headers {
            image.extend_from_slice(&header.to_bytes().unwrap());
        }
        image.extend_from_slice(&meta.to_bytes().unwrap());
        image.extend_from_slice(&inode.to_bytes());
        image
    }

    fn open() -> (Context, InodeMetadata) {
        let ctx = Context::from_bytes(image(RegionDescriptor::new(18, 32))).unwrap();
        let meta = ctx.root().unwrap().metadata;
        (ctx, meta)
    }

    #[test]
    fn list_reports_size_then_fills() {
        let (ctx, meta) = open();
        let size = ctx.list_xattrs(&meta, &mut []).unwrap();
        assert_eq!(size, 17);

        let mut out = vec![0_u8; size];
        assert_eq!(ctx.list_xattrs(&meta, &mut out).unwrap(), 17);
        assert_eq!(out, b"user.a\0user.test\0");
    }

    #[test]
    fn list_with_small_buffer_is_too_big() {
        let (ctx, meta) = open();
        let mut out = [0_u8; 10];
        assert!(matches!(
            ctx.list_xattrs(&meta, &mut out).unwrap_err(),
            CfsError::TooBig { capacity: 10, .. }
        ));
    }

    #[test]
    fn get_returns_value_with_terminator() {
        let (ctx, meta) = open();
        assert_eq!(ctx.get_xattr(&meta, b"user.test", &mut []).unwrap(), Some(2));

        // A filled value reports the matched key length.
        let mut out = [0xFF_u8; 3];
        assert_eq!(ctx.get_xattr(&meta, b"user.test", &mut out).unwrap(), Some(9));
        assert_eq!(&out, b"42\0");

        let mut roomy = [0xFF_u8; 8];
        assert_eq!(ctx.get_xattr(&meta, b"user.a", &mut roomy).unwrap(), Some(6));
        assert_eq!(&roomy[..3], b"1\0\xFF");

        let mut small = [0_u8; 2];
        assert!(matches!(
            ctx.get_xattr(&meta, b"user.test", &mut small).unwrap_err(),
            CfsError::TooBig {
                needed: 3,
                capacity: 2
            }
        ));
    }

    #[test]
    fn get_missing_key_is_none() {
        let (ctx, meta) = open();
        let mut out = [0_u8; 8];
        assert_eq!(ctx.get_xattr(&meta, b"user.nope", &mut out).unwrap(), None);
        // Same length as an existing key, different bytes.
        assert_eq!(ctx.get_xattr(&meta, b"user.b", &mut out).unwrap(), None);
        assert_eq!(ctx.get_xattr(&meta, &[b'x'; 300], &mut out).unwrap(), None);
    }

    #[test]
    fn empty_table_has_no_xattrs() {
        let ctx = Context::from_bytes(image(RegionDescriptor::EMPTY)).unwrap();
        let meta = ctx.root().unwrap().metadata;
        assert_eq!(ctx.list_xattrs(&meta, &mut []).unwrap(), 0);
        assert_eq!(ctx.get_xattr(&meta, b"user.a", &mut []).unwrap(), None);
    }

    #[test]
    fn table_out_of_bounds_is_corruption() {
        let ctx = Context::from_bytes(image(RegionDescriptor::new(18, 4096))).unwrap();
        let meta = ctx.root().unwrap().metadata;
        assert!(ctx.list_xattrs(&meta, &mut []).unwrap_err().is_corruption());
        assert!(
            ctx.get_xattr(&meta, b"user.a", &mut [])
                .unwrap_err()
                .is_corruption()
        );
    }

    #[test]
    fn trailing_partial_header_is_ignored() {
        // 40 bytes covers two whole headers plus 8 bytes of the metadata record.
        let ctx = Context::from_bytes(image(RegionDescriptor::new(18, 40))).unwrap();
        let meta = ctx.root().unwrap().metadata;
        assert_eq!(ctx.list_xattrs(&meta, &mut []).unwrap(), 17);
    }
}
