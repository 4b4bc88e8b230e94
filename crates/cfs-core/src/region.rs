#![forbid(unsafe_code)]
//! Region reader and string accessor.
//!
//! Every variable-length access in the image goes through [`Context::probe`],
//! which turns a header-relative [`RegionDescriptor`] into an absolute byte
//! range after checking it against the blob length with overflow-checked
//! arithmetic. Nothing is ever read from outside that range.

use crate::Context;
use cfs_error::{CfsError, Result};
use cfs_ondisk::RegionDescriptor;
use cfs_store::BackingStore;
use cfs_types::{HEADER_SIZE, u64_to_usize};
use std::io;
use std::ops::Range;
use tracing::trace;

/// Fill `buf` from `store` starting at absolute `offset`.
///
/// Short reads are retried; a store that stops producing data before `buf`
/// is full yields `UnexpectedEof`.
pub(crate) fn fill_from_store(store: &dyn BackingStore, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut copied = 0_usize;
    let mut pos = offset;
    while copied < buf.len() {
        let n = store.read_at(pos, &mut buf[copied..])?;
        if n == 0 {
            return Err(CfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "backing store ended at offset {pos} with {} bytes outstanding",
                    buf.len() - copied
                ),
            )));
        }
        let n = n.min(buf.len() - copied);
        copied += n;
        pos = pos.saturating_add(n as u64);
    }
    Ok(())
}

impl Context {
    /// Validate `desc` against the blob and return its absolute byte range.
    ///
    /// The start must land strictly inside the blob, even for a zero-length
    /// region, and the end must not pass the end of the blob.
    pub fn probe(&self, desc: RegionDescriptor) -> Result<Range<u64>> {
        let Some(start) = HEADER_SIZE.checked_add(desc.offset) else {
            trace!(?desc, "region start overflows");
            return Err(CfsError::corrupted(desc.offset, "region start overflows"));
        };
        if start >= self.len {
            trace!(?desc, len = self.len, "region starts past end of image");
            return Err(CfsError::corrupted(
                desc.offset,
                format!("region starts at {start}, image is {} bytes", self.len),
            ));
        }
        let Some(end) = start.checked_add(desc.length) else {
            trace!(?desc, "region end overflows");
            return Err(CfsError::corrupted(desc.offset, "region end overflows"));
        };
        if end > self.len {
            trace!(?desc, len = self.len, "region ends past end of image");
            return Err(CfsError::corrupted(
                desc.offset,
                format!("region ends at {end}, image is {} bytes", self.len),
            ));
        }
        Ok(start..end)
    }

    /// Copy the bytes of `desc` into the front of `dest`.
    ///
    /// Returns the filled prefix of `dest`, exactly `desc.length` bytes.
    pub fn read_region<'b>(&self, desc: RegionDescriptor, dest: &'b mut [u8]) -> Result<&'b [u8]> {
        let range = self.probe(desc)?;
        let len = u64_to_usize(desc.length, "region_length")
            .map_err(|e| CfsError::corrupted(desc.offset, e.to_string()))?;
        if dest.len() < len {
            return Err(CfsError::InvalidArgument(format!(
                "destination holds {} bytes, region is {len}",
                dest.len()
            )));
        }
        let dest = &mut dest[..len];
        fill_from_store(&*self.store, range.start, dest)?;
        Ok(dest)
    }

    /// Read a NUL-terminated string region of at most `max_len` bytes.
    ///
    /// `max_len` counts the terminator. The returned slice borrows from `buf`
    /// and excludes the terminator. A zero-length descriptor yields an empty
    /// string without touching the store.
    pub fn read_string<'b>(
        &self,
        desc: RegionDescriptor,
        max_len: usize,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8]> {
        if desc.length == 0 {
            return Ok(&[]);
        }
        if desc.length > max_len as u64 {
            return Err(CfsError::InvalidArgument(format!(
                "string of {} bytes exceeds ceiling of {max_len}",
                desc.length
            )));
        }
        let bytes = self.read_region(desc, buf)?;
        match bytes.split_last() {
            Some((0, text)) => Ok(text),
            _ => Err(CfsError::corrupted(
                desc.offset,
                "string is not NUL terminated",
            )),
        }
    }
}
