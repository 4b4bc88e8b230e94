#![forbid(unsafe_code)]
//! Directory enumeration, name lookup, and path resolution.
//!
//! A directory's payload is a table of fixed-size entries sorted by name
//! (byte-wise). Enumeration walks the table in order from a caller-chosen
//! position; lookup binary-searches it.

use crate::{Context, Node};
use cfs_error::{CfsError, Result};
use cfs_ondisk::{DirectoryEntry, RegionDescriptor};
use cfs_types::{DENTRY_SIZE, NAME_MAX};
use std::cmp::Ordering;
use std::ops::ControlFlow;
use tracing::{debug, trace};

fn entry_desc(table: RegionDescriptor, index: u64) -> Result<RegionDescriptor> {
    table
        .element(index, DENTRY_SIZE)
        .ok_or_else(|| CfsError::corrupted(table.offset, "directory entry address overflows"))
}

impl Context {
    /// Call `visitor` for each entry of `dir` starting at `start_index`.
    ///
    /// The visitor receives the entry name (without terminator), the child
    /// inode index, and the child's `S_IFMT` bits. Returning
    /// `ControlFlow::Break` stops the walk early and is not an error. Any
    /// failure to decode an entry aborts the walk; entries already delivered
    /// stay delivered.
    pub fn iterate_dir<F>(&self, dir: &Node, start_index: u64, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8], u64, u32) -> ControlFlow<()>,
    {
        let table = dir.dir_table()?;
        self.probe(table)?;
        let entries = table.element_count(DENTRY_SIZE);
        trace!(dir = dir.index, entries, start_index, "iterating directory");

        let mut name_buf = [0_u8; NAME_MAX];
        for index in start_index..entries {
            let dentry = self.get_dentry(entry_desc(table, index)?.offset)?;
            let name = self.read_string(dentry.name, NAME_MAX, &mut name_buf)?;
            let child = self.resolve_dentry_inode(&dentry)?;
            let meta = self.resolve_inode_metadata(&child)?;
            if visitor(name, dentry.inode_index, meta.file_type_mode()).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Find `name` in `dir`, returning the header-relative offset of the
    /// matching directory entry.
    pub fn lookup(&self, dir: &Node, name: &[u8]) -> Result<Option<u64>> {
        let table = dir.dir_table()?;
        self.probe(table)?;
        // Stored names are at most NAME_MAX - 1 bytes and never contain NUL.
        if name.len() >= NAME_MAX || name.contains(&0) {
            return Ok(None);
        }

        let mut name_buf = [0_u8; NAME_MAX];
        let mut lo = 0_u64;
        let mut hi = table.element_count(DENTRY_SIZE);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let at = entry_desc(table, mid)?.offset;
            let dentry = self.get_dentry(at)?;
            let candidate = self.read_string(dentry.name, NAME_MAX, &mut name_buf)?;
            match name.cmp(candidate) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Ok(Some(at)),
            }
        }
        Ok(None)
    }

    /// Like [`Context::lookup`], but returns the decoded entry.
    pub fn lookup_entry(&self, dir: &Node, name: &[u8]) -> Result<Option<DirectoryEntry>> {
        self.lookup(dir, name)?
            .map(|at| self.get_dentry(at))
            .transpose()
    }

    /// Like [`Context::lookup`], but returns the child node.
    pub fn lookup_node(&self, dir: &Node, name: &[u8]) -> Result<Option<Node>> {
        self.lookup_entry(dir, name)?
            .map(|dentry| self.get_node(dentry.inode_index))
            .transpose()
    }

    /// Resolve a `/`-separated path from the root.
    ///
    /// Empty components (leading, trailing, or doubled slashes) are skipped,
    /// so `""` and `"/"` name the root. Symlinks are not followed.
    pub fn resolve_path(&self, path: &[u8]) -> Result<Node> {
        let mut node = self.root()?;
        for component in path.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
            if !node.is_dir() {
                return Err(CfsError::InvalidArgument(format!(
                    "{} is not a directory while resolving {}",
                    node.index,
                    String::from_utf8_lossy(path)
                )));
            }
            node = self.lookup_node(&node, component)?.ok_or_else(|| {
                debug!(
                    path = %String::from_utf8_lossy(path),
                    component = %String::from_utf8_lossy(component),
                    "path component not found"
                );
                CfsError::NotFound(String::from_utf8_lossy(component).into_owned())
            })?;
        }
        Ok(node)
    }
}
