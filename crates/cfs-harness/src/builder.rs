#![forbid(unsafe_code)]
//! In-process encoder producing well-formed images for tests and benches.
//!
//! Layout of the payload region, in order: one metadata record per node,
//! string data (payload paths, xattr keys and values, entry names), xattr
//! header tables, directory entry tables, and finally the inode records with
//! the root inode last.

use anyhow::{Context as _, Result, bail, ensure};
use cfs_ondisk::{
    DirectoryEntry, Header, Inode, InodeMetadata, InodePayload, RegionDescriptor, XattrHeader,
};
use cfs_types::{
    DENTRY_SIZE, INODE_METADATA_SIZE, INODE_SIZE, NAME_MAX, PATH_MAX, S_IFDIR, S_IFLNK, S_IFMT,
    S_IFREG, XATTR_HEADER_SIZE, XATTR_NAME_MAX, file_type_bits,
};

/// Handle to a node added to an [`ImageBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: Self = Self(0);
}

#[derive(Debug, Clone)]
struct NodeSpec {
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
    rdev: u32,
    size: u64,
    payload: Option<Vec<u8>>,
    xattrs: Vec<(Vec<u8>, Vec<u8>)>,
    children: Vec<(Vec<u8>, NodeId)>,
}

impl NodeSpec {
    fn new(mode: u32) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            rdev: 0,
            size: 0,
            payload: None,
            xattrs: Vec::new(),
            children: Vec::new(),
        }
    }

    fn is_dir(&self) -> bool {
        file_type_bits(self.mode) == S_IFDIR
    }
}

/// Growable payload region with header-relative addressing.
#[derive(Default)]
struct Area {
    bytes: Vec<u8>,
}

impl Area {
    fn offset(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn push(&mut self, data: &[u8]) -> RegionDescriptor {
        let desc = RegionDescriptor::new(self.offset(), data.len() as u64);
        self.bytes.extend_from_slice(data);
        desc
    }

    fn push_cstr(&mut self, data: &[u8]) -> RegionDescriptor {
        let desc = RegionDescriptor::new(self.offset(), data.len() as u64 + 1);
        self.bytes.extend_from_slice(data);
        self.bytes.push(0);
        desc
    }
}

/// Builds a directory tree and encodes it as an image blob.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    nodes: Vec<NodeSpec>,
    sort_entries: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// A builder holding only an empty root directory (mode `0755`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeSpec::new(S_IFDIR | 0o755)],
            sort_entries: true,
        }
    }

    /// Emit directory entries in insertion order instead of sorted order.
    ///
    /// Produces images that violate the lookup precondition, for exercising
    /// the integrity pass.
    #[must_use]
    pub fn keep_insertion_order(mut self) -> Self {
        self.sort_entries = false;
        self
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    fn node(&self, id: NodeId) -> Result<&NodeSpec> {
        self.nodes
            .get(id.0)
            .with_context(|| format!("unknown node {}", id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeSpec> {
        self.nodes
            .get_mut(id.0)
            .with_context(|| format!("unknown node {}", id.0))
    }

    fn attach(&mut self, parent: NodeId, name: &[u8], child: NodeId) -> Result<()> {
        ensure!(!name.is_empty(), "entry name must not be empty");
        ensure!(
            name.len() < NAME_MAX,
            "entry name of {} bytes is too long",
            name.len()
        );
        ensure!(
            !name.contains(&0) && !name.contains(&b'/'),
            "entry name {:?} contains NUL or '/'",
            String::from_utf8_lossy(name)
        );
        let dir = self.node_mut(parent)?;
        ensure!(dir.is_dir(), "node {} is not a directory", parent.0);
        if dir.children.iter().any(|(existing, _)| existing == name) {
            bail!(
                "duplicate entry {:?} in node {}",
                String::from_utf8_lossy(name),
                parent.0
            );
        }
        dir.children.push((name.to_vec(), child));
        Ok(())
    }

    fn add(&mut self, parent: NodeId, name: &[u8], spec: NodeSpec) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        self.nodes.push(spec);
        if let Err(e) = self.attach(parent, name, id) {
            self.nodes.pop();
            return Err(e);
        }
        Ok(id)
    }

    pub fn mkdir(&mut self, parent: NodeId, name: impl AsRef<[u8]>, perm: u32) -> Result<NodeId> {
        self.add(parent, name.as_ref(), NodeSpec::new(S_IFDIR | (perm & 0o7777)))
    }

    /// Add a regular file. `backing` is the payload path, if any.
    pub fn file(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        perm: u32,
        size: u64,
        backing: Option<&[u8]>,
    ) -> Result<NodeId> {
        let mut spec = NodeSpec::new(S_IFREG | (perm & 0o7777));
        spec.size = size;
        if let Some(path) = backing {
            ensure!(
                path.len() < PATH_MAX,
                "backing path of {} bytes is too long",
                path.len()
            );
            spec.payload = Some(path.to_vec());
        }
        self.add(parent, name.as_ref(), spec)
    }

    pub fn symlink(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        target: impl AsRef<[u8]>,
    ) -> Result<NodeId> {
        let target = target.as_ref();
        ensure!(!target.is_empty(), "symlink target must not be empty");
        ensure!(
            target.len() < PATH_MAX,
            "symlink target of {} bytes is too long",
            target.len()
        );
        let mut spec = NodeSpec::new(S_IFLNK | 0o777);
        spec.size = target.len() as u64;
        spec.payload = Some(target.to_vec());
        self.add(parent, name.as_ref(), spec)
    }

    /// Add a device, FIFO, or socket node. `mode` carries the type bits.
    pub fn special(
        &mut self,
        parent: NodeId,
        name: impl AsRef<[u8]>,
        mode: u32,
        rdev: u32,
    ) -> Result<NodeId> {
        let kind = file_type_bits(mode);
        ensure!(
            kind != S_IFDIR && kind != S_IFREG && kind != S_IFLNK,
            "mode {mode:o} is not a special file"
        );
        let mut spec = NodeSpec::new(mode);
        spec.rdev = rdev;
        self.add(parent, name.as_ref(), spec)
    }

    /// Add another name for an existing non-directory node.
    pub fn link(&mut self, parent: NodeId, name: impl AsRef<[u8]>, target: NodeId) -> Result<()> {
        ensure!(
            !self.node(target)?.is_dir(),
            "cannot hard link directory node {}",
            target.0
        );
        self.attach(parent, name.as_ref(), target)
    }

    pub fn xattr(
        &mut self,
        node: NodeId,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let key = key.as_ref();
        ensure!(!key.is_empty(), "xattr key must not be empty");
        ensure!(
            key.len() <= XATTR_NAME_MAX,
            "xattr key of {} bytes is too long",
            key.len()
        );
        self.node_mut(node)?
            .xattrs
            .push((key.to_vec(), value.as_ref().to_vec()));
        Ok(())
    }

    pub fn set_owner(&mut self, node: NodeId, uid: u32, gid: u32, mtime: u32) -> Result<()> {
        let spec = self.node_mut(node)?;
        spec.uid = uid;
        spec.gid = gid;
        spec.mtime = mtime;
        Ok(())
    }

    /// Replace the permission bits of a node, keeping its type.
    pub fn set_perm(&mut self, node: NodeId, perm: u32) -> Result<()> {
        let spec = self.node_mut(node)?;
        spec.mode = (spec.mode & S_IFMT) | (perm & 0o7777);
        Ok(())
    }

    /// Number of nodes, root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Encode the tree.
    pub fn build(&self) -> Result<Vec<u8>> {
        let count = self.nodes.len();
        let mut area = Area::default();
        area.bytes.resize(count * INODE_METADATA_SIZE as usize, 0);

        // String data.
        let payloads: Vec<RegionDescriptor> = self
            .nodes
            .iter()
            .map(|node| {
                node.payload
                    .as_deref()
                    .map_or(RegionDescriptor::EMPTY, |p| area.push_cstr(p))
            })
            .collect();
        let xattr_regions: Vec<Vec<XattrHeader>> = self
            .nodes
            .iter()
            .map(|node| {
                node.xattrs
                    .iter()
                    .map(|(key, value)| XattrHeader {
                        key: area.push(key),
                        value: area.push(value),
                    })
                    .collect()
            })
            .collect();
        let mut entries: Vec<Vec<(Vec<u8>, RegionDescriptor, NodeId)>> = self
            .nodes
            .iter()
            .map(|node| {
                node.children
                    .iter()
                    .map(|(name, child)| (name.clone(), area.push_cstr(name), *child))
                    .collect()
            })
            .collect();
        if self.sort_entries {
            for list in &mut entries {
                list.sort_by(|a, b| a.0.cmp(&b.0));
            }
        }

        // Xattr header tables.
        let mut xattr_tables = vec![RegionDescriptor::EMPTY; count];
        for (table, headers) in xattr_tables.iter_mut().zip(&xattr_regions) {
            if headers.is_empty() {
                continue;
            }
            let start = area.offset();
            for header in headers {
                area.bytes
                    .extend_from_slice(&header.to_bytes().context("encode xattr header")?);
            }
            *table = RegionDescriptor::new(start, headers.len() as u64 * XATTR_HEADER_SIZE);
        }

        // Directory tables reference inode offsets, which follow them.
        let dentry_bytes: u64 = entries
            .iter()
            .map(|list| list.len() as u64 * DENTRY_SIZE)
            .sum();
        let inode_base = area.offset() + dentry_bytes;
        let slot = |id: NodeId| if id.0 == 0 { count - 1 } else { id.0 - 1 };
        let inode_index = |id: NodeId| inode_base + slot(id) as u64 * INODE_SIZE;

        let mut dir_tables = vec![RegionDescriptor::EMPTY; count];
        for (table, list) in dir_tables.iter_mut().zip(&entries) {
            if list.is_empty() {
                continue;
            }
            let start = area.offset();
            for (_, name, child) in list {
                let dentry = DirectoryEntry {
                    name: *name,
                    inode_index: inode_index(*child),
                };
                area.bytes
                    .extend_from_slice(&dentry.to_bytes().context("encode directory entry")?);
            }
            *table = RegionDescriptor::new(start, list.len() as u64 * DENTRY_SIZE);
        }
        debug_assert_eq!(area.offset(), inode_base);

        // Link counts.
        let mut nlink = vec![0_u32; count];
        nlink[0] = 2;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_dir() && i != 0 {
                nlink[i] += 2;
            }
            for (_, child) in &node.children {
                if self.nodes[child.0].is_dir() {
                    nlink[i] += 1;
                } else {
                    nlink[child.0] += 1;
                }
            }
        }

        // Inodes, root last.
        for id in (1..count).chain(std::iter::once(0)).map(NodeId) {
            let node = &self.nodes[id.0];
            let payload = match file_type_bits(node.mode) {
                S_IFDIR => InodePayload::Directory {
                    table: dir_tables[id.0],
                },
                S_IFREG | S_IFLNK => InodePayload::File {
                    size: node.size,
                    payload: payloads[id.0],
                },
                _ => InodePayload::Special,
            };
            let meta_index = id.0 as u64 * INODE_METADATA_SIZE;
            let inode = Inode::new(meta_index, payload, nlink[id.0], node.rdev)
                .with_context(|| format!("encode inode {}", id.0))?;
            area.bytes.extend_from_slice(&inode.to_bytes());
        }

        // Metadata records fill the reserved prefix.
        for (i, node) in self.nodes.iter().enumerate() {
            let meta = InodeMetadata {
                mode: node.mode,
                uid: node.uid,
                gid: node.gid,
                mtime: node.mtime,
                xattrs: xattr_tables[i],
            };
            let at = i * INODE_METADATA_SIZE as usize;
            area.bytes[at..at + INODE_METADATA_SIZE as usize]
                .copy_from_slice(&meta.to_bytes().with_context(|| format!("encode metadata {i}"))?);
        }

        let mut image = Header::current().to_bytes().to_vec();
        image.extend_from_slice(&area.bytes);
        Ok(image)
    }
}

/// Overwrite `data` at `offset` within `image`, growing nothing.
pub fn patch(image: &mut [u8], offset: usize, data: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(data.len())
        .context("patch offset overflow")?;
    ensure!(
        end <= image.len(),
        "patch out of bounds: offset={offset} len={} image={}",
        data.len(),
        image.len()
    );
    image[offset..end].copy_from_slice(data);
    Ok(())
}
