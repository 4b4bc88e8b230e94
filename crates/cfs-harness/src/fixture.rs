#![forbid(unsafe_code)]
//! JSON tree fixtures, encoded through [`ImageBuilder`].

use crate::builder::{ImageBuilder, NodeId};
use anyhow::{Context, Result, bail};
use cfs_types::{S_IFBLK, S_IFCHR, S_IFIFO, S_IFSOCK};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
    Hardlink,
}

/// One path in a fixture. Parents must be listed before their children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureEntry {
    pub path: String,
    pub kind: EntryKind,
    /// Octal permission bits, e.g. `"0644"`.
    #[serde(default)]
    pub perm: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Backing path for files, target for symlinks and hard links.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub rdev: u32,
    #[serde(default)]
    pub xattrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageFixture {
    #[serde(default)]
    pub root_xattrs: BTreeMap<String, String>,
    pub entries: Vec<FixtureEntry>,
}

fn parse_perm(entry: &FixtureEntry, default: u32) -> Result<u32> {
    entry.perm.as_deref().map_or(Ok(default), |perm| {
        u32::from_str_radix(perm, 8)
            .with_context(|| format!("invalid perm {perm:?} for {}", entry.path))
    })
}

fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    trimmed
        .rsplit_once('/')
        .unwrap_or(("", trimmed))
}

pub fn build_fixture(fixture: &ImageFixture) -> Result<Vec<u8>> {
    let mut builder = ImageBuilder::new();
    let mut ids: HashMap<String, NodeId> = HashMap::new();
    ids.insert(String::new(), NodeId::ROOT);

    for (key, value) in &fixture.root_xattrs {
        builder.xattr(NodeId::ROOT, key, value)?;
    }

    for entry in &fixture.entries {
        let (parent_path, name) = split_parent(&entry.path);
        let parent = *ids
            .get(parent_path)
            .with_context(|| format!("parent of {} not listed before it", entry.path))?;
        let target = entry.target.as_deref();

        let id = match entry.kind {
            EntryKind::Dir => builder.mkdir(parent, name, parse_perm(entry, 0o755)?)?,
            EntryKind::File => builder.file(
                parent,
                name,
                parse_perm(entry, 0o644)?,
                entry.size,
                target.map(str::as_bytes),
            )?,
            EntryKind::Symlink => {
                let Some(target) = target else {
                    bail!("symlink {} has no target", entry.path);
                };
                builder.symlink(parent, name, target)?
            }
            EntryKind::Fifo => {
                builder.special(parent, name, S_IFIFO | parse_perm(entry, 0o644)?, 0)?
            }
            EntryKind::CharDevice => builder.special(
                parent,
                name,
                S_IFCHR | parse_perm(entry, 0o600)?,
                entry.rdev,
            )?,
            EntryKind::BlockDevice => builder.special(
                parent,
                name,
                S_IFBLK | parse_perm(entry, 0o600)?,
                entry.rdev,
            )?,
            EntryKind::Socket => {
                builder.special(parent, name, S_IFSOCK | parse_perm(entry, 0o755)?, 0)?
            }
            EntryKind::Hardlink => {
                let Some(target) = target else {
                    bail!("hard link {} has no target", entry.path);
                };
                let existing = *ids
                    .get(target.trim_matches('/'))
                    .with_context(|| format!("hard link target {target} not listed"))?;
                builder.link(parent, name, existing)?;
                existing
            }
        };

        if entry.kind != EntryKind::Hardlink {
            for (key, value) in &entry.xattrs {
                builder.xattr(id, key, value)?;
            }
        }
        ids.insert(entry.path.trim_matches('/').to_owned(), id);
    }

    builder
        .build()
        .context("failed to encode fixture image")
}

pub fn load_image_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: ImageFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    build_fixture(&fixture).with_context(|| format!("failed to build fixture {}", path.display()))
}
