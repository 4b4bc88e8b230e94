#![forbid(unsafe_code)]
//! Whole-image integrity pass.
//!
//! The accessors trust the image to be well formed beyond bounds and
//! termination checks (most notably, lookup assumes sorted tables). This
//! module walks the tree from the root and reports every structural problem
//! it finds, so callers can refuse a damaged image up front instead of
//! discovering damage lazily.

use crate::{Context, Node};
use cfs_error::CfsError;
use cfs_ondisk::{InodePayload, RegionDescriptor};
use cfs_types::{DENTRY_SIZE, NAME_MAX, PATH_MAX};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

// ── Limits ──────────────────────────────────────────────────────────────────

/// Budget for a verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyLimits {
    /// Maximum number of directory entries to examine.
    pub max_entries: u64,
}

impl Default for VerifyLimits {
    fn default() -> Self {
        Self {
            max_entries: 1_000_000,
        }
    }
}

// ── Problem taxonomy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// An inode or its metadata record cannot be read.
    UnreadableInode,
    /// A directory table lies outside the image.
    TableOutOfBounds,
    /// A directory table length is not a whole number of entries.
    TableMisaligned,
    /// A directory entry or its name cannot be read.
    UnreadableEntry,
    EmptyName,
    /// Names are not strictly ascending, so lookups may miss entries.
    UnsortedNames,
    /// An xattr table cannot be listed.
    UnreadableXattrs,
    /// A file or symlink payload cannot be read.
    UnreadablePayload,
    /// The walk stopped before covering the whole tree.
    BudgetExhausted,
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadableInode => write!(f, "unreadable_inode"),
            Self::TableOutOfBounds => write!(f, "table_out_of_bounds"),
            Self::TableMisaligned => write!(f, "table_misaligned"),
            Self::UnreadableEntry => write!(f, "unreadable_entry"),
            Self::EmptyName => write!(f, "empty_name"),
            Self::UnsortedNames => write!(f, "unsorted_names"),
            Self::UnreadableXattrs => write!(f, "unreadable_xattrs"),
            Self::UnreadablePayload => write!(f, "unreadable_payload"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
        }
    }
}

/// One finding, located by inode (and directory entry, when relevant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub inode_index: u64,
    /// Position of the offending entry within its directory table.
    pub entry: Option<u64>,
    pub kind: ProblemKind,
    pub detail: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entry {
            Some(entry) => write!(
                f,
                "inode {} entry {} [{}]: {}",
                self.inode_index, entry, self.kind, self.detail
            ),
            None => write!(
                f,
                "inode {} [{}]: {}",
                self.inode_index, self.kind, self.detail
            ),
        }
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Directories whose tables were walked.
    pub directories: u64,
    /// Directory entries examined.
    pub entries: u64,
    /// Xattr keys seen across all examined inodes.
    pub xattrs: u64,
    pub problems: Vec<Problem>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: ProblemKind) -> usize {
        self.problems.iter().filter(|p| p.kind == kind).count()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verified {} directories, {} entries, {} xattrs: {} problems",
            self.directories,
            self.entries,
            self.xattrs,
            self.problems.len()
        )
    }
}

// ── Walker ──────────────────────────────────────────────────────────────────

struct Walker<'a> {
    ctx: &'a Context,
    limits: VerifyLimits,
    report: VerifyReport,
    visited: HashSet<u64>,
    stack: Vec<Node>,
}

impl Walker<'_> {
    fn record(&mut self, inode_index: u64, entry: Option<u64>, kind: ProblemKind, detail: String) {
        debug!(inode_index, ?entry, %kind, %detail, "verification problem");
        self.report.problems.push(Problem {
            inode_index,
            entry,
            kind,
            detail,
        });
    }

    fn record_err(
        &mut self,
        inode_index: u64,
        entry: Option<u64>,
        kind: ProblemKind,
        e: &CfsError,
    ) {
        self.record(inode_index, entry, kind, e.to_string());
    }

    /// Check the parts of a node that do not depend on it being a directory.
    fn check_node(&mut self, node: &Node, entry: Option<u64>) {
        match self.ctx.list_xattrs(&node.metadata, &mut []) {
            Ok(bytes) => {
                self.report.xattrs += node_xattr_count(self.ctx, node, bytes);
            }
            Err(e) => self.record_err(node.index, entry, ProblemKind::UnreadableXattrs, &e),
        }

        if let InodePayload::File { payload, .. } = node.payload() {
            if !payload.is_empty() {
                let mut buf = vec![0_u8; PATH_MAX];
                if let Err(e) = self.ctx.get_payload(node, &mut buf) {
                    self.record_err(node.index, entry, ProblemKind::UnreadablePayload, &e);
                }
            }
        }
    }

    /// Walk one directory table. Returns `false` once the budget is spent.
    fn walk_dir(&mut self, dir: &Node, table: RegionDescriptor) -> bool {
        self.report.directories += 1;
        if let Err(e) = self.ctx.probe(table) {
            self.record_err(dir.index, None, ProblemKind::TableOutOfBounds, &e);
            return true;
        }
        if table.length % DENTRY_SIZE != 0 {
            self.record(
                dir.index,
                None,
                ProblemKind::TableMisaligned,
                format!("table length {} is not a multiple of {DENTRY_SIZE}", table.length),
            );
        }

        let mut name_buf = [0_u8; NAME_MAX];
        let mut previous: Option<Vec<u8>> = None;
        for index in 0..table.element_count(DENTRY_SIZE) {
            if self.report.entries >= self.limits.max_entries {
                self.record(
                    dir.index,
                    Some(index),
                    ProblemKind::BudgetExhausted,
                    format!("stopped after {} entries", self.report.entries),
                );
                return false;
            }
            self.report.entries += 1;

            let Some(at) = table.element(index, DENTRY_SIZE) else {
                self.record(
                    dir.index,
                    Some(index),
                    ProblemKind::UnreadableEntry,
                    "entry address overflows".to_owned(),
                );
                break;
            };
            let dentry = match self.ctx.get_dentry(at.offset) {
                Ok(dentry) => dentry,
                Err(e) => {
                    self.record_err(dir.index, Some(index), ProblemKind::UnreadableEntry, &e);
                    continue;
                }
            };

            match self.ctx.read_string(dentry.name, NAME_MAX, &mut name_buf) {
                Ok([]) => self.record(
                    dir.index,
                    Some(index),
                    ProblemKind::EmptyName,
                    "entry has an empty name".to_owned(),
                ),
                Ok(name) => {
                    if previous.as_deref().is_some_and(|prev| prev >= name) {
                        let detail = format!(
                            "{:?} does not sort after its predecessor",
                            String::from_utf8_lossy(name)
                        );
                        self.record(dir.index, Some(index), ProblemKind::UnsortedNames, detail);
                    }
                    previous = Some(name.to_vec());
                }
                Err(e) => {
                    self.record_err(dir.index, Some(index), ProblemKind::UnreadableEntry, &e);
                }
            }

            match self.ctx.get_node(dentry.inode_index) {
                Ok(child) => {
                    self.check_node(&child, Some(index));
                    if child.is_dir() && self.visited.insert(child.index) {
                        self.stack.push(child);
                    }
                }
                Err(e) => self.record_err(
                    dentry.inode_index,
                    Some(index),
                    ProblemKind::UnreadableInode,
                    &e,
                ),
            }
        }
        true
    }
}

/// Count the keys in a listing of `bytes` total length.
fn node_xattr_count(ctx: &Context, node: &Node, bytes: usize) -> u64 {
    if bytes == 0 {
        return 0;
    }
    let mut listing = vec![0_u8; bytes];
    ctx.list_xattrs(&node.metadata, &mut listing)
        .map(|_| listing.iter().filter(|&&b| b == 0).count() as u64)
        .unwrap_or(0)
}

/// Walk the whole image from the root and collect every problem found.
///
/// The walk uses an explicit stack and remembers visited directories, so
/// deep, hard-linked, or cyclic trees terminate. Read failures become
/// problems; the walk continues with the next entry.
#[must_use]
pub fn verify_image(ctx: &Context, limits: &VerifyLimits) -> VerifyReport {
    let mut walker = Walker {
        ctx,
        limits: *limits,
        report: VerifyReport::default(),
        visited: HashSet::new(),
        stack: Vec::new(),
    };

    let root = match ctx.root() {
        Ok(root) => root,
        Err(e) => {
            walker.record_err(ctx.root_index(), None, ProblemKind::UnreadableInode, &e);
            return walker.report;
        }
    };
    walker.check_node(&root, None);
    walker.visited.insert(root.index);
    walker.stack.push(root);

    while let Some(dir) = walker.stack.pop() {
        let InodePayload::Directory { table } = dir.payload() else {
            // Only the root can get here: a non-directory image is a single file.
            continue;
        };
        if !walker.walk_dir(&dir, table) {
            break;
        }
    }

    debug!(report = %walker.report, "image verification finished");
    walker.report
}
