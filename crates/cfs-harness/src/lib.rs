#![forbid(unsafe_code)]
//! Test and benchmark support for compactfs.
//!
//! - [`builder`]: encode a directory tree into a well-formed image.
//! - [`fixture`]: JSON tree fixtures under `conformance/fixtures/`.
//! - [`exercise_image`]: drive every read accessor over a whole image, used
//!   by the adversarial corpus and the benches.

pub mod builder;
pub mod fixture;

pub use builder::{ImageBuilder, NodeId, patch};
pub use fixture::{EntryKind, FixtureEntry, ImageFixture, build_fixture, load_image_fixture};

use cfs_core::{CfsError, Context, InodePayload, NAME_MAX, Node, PATH_MAX};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

/// Counts gathered by [`exercise_image`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkSummary {
    pub directories: u64,
    pub entries: u64,
    pub lookups_hit: u64,
    pub xattr_bytes: u64,
    pub payloads: u64,
}

/// Path to a file under the workspace `conformance/fixtures` directory.
#[must_use]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        .join("conformance")
        .join("fixtures")
        .join(name)
}

fn exercise_node(ctx: &Context, node: &Node, summary: &mut WalkSummary) -> Result<(), CfsError> {
    let listed = ctx.list_xattrs(&node.metadata, &mut [])?;
    if listed > 0 {
        let mut keys = vec![0_u8; listed];
        ctx.list_xattrs(&node.metadata, &mut keys)?;
        for key in keys.split(|&b| b == 0).filter(|k| !k.is_empty()) {
            if let Some(len) = ctx.get_xattr(&node.metadata, key, &mut [])? {
                let mut value = vec![0_u8; len + 1];
                ctx.get_xattr(&node.metadata, key, &mut value)?;
            }
        }
        summary.xattr_bytes += listed as u64;
    }

    if let InodePayload::File { payload, .. } = node.payload() {
        if !payload.is_empty() {
            let mut buf = vec![0_u8; PATH_MAX];
            ctx.get_payload(node, &mut buf)?;
            summary.payloads += 1;
        }
    }
    Ok(())
}

/// Open `bytes` and visit every reachable node with every accessor.
///
/// Stops at the first error. At most `max_entries` directory entries are
/// visited so that damaged images with huge claimed tables stay cheap.
pub fn exercise_image(bytes: Vec<u8>, max_entries: u64) -> Result<WalkSummary, CfsError> {
    let ctx = Context::from_bytes(bytes)?;
    let mut summary = WalkSummary::default();
    let root = ctx.root()?;
    exercise_node(&ctx, &root, &mut summary)?;

    let mut visited = HashSet::from([root.index]);
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        if !dir.is_dir() {
            continue;
        }
        summary.directories += 1;

        let mut names: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut budget_left = max_entries.saturating_sub(summary.entries);
        ctx.iterate_dir(&dir, 0, |name, child, _| {
            if budget_left == 0 {
                return ControlFlow::Break(());
            }
            budget_left -= 1;
            names.push((name.to_vec(), child));
            ControlFlow::Continue(())
        })?;

        for (name, child) in names {
            summary.entries += 1;
            if name.len() < NAME_MAX && ctx.lookup(&dir, &name)?.is_some() {
                summary.lookups_hit += 1;
            }
            let node = ctx.get_node(child)?;
            exercise_node(&ctx, &node, &mut summary)?;
            if node.is_dir() && visited.insert(node.index) {
                stack.push(node);
            }
        }
        if summary.entries >= max_entries {
            break;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exercise_counts_a_small_tree() {
        let mut b = ImageBuilder::new();
        let root = b.root();
        let etc = b.mkdir(root, "etc", 0o755).unwrap();
        b.file(etc, "passwd", 0o644, 10, Some(b"/objects/01")).unwrap();
        b.symlink(root, "link", "etc/passwd").unwrap();
        b.xattr(etc, "user.a", "1").unwrap();

        let summary = exercise_image(b.build().unwrap(), 1000).unwrap();
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.lookups_hit, 3);
        assert_eq!(summary.payloads, 2);
        assert_eq!(summary.xattr_bytes, 7);
    }

    #[test]
    fn exercise_respects_budget() {
        let mut b = ImageBuilder::new();
        let root = b.root();
        for i in 0..10 {
            b.file(root, format!("f{i}"), 0o644, 0, None).unwrap();
        }
        let summary = exercise_image(b.build().unwrap(), 4).unwrap();
        assert_eq!(summary.entries, 4);
    }

    #[test]
    fn basic_fixture_loads() {
        let image = load_image_fixture(&fixture_path("basic_tree.json")).expect("fixture");
        let summary = exercise_image(image, 1000).expect("walk");
        assert!(summary.entries > 0);
    }
}
