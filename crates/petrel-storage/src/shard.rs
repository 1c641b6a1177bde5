//! Directory shard tree
//!
//! Block files fan out across a tree of directories so no single
//! directory grows past a configured block count. A full directory hands
//! placement to its next sibling; when the last sibling is also full it
//! grows a `subdir0..subdirN-1` generation of children and placement
//! descends into the first one. Child directories exist on disk only once
//! a block actually lands in them.
//!
//! Nodes live in an arena indexed by position, with child and parent
//! links stored as indices.

use petrel_common::{Block, Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of every shard child directory.
pub const SUBDIR_PREFIX: &str = "subdir";

type NodeIdx = usize;

const ROOT: NodeIdx = 0;

struct ShardNode {
    path: PathBuf,
    parent: Option<NodeIdx>,
    /// Position in the parent's child list; 0 for the root.
    ordinal: usize,
    block_count: usize,
    children: Option<Vec<NodeIdx>>,
    /// Whether the directory exists on disk yet.
    materialized: bool,
}

/// Arena-backed tree of shard directories rooted at a volume's data dir.
pub struct ShardTree {
    nodes: Vec<ShardNode>,
    max_blocks_per_dir: usize,
}

impl ShardTree {
    /// Open the tree at `root`, scanning any existing layout.
    ///
    /// A missing root is created empty; an existing one is walked
    /// recursively, counting block files per directory and rebuilding the
    /// child structure from the `subdirN` directories found.
    pub fn open(root: impl Into<PathBuf>, max_blocks_per_dir: usize) -> Result<Self> {
        let root = root.into();
        let mut tree = Self { nodes: Vec::new(), max_blocks_per_dir };
        if root.is_dir() {
            tree.scan_into(root, None, 0)?;
        } else {
            fs::create_dir_all(&root).map_err(|e| Error::disk(&root, e))?;
            tree.nodes.push(ShardNode {
                path: root,
                parent: None,
                ordinal: 0,
                block_count: 0,
                children: None,
                materialized: true,
            });
        }
        Ok(tree)
    }

    /// Root directory of the tree.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.nodes[ROOT].path
    }

    /// Move `staged` into the tree under the block's canonical filename.
    ///
    /// Returns the final path. Either the rename lands and the count is
    /// bumped, or the error propagates with nothing applied.
    pub fn place(&mut self, block: &Block, staged: &Path) -> Result<PathBuf> {
        self.place_at(ROOT, block, staged)
    }

    fn place_at(&mut self, idx: NodeIdx, block: &Block, staged: &Path) -> Result<PathBuf> {
        if self.nodes[idx].block_count < self.max_blocks_per_dir {
            self.materialize(idx)?;
            let dest = self.nodes[idx].path.join(block.filename());
            fs::rename(staged, &dest).map_err(|e| Error::disk(&dest, e))?;
            self.nodes[idx].block_count += 1;
            return Ok(dest);
        }
        if let Some(sibling) = self.next_sibling(idx) {
            return self.place_at(sibling, block, staged);
        }
        let first_child = self.ensure_children(idx);
        self.place_at(first_child, block, staged)
    }

    /// Lazily iterate every block file in the tree.
    ///
    /// Children are visited before their parent's own files. Listing
    /// failures surface as error items; the iterator keeps going past
    /// them.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        let mut order = Vec::with_capacity(self.nodes.len());
        self.post_order(ROOT, &mut order);
        Blocks { tree: self, order: order.into_iter(), current: None }
    }

    /// Verify every materialized directory is present, readable, and
    /// writable. Fails on the first unhealthy path.
    pub fn check_health(&self) -> Result<()> {
        self.check_node(ROOT)
    }

    fn check_node(&self, idx: NodeIdx) -> Result<()> {
        let node = &self.nodes[idx];
        if !node.materialized {
            return Ok(());
        }
        check_dir(&node.path)?;
        if let Some(children) = &node.children {
            for &child in children {
                self.check_node(child)?;
            }
        }
        Ok(())
    }

    fn post_order(&self, idx: NodeIdx, out: &mut Vec<NodeIdx>) {
        if let Some(children) = &self.nodes[idx].children {
            for &child in children {
                self.post_order(child, out);
            }
        }
        out.push(idx);
    }

    fn next_sibling(&self, idx: NodeIdx) -> Option<NodeIdx> {
        let parent = self.nodes[idx].parent?;
        let siblings = self.nodes[parent].children.as_ref()?;
        siblings.get(self.nodes[idx].ordinal + 1).copied()
    }

    /// Allocate the full child generation for `idx` if it has none yet,
    /// returning the first child. Only the arena grows here; directories
    /// appear when placement lands in them.
    fn ensure_children(&mut self, idx: NodeIdx) -> NodeIdx {
        if let Some(children) = &self.nodes[idx].children {
            return children[0];
        }
        let base = self.nodes[idx].path.clone();
        let mut children = Vec::with_capacity(self.max_blocks_per_dir);
        for ordinal in 0..self.max_blocks_per_dir {
            children.push(self.push_node(
                base.join(format!("{SUBDIR_PREFIX}{ordinal}")),
                Some(idx),
                ordinal,
            ));
        }
        debug!(dir = %base.display(), fanout = self.max_blocks_per_dir, "shard directory full, fanning out");
        let first = children[0];
        self.nodes[idx].children = Some(children);
        first
    }

    fn materialize(&mut self, idx: NodeIdx) -> Result<()> {
        if self.nodes[idx].materialized {
            return Ok(());
        }
        let path = self.nodes[idx].path.clone();
        fs::create_dir_all(&path).map_err(|e| Error::disk(&path, e))?;
        self.nodes[idx].materialized = true;
        debug!(dir = %path.display(), "created shard directory");
        Ok(())
    }

    fn push_node(&mut self, path: PathBuf, parent: Option<NodeIdx>, ordinal: usize) -> NodeIdx {
        self.nodes.push(ShardNode {
            path,
            parent,
            ordinal,
            block_count: 0,
            children: None,
            materialized: false,
        });
        self.nodes.len() - 1
    }

    fn scan_into(&mut self, path: PathBuf, parent: Option<NodeIdx>, ordinal: usize) -> Result<NodeIdx> {
        let entries = list_dir(&path)?;
        let found = classify(&entries);
        let idx = self.nodes.len();
        self.nodes.push(ShardNode {
            path,
            parent,
            ordinal,
            block_count: found.block_count,
            children: None,
            materialized: true,
        });
        if !found.subdirs.is_empty() {
            // Child lists always span the fan-out so the sibling cascade
            // stays positional; directories missing on disk become
            // unmaterialized nodes. A wider-than-configured layout (from
            // an older fan-out setting) keeps its width.
            let highest = found.subdirs.iter().map(|&(ord, _)| ord).max().unwrap_or(0);
            let fanout = self.max_blocks_per_dir.max(highest + 1);
            let by_ordinal: HashMap<usize, String> = found.subdirs.into_iter().collect();
            let base = self.nodes[idx].path.clone();
            let mut children = Vec::with_capacity(fanout);
            for child_ordinal in 0..fanout {
                let child = match by_ordinal.get(&child_ordinal) {
                    Some(name) => self.scan_into(base.join(name), Some(idx), child_ordinal)?,
                    None => self.push_node(
                        base.join(format!("{SUBDIR_PREFIX}{child_ordinal}")),
                        Some(idx),
                        child_ordinal,
                    ),
                };
                children.push(child);
            }
            self.nodes[idx].children = Some(children);
        }
        Ok(idx)
    }
}

/// Lazy iterator over every `(block, path)` in a [`ShardTree`].
pub struct Blocks<'a> {
    tree: &'a ShardTree,
    order: std::vec::IntoIter<NodeIdx>,
    current: Option<(NodeIdx, fs::ReadDir)>,
}

impl Iterator for Blocks<'_> {
    type Item = Result<(Block, PathBuf)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((idx, read)) = &mut self.current {
                match read.next() {
                    Some(Ok(entry)) => {
                        let name = entry.file_name();
                        let Some(name) = name.to_str() else { continue };
                        if !Block::is_block_filename(name) {
                            continue;
                        }
                        let path = entry.path();
                        let len = match entry.metadata() {
                            Ok(meta) if meta.is_file() => meta.len(),
                            Ok(_) => continue,
                            Err(e) => return Some(Err(Error::disk(path, e))),
                        };
                        let Some(block) = Block::from_block_file(name, len) else { continue };
                        return Some(Ok((block, path)));
                    }
                    Some(Err(e)) => {
                        let dir = self.tree.nodes[*idx].path.clone();
                        return Some(Err(Error::disk(dir, e)));
                    }
                    None => self.current = None,
                }
            }
            let idx = self.order.next()?;
            let node = &self.tree.nodes[idx];
            if !node.materialized {
                continue;
            }
            match fs::read_dir(&node.path) {
                Ok(read) => self.current = Some((idx, read)),
                Err(e) => return Some(Err(Error::disk(&node.path, e))),
            }
        }
    }
}

/// One directory entry as the scan saw it, before interpretation.
struct RawEntry {
    name: String,
    is_dir: bool,
}

struct Classified {
    block_count: usize,
    /// `(ordinal, directory name)` sorted by ordinal.
    subdirs: Vec<(usize, String)>,
}

fn list_dir(dir: &Path) -> Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    let read = fs::read_dir(dir).map_err(|e| Error::disk(dir, e))?;
    for entry in read {
        let entry = entry.map_err(|e| Error::disk(dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let file_type = entry.file_type().map_err(|e| Error::disk(entry.path(), e))?;
        entries.push(RawEntry { name, is_dir: file_type.is_dir() });
    }
    Ok(entries)
}

/// Split raw entries into a direct block count and shard children.
/// Foreign files and directories are ignored.
fn classify(entries: &[RawEntry]) -> Classified {
    let mut block_count = 0;
    let mut subdirs = Vec::new();
    for entry in entries {
        if entry.is_dir {
            if let Some(ordinal) = parse_subdir(&entry.name) {
                subdirs.push((ordinal, entry.name.clone()));
            }
        } else if Block::is_block_filename(&entry.name) {
            block_count += 1;
        }
    }
    subdirs.sort_unstable_by_key(|&(ordinal, _)| ordinal);
    Classified { block_count, subdirs }
}

/// Parse a canonical `subdir<N>` name. Rejects non-canonical spellings
/// so two names can never claim one ordinal.
fn parse_subdir(name: &str) -> Option<usize> {
    let ordinal: usize = name.strip_prefix(SUBDIR_PREFIX)?.parse().ok()?;
    (name == format!("{SUBDIR_PREFIX}{ordinal}")).then_some(ordinal)
}

/// A directory is healthy when it exists, is a directory, and is
/// readable, writable, and searchable.
pub(crate) fn check_dir(path: &Path) -> Result<()> {
    use nix::unistd::AccessFlags;

    let is_dir = fs::metadata(path).is_ok_and(|meta| meta.is_dir());
    let accessible =
        nix::unistd::access(path, AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK)
            .is_ok();
    if is_dir && accessible {
        Ok(())
    } else {
        Err(Error::UnhealthyDir { path: path.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_common::BlockId;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn block(id: u64, len: u64) -> Block {
        Block::new(BlockId::new(id), len)
    }

    /// Write a staged file the way the volume's tmp dir would hold it.
    fn stage(dir: &Path, b: &Block) -> PathBuf {
        let path = dir.join(b.filename());
        fs::write(&path, vec![7u8; usize::try_from(b.num_bytes()).unwrap()]).unwrap();
        path
    }

    fn place_n(tree: &mut ShardTree, staging: &Path, ids: std::ops::Range<u64>) {
        for id in ids {
            let b = block(id, 8);
            let staged = stage(staging, &b);
            tree.place(&b, &staged).unwrap();
        }
    }

    fn collect_ids(tree: &ShardTree) -> BTreeSet<u64> {
        tree.blocks()
            .map(|item| item.unwrap().0.id().as_u64())
            .collect()
    }

    #[test]
    fn test_place_in_root() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        let mut tree = ShardTree::open(&data, 64).unwrap();
        let b = block(1, 16);
        let staged = stage(&staging, &b);
        let dest = tree.place(&b, &staged).unwrap();

        assert_eq!(dest, data.join("blk_1"));
        assert!(dest.is_file());
        assert!(!staged.exists());
    }

    #[test]
    fn test_fanout_creates_exactly_one_child_dir() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        let mut tree = ShardTree::open(&data, 4).unwrap();
        place_n(&mut tree, &staging, 0..5);

        let subdirs: Vec<String> = fs::read_dir(&data)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_dir())
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert_eq!(subdirs, vec!["subdir0".to_owned()]);
        assert!(data.join("subdir0").join("blk_4").is_file());

        let root_files = fs::read_dir(&data)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_type().unwrap().is_file())
            .count();
        assert_eq!(root_files, 4);
    }

    #[test]
    fn test_sibling_cascade_then_descend() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        let mut tree = ShardTree::open(&data, 2).unwrap();
        place_n(&mut tree, &staging, 1..8);

        // 2 in the root, 2 per child, then the last child fans out again.
        assert!(data.join("blk_1").is_file());
        assert!(data.join("blk_2").is_file());
        assert!(data.join("subdir0").join("blk_3").is_file());
        assert!(data.join("subdir0").join("blk_4").is_file());
        assert!(data.join("subdir1").join("blk_5").is_file());
        assert!(data.join("subdir1").join("blk_6").is_file());
        assert!(data.join("subdir1").join("subdir0").join("blk_7").is_file());
    }

    #[test]
    fn test_scan_resumes_placement() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        {
            let mut tree = ShardTree::open(&data, 2).unwrap();
            place_n(&mut tree, &staging, 1..8);
        }

        let mut tree = ShardTree::open(&data, 2).unwrap();
        assert_eq!(collect_ids(&tree), (1..8).collect());

        // Next block lands beside blk_7 in the grandchild generation.
        let b = block(8, 8);
        let staged = stage(&staging, &b);
        tree.place(&b, &staged).unwrap();
        assert!(data.join("subdir1").join("subdir0").join("blk_8").is_file());
    }

    #[test]
    fn test_blocks_reports_lengths_and_skips_foreign_entries() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        let mut tree = ShardTree::open(&data, 4).unwrap();
        let b = block(9, 100);
        let staged = stage(&staging, &b);
        tree.place(&b, &staged).unwrap();

        fs::write(data.join("notes.txt"), b"x").unwrap();
        fs::create_dir(data.join("lost+found")).unwrap();

        let found: Vec<(Block, PathBuf)> = tree.blocks().map(|item| item.unwrap()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id(), BlockId::new(9));
        assert_eq!(found[0].0.num_bytes(), 100);
        assert_eq!(found[0].1, data.join("blk_9"));
    }

    #[test]
    fn test_classify_is_pure() {
        let entries = vec![
            RawEntry { name: "blk_3".into(), is_dir: false },
            RawEntry { name: "blk_9".into(), is_dir: false },
            RawEntry { name: "subdir1".into(), is_dir: true },
            RawEntry { name: "subdir0".into(), is_dir: true },
            RawEntry { name: "subdir01".into(), is_dir: true },
            RawEntry { name: "blk_x".into(), is_dir: false },
            RawEntry { name: "subdir2".into(), is_dir: false },
        ];
        let found = classify(&entries);
        assert_eq!(found.block_count, 2);
        assert_eq!(
            found.subdirs,
            vec![(0, "subdir0".to_owned()), (1, "subdir1".to_owned())]
        );
    }

    #[test]
    fn test_check_health_reports_first_bad_dir() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        let staging = dir.path().join("tmp");
        fs::create_dir(&staging).unwrap();

        let mut tree = ShardTree::open(&data, 2).unwrap();
        place_n(&mut tree, &staging, 1..4);
        tree.check_health().unwrap();

        let removed = data.join("subdir0");
        fs::remove_dir_all(&removed).unwrap();
        match tree.check_health() {
            Err(Error::UnhealthyDir { path }) => assert_eq!(path, removed),
            other => panic!("expected UnhealthyDir, got {other:?}"),
        }
    }
}
