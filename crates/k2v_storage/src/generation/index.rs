//! In-memory folder index of one generation.
//!
//! Every folder the generation knows about has a node keyed by its full
//! path, so a folder handle resolves with one hash lookup instead of a walk
//! from the root. Nodes are `Arc`-shared between index versions: a commit
//! clones the map, rewrites only the nodes it touches and publishes the
//! result, leaving open snapshots untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::value::{FolderPath, Missing};

use super::format::{self, Op, OpReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DocRef {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Document(DocRef),
    Folder,
}

#[derive(Debug, Clone)]
pub(crate) struct FolderNode {
    pub version: u64,
    /// This generation knows the folder's full history.
    pub absolute: bool,
    pub entries: BTreeMap<Vec<u8>, Slot>,
}

impl FolderNode {
    fn new(version: u64, absolute: bool) -> Self {
        Self {
            version,
            absolute,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Index {
    nodes: HashMap<FolderPath, Arc<FolderNode>>,
    /// Size a compacted copy of this index would occupy on disk.
    live_bytes: u64,
    /// Committed length of the backing file.
    file_len: u64,
}

const ROOT: &[Vec<u8>] = &[];

impl Index {
    pub fn new(first_version: u64, absolute_root: bool, file_len: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            FolderPath::from(Vec::new()),
            Arc::new(FolderNode::new(first_version, absolute_root)),
        );
        Self {
            nodes,
            live_bytes: format::HEADER_SIZE
                + format::FRAME_HEADER_SIZE
                + format::BODY_PREFIX_SIZE
                + format::stamp_size(ROOT),
            file_len,
        }
    }

    pub fn root(&self) -> &FolderNode {
        &self.nodes[ROOT]
    }

    /// Version of the newest commit applied (the root is stamped by all).
    pub fn last_version(&self) -> u64 {
        self.root().version
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn set_file_len(&mut self, file_len: u64) {
        self.file_len = file_len;
    }

    /// Fraction of the file still reachable. A file holding nothing but its
    /// header reports 1.0.
    pub fn load_factor(&self) -> f32 {
        if self.file_len <= format::HEADER_SIZE {
            return 1.0;
        }
        (self.live_bytes as f64 / self.file_len as f64).min(1.0) as f32
    }

    pub fn folder_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn document_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|node| node.entries.values())
            .filter(|slot| matches!(slot, Slot::Document(_)))
            .count()
    }

    /// All folders, parents before children.
    pub fn folders(&self) -> Vec<(&FolderPath, &FolderNode)> {
        let mut folders: Vec<_> = self
            .nodes
            .iter()
            .map(|(path, node)| (path, node.as_ref()))
            .collect();
        folders.sort_by(|a, b| a.0.cmp(b.0));
        folders
    }

    /// Find the node for `path`, or explain its absence.
    pub fn resolve(&self, path: &[Vec<u8>]) -> Result<&FolderNode, Missing> {
        if let Some(node) = self.nodes.get(path) {
            return Ok(node);
        }
        let mut node = self.root();
        for depth in 0..path.len() {
            match node.entries.get(&path[depth]) {
                Some(Slot::Folder) => match self.nodes.get(&path[..=depth]) {
                    Some(next) => node = next.as_ref(),
                    None => return Err(Missing::new(node.absolute)),
                },
                // a document shadows everything that used to live below it
                Some(Slot::Document(_)) => return Err(Missing::absolute()),
                None => return Err(Missing::new(node.absolute)),
            }
        }
        Err(Missing::new(node.absolute))
    }

    /// Apply one frame's ops. `ops_offset` is the file offset of `ops[0]`.
    pub fn apply(&mut self, ops: &[u8], op_count: u32, version: u64, ops_offset: u64) -> Result<(), String> {
        let mut reader = OpReader::new(ops);
        for _ in 0..op_count {
            match reader.next_op()? {
                Op::Touch { path } => self.descend(&path, version),
                Op::Put {
                    path,
                    key,
                    offset,
                    len,
                } => self.put(
                    &path,
                    key,
                    DocRef {
                        offset: ops_offset + offset,
                        len,
                    },
                    version,
                ),
                Op::Stamp {
                    path,
                    version,
                    absolute,
                } => self.stamp(&path, version, absolute),
            }
        }
        if !reader.is_exhausted() {
            return Err(format!("{} trailing bytes after {} ops", ops.len(), op_count));
        }
        Ok(())
    }

    /// Ensure every folder along `path` exists and carries at least `version`.
    fn descend(&mut self, path: &[Vec<u8>], version: u64) {
        for depth in 0..=path.len() {
            let prefix = &path[..depth];
            if let Some(node) = self.nodes.get_mut(prefix) {
                let node = Arc::make_mut(node);
                node.version = node.version.max(version);
                continue;
            }
            let mut absolute = false;
            if let Some((key, parent_path)) = prefix.split_last() {
                if let Some(parent) = self.nodes.get_mut(parent_path) {
                    let parent = Arc::make_mut(parent);
                    absolute = parent.absolute;
                    if let Some(Slot::Document(doc)) = parent.entries.insert(key.clone(), Slot::Folder) {
                        self.live_bytes -= format::put_size(parent_path, key.len(), doc.len);
                        absolute = true;
                    }
                }
            }
            self.nodes
                .insert(FolderPath::from(prefix), Arc::new(FolderNode::new(version, absolute)));
            self.live_bytes += format::stamp_size(prefix);
        }
    }

    fn put(&mut self, path: &[Vec<u8>], key: &[u8], doc: DocRef, version: u64) {
        self.descend(path, version);
        let replaced = match self.nodes.get_mut(path) {
            Some(node) => Arc::make_mut(node)
                .entries
                .insert(key.to_vec(), Slot::Document(doc)),
            None => None,
        };
        match replaced {
            Some(Slot::Document(old)) => {
                self.live_bytes -= format::put_size(path, key.len(), old.len);
            }
            Some(Slot::Folder) => {
                let mut child = path.to_vec();
                child.push(key.to_vec());
                self.remove_subtree(&child);
            }
            None => {}
        }
        self.live_bytes += format::put_size(path, key.len(), doc.len);
    }

    /// Restate a folder's version and authority exactly.
    fn stamp(&mut self, path: &[Vec<u8>], version: u64, absolute: bool) {
        if let Some((key, parent_path)) = path.split_last() {
            self.descend(parent_path, 0);
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                if let Some(Slot::Document(doc)) =
                    Arc::make_mut(parent).entries.insert(key.clone(), Slot::Folder)
                {
                    self.live_bytes -= format::put_size(parent_path, key.len(), doc.len);
                }
            }
        }
        match self.nodes.get_mut(path) {
            Some(node) => {
                let node = Arc::make_mut(node);
                node.version = version;
                node.absolute = absolute;
            }
            None => {
                self.nodes
                    .insert(FolderPath::from(path), Arc::new(FolderNode::new(version, absolute)));
                self.live_bytes += format::stamp_size(path);
            }
        }
    }

    fn remove_subtree(&mut self, top: &[Vec<u8>]) {
        let doomed: Vec<FolderPath> = self
            .nodes
            .keys()
            .filter(|path| path.starts_with(top))
            .cloned()
            .collect();
        for path in doomed {
            if let Some(node) = self.nodes.remove(&*path) {
                self.live_bytes -= format::stamp_size(&path);
                for (key, slot) in &node.entries {
                    if let Slot::Document(doc) = slot {
                        self.live_bytes -= format::put_size(&path, key.len(), doc.len);
                    }
                }
            }
        }
    }
}
