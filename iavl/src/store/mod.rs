// MIT LICENSE
//
// Copyright (c) 2021 Dash Core Group
//
// Permission is hereby granted, free of charge, to any
// person obtaining a copy of this software and associated
// documentation files (the "Software"), to deal in the
// Software without restriction, including without
// limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software
// is furnished to do so, subject to the following
// conditions:
//
// The above copyright notice and this permission notice
// shall be included in all copies or substantial portions
// of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF
// ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED
// TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A
// PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT
// SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY
// CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION
// OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR
// IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Node store
//!
//! The persistence substrate: fixed-layout node tables plus an append-only
//! key/value blob region, with an optional zero-copy (mmap) read path.

pub(crate) mod encoding;
mod prune;

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use integer_encoding::VarInt;
use memmap2::Mmap;

use crate::{
    error::Error,
    store::encoding::{
        BranchRecord, LeafRecord, OrphanRecord, RootRecord, SegmentRecord, BRANCH_RECORD_SIZE,
        LEAF_RECORD_SIZE, ORPHAN_RECORD_SIZE, ROOT_RECORD_SIZE, SEGMENT_RECORD_SIZE,
    },
    tree::{CryptoHash, MemNode, NodeId, NodeRef},
    Version,
};

pub use prune::PruneOptions;

const BRANCHES_FILE: &str = "branches.dat";
const LEAVES_FILE: &str = "leaves.dat";
const KVS_FILE: &str = "kvs.dat";
const ROOTS_FILE: &str = "roots.dat";
const SEGMENTS_FILE: &str = "segments.dat";
const ORPHANS_FILE: &str = "orphans.dat";

/// Configuration passed into the store at construction. There is no ambient
/// global state; zero-copy is an explicit per-store choice.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreOptions {
    /// Resolve reads through a memory map, returning borrowed slices that
    /// alias the mapped region instead of copying. Borrows are bounded by
    /// the store borrow, so they cannot outlive a commit or remap.
    pub zero_copy: bool,
}

/// An append-only file of fixed-size records or length-prefixed blobs, read
/// either through a memory map or by copying.
struct TableFile {
    path: PathBuf,
    file: File,
    len: u64,
    map: Option<Mmap>,
    zero_copy: bool,
}

impl TableFile {
    fn open(path: PathBuf, zero_copy: bool) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let mut table = TableFile {
            path,
            file,
            len,
            map: None,
            zero_copy,
        };
        table.remap()?;
        Ok(table)
    }

    fn remap(&mut self) -> Result<(), Error> {
        self.map = if self.zero_copy && self.len > 0 {
            // Safety: the file is only ever appended to, never truncated or
            // overwritten while mapped, and the map is rebuilt after every
            // append.
            Some(unsafe { Mmap::map(&self.file)? })
        } else {
            None
        };
        Ok(())
    }

    /// Appends `bytes`, syncs, and refreshes the memory map.
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.file.write_all_at(bytes, self.len)?;
        self.file.sync_data()?;
        self.len += bytes.len() as u64;
        self.remap()
    }

    /// Reads `len` bytes at `offset`, either as a borrowed view into the
    /// mapped region or as an owned copy.
    fn read(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>, Error> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(Error::CorruptionError(format!(
                "read of {} bytes at offset {} beyond end of {:?} ({} bytes)",
                len, offset, self.path, self.len
            )));
        }
        match &self.map {
            Some(map) => Ok(Cow::Borrowed(&map[offset as usize..offset as usize + len])),
            None => {
                let mut buf = vec![0u8; len];
                self.file.read_exact_at(&mut buf, offset)?;
                Ok(Cow::Owned(buf))
            }
        }
    }

    /// Reads a varint-length-prefixed blob at `offset`.
    fn read_blob(&self, offset: u64) -> Result<Cow<'_, [u8]>, Error> {
        let corrupt =
            || Error::CorruptionError(format!("bad blob at offset {} in {:?}", offset, self.path));
        match &self.map {
            Some(map) => {
                let slice = map.get(offset as usize..).ok_or_else(corrupt)?;
                let (len, prefix): (u64, usize) = u64::decode_var(slice).ok_or_else(corrupt)?;
                let end = prefix.checked_add(len as usize).ok_or_else(corrupt)?;
                let bytes = slice.get(prefix..end).ok_or_else(corrupt)?;
                Ok(Cow::Borrowed(bytes))
            }
            None => {
                let avail = self.len.saturating_sub(offset);
                if avail == 0 {
                    return Err(corrupt());
                }
                let mut head = [0u8; 10];
                let head_len = avail.min(10) as usize;
                self.file.read_exact_at(&mut head[..head_len], offset)?;
                let (len, prefix): (u64, usize) =
                    u64::decode_var(&head[..head_len]).ok_or_else(corrupt)?;
                // a corrupt length prefix must not wrap past the bounds check
                let end = offset
                    .checked_add(prefix as u64)
                    .and_then(|n| n.checked_add(len));
                if end.map_or(true, |end| end > self.len) {
                    return Err(corrupt());
                }
                let mut buf = vec![0u8; len as usize];
                self.file.read_exact_at(&mut buf, offset + prefix as u64)?;
                Ok(Cow::Owned(buf))
            }
        }
    }

    fn record_count(&self, record_size: usize) -> Result<u64, Error> {
        if self.len % record_size as u64 != 0 {
            return Err(Error::CorruptionError(format!(
                "{:?} has {} bytes, not a multiple of the {}-byte record size",
                self.path, self.len, record_size
            )));
        }
        Ok(self.len / record_size as u64)
    }
}

/// A read-only view of a persisted leaf. Borrowed fields may alias the
/// store's memory map and must not be retained past the current operation.
#[derive(Debug)]
pub struct StoredLeaf<'a> {
    pub id: NodeId,
    pub key: Cow<'a, [u8]>,
    pub value: Cow<'a, [u8]>,
    /// The logical creation version the hash commits to. Differs from the
    /// id's segment version for imported nodes.
    pub version: Version,
    pub hash: CryptoHash,
}

/// A read-only view of a persisted branch.
#[derive(Debug)]
pub struct StoredBranch<'a> {
    pub id: NodeId,
    pub key: Cow<'a, [u8]>,
    pub left: NodeId,
    pub right: NodeId,
    pub height: u8,
    pub size: u32,
    pub version: Version,
    pub hash: CryptoHash,
}

/// A resolved persisted node.
#[derive(Debug)]
pub enum StoredNode<'a> {
    Leaf(StoredLeaf<'a>),
    Branch(StoredBranch<'a>),
}

impl<'a> StoredNode<'a> {
    #[inline]
    pub fn hash(&self) -> CryptoHash {
        match self {
            StoredNode::Leaf(leaf) => leaf.hash,
            StoredNode::Branch(branch) => branch.hash,
        }
    }

    #[inline]
    pub fn height(&self) -> u8 {
        match self {
            StoredNode::Leaf(_) => 0,
            StoredNode::Branch(branch) => branch.height,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        match self {
            StoredNode::Leaf(_) => 1,
            StoredNode::Branch(branch) => branch.size,
        }
    }

    /// The leaf key, or the branch split key.
    #[inline]
    pub fn key(&self) -> &[u8] {
        match self {
            StoredNode::Leaf(leaf) => &leaf.key,
            StoredNode::Branch(branch) => &branch.key,
        }
    }
}

/// The persistence substrate for one tree: fixed-size branch and leaf
/// tables, a blob region for keys and values, the per-version root and
/// segment tables, and the orphan log.
pub struct NodeStore {
    dir: PathBuf,
    branches: TableFile,
    leaves: TableFile,
    kvs: TableFile,
    roots_table: TableFile,
    segments_table: TableFile,
    orphans_table: TableFile,
    options: StoreOptions,
    pub(crate) roots: BTreeMap<Version, RootRecord>,
    pub(crate) segments: BTreeMap<Version, SegmentRecord>,
}

impl NodeStore {
    /// Opens (or creates) the store in `dir` and loads the root and segment
    /// tables.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let branches = TableFile::open(dir.join(BRANCHES_FILE), options.zero_copy)?;
        let leaves = TableFile::open(dir.join(LEAVES_FILE), options.zero_copy)?;
        let kvs = TableFile::open(dir.join(KVS_FILE), options.zero_copy)?;
        // the small tables are always read eagerly, never through a map
        let roots_table = TableFile::open(dir.join(ROOTS_FILE), false)?;
        let segments_table = TableFile::open(dir.join(SEGMENTS_FILE), false)?;
        let orphans_table = TableFile::open(dir.join(ORPHANS_FILE), false)?;

        branches.record_count(BRANCH_RECORD_SIZE)?;
        leaves.record_count(LEAF_RECORD_SIZE)?;

        let mut roots = BTreeMap::new();
        for i in 0..roots_table.record_count(ROOT_RECORD_SIZE)? {
            let buf = roots_table.read(i * ROOT_RECORD_SIZE as u64, ROOT_RECORD_SIZE)?;
            let record = RootRecord::decode(&buf)?;
            roots.insert(record.version, record);
        }

        let mut segments = BTreeMap::new();
        for i in 0..segments_table.record_count(SEGMENT_RECORD_SIZE)? {
            let buf = segments_table.read(i * SEGMENT_RECORD_SIZE as u64, SEGMENT_RECORD_SIZE)?;
            let record = SegmentRecord::decode(&buf)?;
            segments.insert(record.version, record);
        }

        Ok(NodeStore {
            dir,
            branches,
            leaves,
            kvs,
            roots_table,
            segments_table,
            orphans_table,
            options,
            roots,
            segments,
        })
    }

    /// Resolves a `NodeId` to a read-only node view. Resolution is
    /// idempotent and side-effect free; it may block on I/O.
    pub fn resolve(&self, id: NodeId) -> Result<StoredNode<'_>, Error> {
        let segment = self.segments.get(&id.version()).ok_or_else(|| {
            Error::CorruptionError(format!("node {:?} refers to an unknown segment", id))
        })?;
        let (first, count) = if id.is_leaf() {
            (segment.first_leaf, segment.leaves)
        } else {
            (segment.first_branch, segment.branches)
        };
        if id.sequence() == 0 || id.sequence() > count {
            return Err(Error::CorruptionError(format!(
                "node {:?} is out of range for its segment ({} records)",
                id, count
            )));
        }
        let slot = first + id.sequence() as u64 - 1;

        if id.is_leaf() {
            let buf = self
                .leaves
                .read(slot * LEAF_RECORD_SIZE as u64, LEAF_RECORD_SIZE)?;
            let record = LeafRecord::decode(&buf)?;
            if record.id != id {
                return Err(Error::CorruptionError(format!(
                    "leaf record at slot {} has id {:?}, expected {:?}",
                    slot, record.id, id
                )));
            }
            Ok(StoredNode::Leaf(StoredLeaf {
                id,
                key: self.kvs.read_blob(record.key_offset)?,
                value: self.kvs.read_blob(record.value_offset)?,
                version: record.version,
                hash: record.hash,
            }))
        } else {
            let buf = self
                .branches
                .read(slot * BRANCH_RECORD_SIZE as u64, BRANCH_RECORD_SIZE)?;
            let record = BranchRecord::decode(&buf)?;
            if record.id != id {
                return Err(Error::CorruptionError(format!(
                    "branch record at slot {} has id {:?}, expected {:?}",
                    slot, record.id, id
                )));
            }
            Ok(StoredNode::Branch(StoredBranch {
                id,
                key: self.kvs.read_blob(record.key_offset)?,
                left: record.left,
                right: record.right,
                height: record.height,
                size: record.size,
                version: record.version,
                hash: record.hash,
            }))
        }
    }

    /// The hash of a persisted node.
    pub fn resolve_hash(&self, id: NodeId) -> Result<CryptoHash, Error> {
        Ok(self.resolve(id)?.hash())
    }

    /// The most recently committed version, if any.
    pub fn latest_version(&self) -> Option<Version> {
        self.roots.keys().next_back().copied()
    }

    /// All committed versions, ascending.
    pub fn available_versions(&self) -> Vec<Version> {
        self.roots.keys().copied().collect()
    }

    pub(crate) fn root_record(&self, version: Version) -> Option<RootRecord> {
        self.roots.get(&version).copied()
    }

    /// Flushes one committed version: all new mem nodes post-order (children
    /// before parents, so ids are assigned contiguously within the segment),
    /// the queued orphan entries, the segment record, and finally the root
    /// record.
    pub(crate) fn commit_version(
        &mut self,
        version: Version,
        root: Option<NodeRef>,
        root_hash: CryptoHash,
        orphans: &[NodeId],
    ) -> Result<RootRecord, Error> {
        if let Some(latest) = self.latest_version() {
            if version <= latest {
                return Err(Error::InvalidOperation("version already committed"));
            }
        }

        let mut flush = SegmentFlush {
            version,
            branch_buf: Vec::new(),
            leaf_buf: Vec::new(),
            kv_buf: Vec::new(),
            kv_base: self.kvs.len,
            branch_seq: 0,
            leaf_seq: 0,
        };

        let root_id = match root {
            None => NodeId::NONE,
            Some(NodeRef::Stored(id)) => id,
            Some(NodeRef::Mem(node)) => flush.write_node(*node)?,
        };

        let segment = SegmentRecord {
            version,
            first_branch: self.branches.record_count(BRANCH_RECORD_SIZE)?,
            branches: flush.branch_seq,
            first_leaf: self.leaves.record_count(LEAF_RECORD_SIZE)?,
            leaves: flush.leaf_seq,
        };

        let mut orphan_buf = Vec::with_capacity(orphans.len() * ORPHAN_RECORD_SIZE);
        for &id in orphans {
            OrphanRecord {
                id,
                orphaned_at: version,
            }
            .encode_into(&mut orphan_buf);
        }

        let root_record = RootRecord {
            version,
            root_id,
            hash: root_hash,
        };
        let mut segment_buf = Vec::with_capacity(SEGMENT_RECORD_SIZE);
        segment.encode_into(&mut segment_buf);
        let mut root_buf = Vec::with_capacity(ROOT_RECORD_SIZE);
        root_record.encode_into(&mut root_buf);

        // the root record lands last; a version without one is not visible
        self.kvs.append(&flush.kv_buf)?;
        self.leaves.append(&flush.leaf_buf)?;
        self.branches.append(&flush.branch_buf)?;
        self.orphans_table.append(&orphan_buf)?;
        self.segments_table.append(&segment_buf)?;
        self.roots_table.append(&root_buf)?;

        self.segments.insert(version, segment);
        self.roots.insert(version, root_record);
        Ok(root_record)
    }

    /// Reads the whole orphan log into a `NodeId -> orphaned-at` map.
    pub(crate) fn read_orphans(&self) -> Result<BTreeMap<NodeId, Version>, Error> {
        let mut orphans = BTreeMap::new();
        for i in 0..self.orphans_table.record_count(ORPHAN_RECORD_SIZE)? {
            let buf = self
                .orphans_table
                .read(i * ORPHAN_RECORD_SIZE as u64, ORPHAN_RECORD_SIZE)?;
            let record = OrphanRecord::decode(&buf)?;
            orphans.insert(record.id, record.orphaned_at);
        }
        Ok(orphans)
    }
}

/// Buffers one version's new records during a commit and assigns node ids.
struct SegmentFlush {
    version: Version,
    branch_buf: Vec<u8>,
    leaf_buf: Vec<u8>,
    kv_buf: Vec<u8>,
    kv_base: u64,
    branch_seq: u32,
    leaf_seq: u32,
}

impl SegmentFlush {
    /// Serializes a mem node and its unpersisted descendants, post-order.
    /// Hashes must have been computed beforehand.
    fn write_node(&mut self, node: MemNode) -> Result<NodeId, Error> {
        let hash = node.cached_hash().ok_or(Error::InvalidOperation(
            "node flushed before its hash was computed",
        ))?;
        match node {
            MemNode::Leaf(leaf) => {
                let key_offset = self.append_blob(&leaf.key);
                let value_offset = self.append_blob(&leaf.value);
                self.leaf_seq += 1;
                let id = NodeId::leaf(self.version, self.leaf_seq);
                LeafRecord {
                    id,
                    key_offset,
                    value_offset,
                    version: leaf.version,
                    orphaned_at: 0,
                    hash,
                }
                .encode_into(&mut self.leaf_buf);
                Ok(id)
            }
            MemNode::Branch(branch) => {
                let left = self.write_ref(branch.left)?;
                let right = self.write_ref(branch.right)?;
                let key_offset = self.append_blob(&branch.key);
                self.branch_seq += 1;
                let id = NodeId::branch(self.version, self.branch_seq);
                BranchRecord {
                    id,
                    left,
                    right,
                    key_offset,
                    height: branch.height,
                    size: branch.size,
                    version: branch.version,
                    orphaned_at: 0,
                    hash,
                }
                .encode_into(&mut self.branch_buf);
                Ok(id)
            }
        }
    }

    fn write_ref(&mut self, node_ref: NodeRef) -> Result<NodeId, Error> {
        match node_ref {
            NodeRef::Stored(id) => Ok(id),
            NodeRef::Mem(node) => self.write_node(*node),
        }
    }

    fn append_blob(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.kv_base + self.kv_buf.len() as u64;
        self.kv_buf
            .extend_from_slice(bytes.len().encode_var_vec().as_slice());
        self.kv_buf.extend_from_slice(bytes);
        offset
    }
}
