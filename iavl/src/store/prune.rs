//! Version pruning.
//!
//! Pruning rewrites the store files to a compacted copy that keeps exactly
//! the nodes still reachable from a retained version, then swaps the copy
//! in. Surviving nodes are renumbered so each version's segment stays
//! contiguous; every reference (children, roots, orphan log) is remapped
//! through the same memo.

use std::{collections::HashMap, fs};

use integer_encoding::VarInt;

use crate::{
    error::Error,
    store::{
        encoding::{
            BranchRecord, LeafRecord, OrphanRecord, RootRecord, SegmentRecord, BRANCH_RECORD_SIZE,
            LEAF_RECORD_SIZE,
        },
        NodeStore, BRANCHES_FILE, KVS_FILE, LEAVES_FILE, ORPHANS_FILE, ROOTS_FILE, SEGMENTS_FILE,
    },
    tree::NodeId,
    Version,
};

/// Which versions a prune keeps. The latest committed version is always
/// retained regardless of settings.
#[derive(Clone, Debug)]
pub struct PruneOptions {
    /// How many of the most recent versions to retain.
    pub keep_recent: u32,
    /// Versions retained unconditionally, e.g. snapshot heights.
    pub pinned: Vec<Version>,
}

impl Default for PruneOptions {
    fn default() -> Self {
        PruneOptions {
            keep_recent: 1,
            pinned: Vec::new(),
        }
    }
}

/// A node survives a prune iff some retained version can still reach it:
/// it was created at or before that version and orphaned strictly after it
/// (or never).
fn keep(retained: &[Version], created: Version, orphaned_at: Option<Version>) -> bool {
    let idx = retained.partition_point(|&r| r < created);
    match retained.get(idx) {
        None => false,
        Some(&r) => orphaned_at.map(|o| r < o).unwrap_or(true),
    }
}

fn append_blob(buf: &mut Vec<u8>, bytes: &[u8]) -> u64 {
    let offset = buf.len() as u64;
    buf.extend_from_slice(bytes.len().encode_var_vec().as_slice());
    buf.extend_from_slice(bytes);
    offset
}

impl NodeStore {
    /// Drops all versions not retained by `options` and compacts the store
    /// files in place. Readers of the reopened store see only the retained
    /// versions; node hashes and tree shapes are unchanged.
    pub fn prune(&mut self, options: &PruneOptions) -> Result<(), Error> {
        if self.roots.is_empty() {
            return Ok(());
        }

        let mut retained: Vec<Version> = self
            .roots
            .keys()
            .rev()
            .take(options.keep_recent.max(1) as usize)
            .copied()
            .collect();
        for &version in &options.pinned {
            if self.roots.contains_key(&version) {
                retained.push(version);
            }
        }
        retained.sort_unstable();
        retained.dedup();

        let orphan_map = self.read_orphans()?;
        let mut memo: HashMap<NodeId, NodeId> = HashMap::new();

        let mut branch_buf = Vec::new();
        let mut leaf_buf = Vec::new();
        let mut kv_buf = Vec::new();
        let mut orphan_buf = Vec::new();
        let mut segment_buf = Vec::new();
        let mut root_buf = Vec::new();

        let mut branch_total: u64 = 0;
        let mut leaf_total: u64 = 0;

        // versions ascending and leaves before branches keeps every memo
        // lookup behind the cursor: children always carry smaller ids than
        // the branches that reference them
        for (&version, segment) in &self.segments {
            let mut leaf_seq: u32 = 0;
            let mut branch_seq: u32 = 0;

            for seq in 1..=segment.leaves {
                let id = NodeId::leaf(version, seq);
                let slot = segment.first_leaf + seq as u64 - 1;
                let buf = self
                    .leaves
                    .read(slot * LEAF_RECORD_SIZE as u64, LEAF_RECORD_SIZE)?;
                let record = LeafRecord::decode(&buf)?;
                let orphaned_at = orphan_map.get(&id).copied();
                if !keep(&retained, version, orphaned_at) {
                    continue;
                }
                leaf_seq += 1;
                let new_id = NodeId::leaf(version, leaf_seq);
                memo.insert(id, new_id);
                let key = self.kvs.read_blob(record.key_offset)?;
                let key_offset = append_blob(&mut kv_buf, &key);
                let value = self.kvs.read_blob(record.value_offset)?;
                let value_offset = append_blob(&mut kv_buf, &value);
                LeafRecord {
                    id: new_id,
                    key_offset,
                    value_offset,
                    version: record.version,
                    orphaned_at: orphaned_at.unwrap_or(0),
                    hash: record.hash,
                }
                .encode_into(&mut leaf_buf);
                if let Some(orphaned_at) = orphaned_at {
                    OrphanRecord {
                        id: new_id,
                        orphaned_at,
                    }
                    .encode_into(&mut orphan_buf);
                }
            }

            for seq in 1..=segment.branches {
                let id = NodeId::branch(version, seq);
                let slot = segment.first_branch + seq as u64 - 1;
                let buf = self
                    .branches
                    .read(slot * BRANCH_RECORD_SIZE as u64, BRANCH_RECORD_SIZE)?;
                let record = BranchRecord::decode(&buf)?;
                let orphaned_at = orphan_map.get(&id).copied();
                if !keep(&retained, version, orphaned_at) {
                    continue;
                }
                branch_seq += 1;
                let new_id = NodeId::branch(version, branch_seq);
                memo.insert(id, new_id);
                let remap = |child: NodeId| {
                    memo.get(&child).copied().ok_or_else(|| {
                        Error::CorruptionError(format!(
                            "surviving branch {:?} references pruned child {:?}",
                            id, child
                        ))
                    })
                };
                let left = remap(record.left)?;
                let right = remap(record.right)?;
                let key = self.kvs.read_blob(record.key_offset)?;
                let key_offset = append_blob(&mut kv_buf, &key);
                BranchRecord {
                    id: new_id,
                    left,
                    right,
                    key_offset,
                    height: record.height,
                    size: record.size,
                    version: record.version,
                    orphaned_at: orphaned_at.unwrap_or(0),
                    hash: record.hash,
                }
                .encode_into(&mut branch_buf);
                if let Some(orphaned_at) = orphaned_at {
                    OrphanRecord {
                        id: new_id,
                        orphaned_at,
                    }
                    .encode_into(&mut orphan_buf);
                }
            }

            if leaf_seq > 0 || branch_seq > 0 {
                SegmentRecord {
                    version,
                    first_branch: branch_total,
                    branches: branch_seq,
                    first_leaf: leaf_total,
                    leaves: leaf_seq,
                }
                .encode_into(&mut segment_buf);
                branch_total += branch_seq as u64;
                leaf_total += leaf_seq as u64;
            }
        }

        for &version in &retained {
            // retained versions were validated against the root table above
            let record = self.roots.get(&version).ok_or_else(|| {
                Error::CorruptionError(format!("retained version {} has no root", version))
            })?;
            let root_id = if record.root_id.is_none() {
                NodeId::NONE
            } else {
                memo.get(&record.root_id).copied().ok_or_else(|| {
                    Error::CorruptionError(format!(
                        "root {:?} of retained version {} was pruned",
                        record.root_id, version
                    ))
                })?
            };
            RootRecord {
                version,
                root_id,
                hash: record.hash,
            }
            .encode_into(&mut root_buf);
        }

        // the root table swaps in last, so a crash mid-swap can leave extra
        // unreferenced nodes behind but never a root pointing at nothing
        let files: [(&str, &[u8]); 6] = [
            (KVS_FILE, &kv_buf),
            (LEAVES_FILE, &leaf_buf),
            (BRANCHES_FILE, &branch_buf),
            (ORPHANS_FILE, &orphan_buf),
            (SEGMENTS_FILE, &segment_buf),
            (ROOTS_FILE, &root_buf),
        ];
        for (name, bytes) in files {
            let tmp = self.dir.join(format!("{}.tmp", name));
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, self.dir.join(name))?;
        }

        *self = NodeStore::open(self.dir.clone(), self.options)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        store::{StoreOptions, StoredNode},
        tree::{
            hash::empty_tree_hash,
            ops::{self, compute_hashes},
            MemNode, NodeRef,
        },
    };

    fn open(dir: &TempDir) -> NodeStore {
        NodeStore::open(dir.path(), StoreOptions::default()).expect("open")
    }

    /// Applies `entries` on top of the previous version's root and commits.
    fn commit(store: &mut NodeStore, version: Version, entries: &[(&[u8], &[u8])]) -> NodeId {
        let mut orphans = Vec::new();
        let mut root: Option<NodeRef> = store
            .latest_version()
            .and_then(|v| store.root_record(v))
            .filter(|r| !r.root_id.is_none())
            .map(|r| NodeRef::Stored(r.root_id));
        for (key, value) in entries {
            root = Some(match root {
                None => MemNode::new_leaf(key.to_vec(), value.to_vec(), version).into(),
                Some(node) => {
                    let (node, _) =
                        ops::set(node, key, value, version, store, &mut orphans).expect("set");
                    node.into()
                }
            });
        }
        let record = match root {
            None => store
                .commit_version(version, None, empty_tree_hash(), &orphans)
                .expect("commit"),
            Some(NodeRef::Stored(id)) => {
                let hash = store.resolve_hash(id).expect("hash");
                store
                    .commit_version(version, Some(NodeRef::Stored(id)), hash, &orphans)
                    .expect("commit")
            }
            Some(NodeRef::Mem(mut node)) => {
                let hash = compute_hashes(&mut node, store).expect("hashes");
                let node = *node;
                store
                    .commit_version(version, Some(node.into()), hash, &orphans)
                    .expect("commit")
            }
        };
        record.root_id
    }

    fn get(store: &NodeStore, root: NodeId, key: &[u8]) -> Option<Vec<u8>> {
        ops::get(&NodeRef::Stored(root), key, store)
            .expect("get")
            .map(|v| v.into_owned())
    }

    #[test]
    fn keep_predicate() {
        // created at 1, orphaned at 3: visible to retained versions 1 and 2
        assert!(keep(&[1], 1, Some(3)));
        assert!(keep(&[2], 1, Some(3)));
        assert!(!keep(&[3], 1, Some(3)));
        assert!(!keep(&[5], 1, Some(3)));
        // never orphaned
        assert!(keep(&[7], 1, None));
        // created after every retained version
        assert!(!keep(&[1], 2, None));
    }

    #[test]
    fn prune_keeps_latest_and_drops_history() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = open(&dir);
        commit(&mut store, 1, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        commit(&mut store, 2, &[(b"b", b"2x")]);
        let root3 = commit(&mut store, 3, &[(b"d", b"4")]);
        let hash3 = store.root_record(3).unwrap().hash;

        let leaves_before = store.leaves.record_count(LEAF_RECORD_SIZE).unwrap();
        store
            .prune(&PruneOptions {
                keep_recent: 1,
                pinned: vec![],
            })
            .expect("prune");

        assert_eq!(store.available_versions(), vec![3]);
        let record = store.root_record(3).expect("retained root");
        assert_eq!(record.hash, hash3);
        // the root id may have been renumbered but resolves to the same tree
        assert_eq!(get(&store, record.root_id, b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&store, record.root_id, b"b"), Some(b"2x".to_vec()));
        assert_eq!(get(&store, record.root_id, b"c"), Some(b"3".to_vec()));
        assert_eq!(get(&store, record.root_id, b"d"), Some(b"4".to_vec()));
        assert_eq!(get(&store, record.root_id, b"x"), None);
        assert!(root3.version() == 3);

        let leaves_after = store.leaves.record_count(LEAF_RECORD_SIZE).unwrap();
        assert!(
            leaves_after < leaves_before,
            "superseded leaves should be dropped ({} -> {})",
            leaves_before,
            leaves_after
        );
    }

    #[test]
    fn pinned_version_survives() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = open(&dir);
        commit(&mut store, 1, &[(b"a", b"1"), (b"b", b"2")]);
        commit(&mut store, 2, &[(b"a", b"1x")]);
        commit(&mut store, 3, &[(b"a", b"1y")]);

        store
            .prune(&PruneOptions {
                keep_recent: 1,
                pinned: vec![1],
            })
            .expect("prune");

        assert_eq!(store.available_versions(), vec![1, 3]);
        let root1 = store.root_record(1).unwrap().root_id;
        assert_eq!(get(&store, root1, b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&store, root1, b"b"), Some(b"2".to_vec()));
        let root3 = store.root_record(3).unwrap().root_id;
        assert_eq!(get(&store, root3, b"a"), Some(b"1y".to_vec()));
    }

    #[test]
    fn prune_then_commit_continues() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = open(&dir);
        commit(&mut store, 1, &[(b"a", b"1"), (b"b", b"2")]);
        commit(&mut store, 2, &[(b"c", b"3")]);
        store.prune(&PruneOptions::default()).expect("prune");

        let root = commit(&mut store, 3, &[(b"d", b"4")]);
        assert_eq!(store.available_versions(), vec![2, 3]);
        assert_eq!(get(&store, root, b"a"), Some(b"1".to_vec()));
        assert_eq!(get(&store, root, b"d"), Some(b"4".to_vec()));

        // survives a reopen
        drop(store);
        let store = open(&dir);
        assert_eq!(store.available_versions(), vec![2, 3]);
        let root = store.root_record(3).unwrap().root_id;
        assert_eq!(get(&store, root, b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn prune_empty_store_is_a_no_op() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = open(&dir);
        store.prune(&PruneOptions::default()).expect("prune");
        assert_eq!(store.latest_version(), None);
    }

    #[test]
    fn pruned_node_resolution_fails_cleanly() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = open(&dir);
        let root1 = commit(&mut store, 1, &[(b"a", b"1"), (b"b", b"2")]);
        commit(&mut store, 2, &[(b"a", b"1x"), (b"b", b"2x")]);
        store.prune(&PruneOptions::default()).expect("prune");

        match store.resolve(root1) {
            Err(Error::CorruptionError(_)) => {}
            Ok(node) => {
                // the slot may be reused; if it resolves, it must not be the
                // old root (which was orphaned at version 2)
                assert_matches::assert_matches!(node, StoredNode::Leaf(_) | StoredNode::Branch(_));
            }
            Err(err) => panic!("unexpected error {:?}", err),
        }
    }
}
