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

//! The writable tree.
//!
//! A `MutableTree` owns the node store and a working root. Mutations build
//! copy-on-write paths of mem nodes over the last committed version;
//! `commit` hashes and flushes them as the next version. One writer per
//! tree; historical versions are read through independent
//! [`ImmutableTree`] views.

use std::{borrow::Cow, path::Path};

use crate::{
    batch::Batch,
    error::Error,
    immutable::ImmutableTree,
    import::Importer,
    iter::TreeIterator,
    store::{NodeStore, PruneOptions, StoreOptions},
    tree::{hash::empty_tree_hash, ops, CryptoHash, MemNode, NodeId, NodeRef},
    Version,
};

pub struct MutableTree {
    pub(crate) store: NodeStore,
    pub(crate) root: Option<NodeRef>,
    /// The working version: one past the last committed version.
    pub(crate) version: Version,
    pub(crate) orphans: Vec<NodeId>,
    /// Set when a mutation failed mid-rewrite. The rewrite consumed part of
    /// the working root, so the tree is inconsistent until a committed
    /// version is reloaded; commits are rejected in the meantime.
    failed: bool,
}

impl MutableTree {
    /// Opens (or creates) a tree in `dir` and loads the latest committed
    /// version.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let store = NodeStore::open(dir, options)?;
        let mut tree = MutableTree {
            store,
            root: None,
            version: 1,
            orphans: Vec::new(),
            failed: false,
        };
        tree.load_version(0)?;
        Ok(tree)
    }

    /// Loads a committed version as the working base, discarding any
    /// uncommitted changes. Version `0` means the latest; loading an empty
    /// store yields the empty working tree at version 1. Returns the loaded
    /// version.
    pub fn load_version(&mut self, version: Version) -> Result<Version, Error> {
        let loaded = match version {
            0 => self.store.latest_version().unwrap_or(0),
            v => v,
        };
        self.orphans.clear();
        self.failed = false;
        if loaded == 0 {
            self.root = None;
            self.version = 1;
            return Ok(0);
        }
        let record = self
            .store
            .root_record(loaded)
            .ok_or(Error::VersionNotFound(loaded))?;
        self.root = (!record.root_id.is_none()).then_some(NodeRef::Stored(record.root_id));
        self.version = loaded + 1;
        Ok(loaded)
    }

    /// The working version the next `commit` will produce.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Sets the version the first commit will produce. Only valid on a tree
    /// with no committed versions, e.g. a store mounted into a multi-store
    /// that already has history.
    pub fn set_initial_version(&mut self, version: Version) -> Result<(), Error> {
        if version == 0 {
            return Err(Error::InvalidOperation("initial version must be positive"));
        }
        if self.store.latest_version().is_some() {
            return Err(Error::InvalidOperation(
                "initial version can only be set on an empty tree",
            ));
        }
        self.version = version;
        Ok(())
    }

    /// The most recently committed version, if any.
    pub fn latest_version(&self) -> Option<Version> {
        self.store.latest_version()
    }

    /// All committed versions, ascending.
    pub fn available_versions(&self) -> Vec<Version> {
        self.store.available_versions()
    }

    /// The number of keys in the working tree.
    pub fn size(&self) -> Result<u32, Error> {
        match &self.root {
            None => Ok(0),
            Some(root) => Ok(ops::ref_height_size(root, &self.store)?.1),
        }
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.size()? == 0)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Cow<'_, [u8]>>, Error> {
        match &self.root {
            None => Ok(None),
            Some(root) => ops::get(root, key, &self.store),
        }
    }

    /// Looks up a key along with its in-order rank; see
    /// [`ImmutableTree::get_with_index`].
    pub fn get_with_index(&self, key: &[u8]) -> Result<(u64, Option<Cow<'_, [u8]>>), Error> {
        match &self.root {
            None => Ok((0, None)),
            Some(root) => ops::get_with_index(root, key, &self.store),
        }
    }

    /// Inserts or updates a key in the working tree. Returns `true` when an
    /// existing value was replaced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        let (node, updated) = match self.root.take() {
            None => (
                MemNode::new_leaf(key.to_vec(), value.to_vec(), self.version),
                false,
            ),
            Some(root) => {
                match ops::set(root, key, value, self.version, &self.store, &mut self.orphans) {
                    Ok(result) => result,
                    Err(err) => {
                        self.failed = true;
                        return Err(err);
                    }
                }
            }
        };
        self.root = Some(node.into());
        Ok(updated)
    }

    /// Removes a key from the working tree, returning its value. Removing
    /// an absent key changes nothing.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let Some(root) = self.root.take() else {
            return Ok(None);
        };
        let (new_root, _, value) =
            match ops::remove(root, key, self.version, &self.store, &mut self.orphans) {
                Ok(result) => result,
                Err(err) => {
                    self.failed = true;
                    return Err(err);
                }
            };
        self.root = new_root;
        Ok(value)
    }

    /// Applies a batch in order as part of the current working version.
    pub fn apply_batch(&mut self, batch: Batch) -> Result<(), Error> {
        for entry in batch {
            match entry.value {
                Some(value) => {
                    self.set(&entry.key, &value)?;
                }
                None => {
                    self.remove(&entry.key)?;
                }
            }
        }
        Ok(())
    }

    /// Hashes and flushes the working tree as the next committed version,
    /// appending the queued orphan entries, and returns the committed
    /// `(version, root_hash)`. The working version advances past it.
    pub fn commit(&mut self) -> Result<(Version, CryptoHash), Error> {
        if self.failed {
            return Err(Error::InvalidOperation(
                "a failed mutation left the working tree inconsistent; reload a committed version",
            ));
        }
        let version = self.version;
        let hash = match &mut self.root {
            None => empty_tree_hash(),
            Some(NodeRef::Stored(id)) => self.store.resolve_hash(*id)?,
            Some(NodeRef::Mem(node)) => ops::compute_hashes(node, &self.store)?,
        };
        let record = self
            .store
            .commit_version(version, self.root.take(), hash, &self.orphans)?;
        self.orphans.clear();
        self.root = (!record.root_id.is_none()).then_some(NodeRef::Stored(record.root_id));
        self.version = version + 1;
        Ok((version, record.hash))
    }

    /// An independent read-only view of a committed version (`0` = latest).
    pub fn get_immutable(&self, version: Version) -> Result<ImmutableTree<'_>, Error> {
        let target = match version {
            0 => self
                .store
                .latest_version()
                .ok_or(Error::VersionNotFound(0))?,
            v => v,
        };
        let record = self
            .store
            .root_record(target)
            .ok_or(Error::VersionNotFound(target))?;
        Ok(ImmutableTree::new(
            &self.store,
            target,
            record.root_id,
            record.hash,
        ))
    }

    /// Iterates the working tree over `[start, end)` in key order.
    pub fn iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator<'_> {
        TreeIterator::new(self.root.as_ref(), &self.store, start, end, ascending)
    }

    /// Drops versions not retained by `options` and compacts the store.
    /// Rejected while uncommitted changes are pending, since pruning
    /// renumbers the persisted nodes the working tree may reference.
    pub fn prune(&mut self, options: &PruneOptions) -> Result<(), Error> {
        if self.has_pending_changes() {
            return Err(Error::InvalidOperation(
                "cannot prune with uncommitted changes",
            ));
        }
        self.store.prune(options)?;
        self.load_version(0)?;
        Ok(())
    }

    /// Starts a snapshot import that will commit as `version`. Only valid
    /// on a tree with no committed versions and no pending changes.
    pub fn import(&mut self, version: Version) -> Result<Importer<'_>, Error> {
        Importer::new(self, version)
    }

    pub(crate) fn has_pending_changes(&self) -> bool {
        matches!(self.root, Some(NodeRef::Mem(_))) || !self.orphans.is_empty() || self.failed
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir) -> MutableTree {
        MutableTree::open(dir.path(), StoreOptions::default()).expect("open")
    }

    fn scan(tree: &MutableTree) -> Vec<(Vec<u8>, Vec<u8>)> {
        tree.iter(None, None, true)
            .map(|item| {
                let (k, v) = item.expect("iterate");
                (k.into_owned(), v.into_owned())
            })
            .collect()
    }

    #[test]
    fn set_commit_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let committed_hash;
        {
            let mut tree = open(&dir);
            assert!(!tree.set(b"a", b"1").expect("set"));
            assert!(!tree.set(b"b", b"2").expect("set"));
            assert!(tree.set(b"a", b"1x").expect("update"));
            let (version, hash) = tree.commit().expect("commit");
            assert_eq!(version, 1);
            committed_hash = hash;
        }
        let tree = open(&dir);
        assert_eq!(tree.latest_version(), Some(1));
        assert_eq!(tree.version(), 2);
        assert_eq!(tree.get(b"a").expect("get").as_deref(), Some(b"1x".as_slice()));
        assert_eq!(tree.get(b"b").expect("get").as_deref(), Some(b"2".as_slice()));
        assert_eq!(tree.get_immutable(1).expect("view").root_hash(), committed_hash);
    }

    #[test]
    fn historical_versions_stay_readable() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        tree.set(b"k", b"v1").expect("set");
        tree.commit().expect("commit v1");
        tree.set(b"k", b"v2").expect("set");
        tree.set(b"other", b"x").expect("set");
        tree.commit().expect("commit v2");

        let v1 = tree.get_immutable(1).expect("v1");
        assert_eq!(v1.get(b"k").expect("get").as_deref(), Some(b"v1".as_slice()));
        assert_eq!(v1.get(b"other").expect("get"), None);
        let v2 = tree.get_immutable(2).expect("v2");
        assert_eq!(v2.get(b"k").expect("get").as_deref(), Some(b"v2".as_slice()));
        assert_ne!(v1.root_hash(), v2.root_hash());
    }

    #[test]
    fn load_version_discards_pending_changes() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        tree.set(b"a", b"1").expect("set");
        tree.commit().expect("commit");
        tree.set(b"b", b"2").expect("set");
        tree.load_version(1).expect("reload");
        assert_eq!(tree.get(b"b").expect("get"), None);
        assert_eq!(tree.version(), 2);

        assert_matches::assert_matches!(
            tree.load_version(9),
            Err(Error::VersionNotFound(9))
        );
    }

    #[test]
    fn deleting_the_last_key_yields_the_empty_tree() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        tree.set(b"only", b"v").expect("set");
        tree.commit().expect("commit");
        assert_eq!(
            tree.remove(b"only").expect("remove").as_deref(),
            Some(b"v".as_slice())
        );
        let (_, hash) = tree.commit().expect("commit empty");
        assert_eq!(hash, empty_tree_hash());
        assert!(tree.is_empty().expect("size"));
        assert_eq!(tree.get(b"only").expect("get"), None);
    }

    #[test]
    fn removing_an_absent_key_queues_no_orphans() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        tree.set(b"a", b"1").expect("set");
        tree.set(b"b", b"2").expect("set");
        tree.commit().expect("commit");
        assert_eq!(tree.remove(b"zz").expect("remove"), None);
        assert!(!tree.has_pending_changes());
    }

    #[test]
    fn batch_applies_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        let mut batch = Batch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"a".to_vec());
        batch.put(b"a".to_vec(), b"3".to_vec());
        tree.apply_batch(batch).expect("apply");
        tree.commit().expect("commit");
        assert_eq!(tree.get(b"a").expect("get").as_deref(), Some(b"3".as_slice()));
        assert_eq!(tree.get(b"b").expect("get").as_deref(), Some(b"2".as_slice()));
    }

    #[test]
    fn identical_histories_hash_identically() {
        let dir_a = TempDir::new().expect("tempdir");
        let dir_b = TempDir::new().expect("tempdir");
        let mut a = open(&dir_a);
        let mut b = open(&dir_b);
        for tree in [&mut a, &mut b] {
            for i in 0..50u32 {
                let key = format!("key{:03}", i * 7 % 50);
                tree.set(key.as_bytes(), &i.to_le_bytes()).expect("set");
            }
            tree.commit().expect("commit");
            tree.remove(b"key007").expect("remove");
            tree.commit().expect("commit");
        }
        assert_eq!(
            a.get_immutable(2).expect("a").root_hash(),
            b.get_immutable(2).expect("b").root_hash()
        );
    }

    #[test]
    fn random_ops_match_a_model() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(42);

        for round in 0..10 {
            for _ in 0..50 {
                let key = format!("k{:03}", rng.gen_range(0..200u32)).into_bytes();
                if rng.gen_bool(0.7) {
                    let value = format!("v{}", rng.gen::<u32>()).into_bytes();
                    tree.set(&key, &value).expect("set");
                    model.insert(key, value);
                } else {
                    let removed = tree.remove(&key).expect("remove");
                    assert_eq!(removed, model.remove(&key), "round {}", round);
                }
            }
            tree.commit().expect("commit");
            let expected: Vec<(Vec<u8>, Vec<u8>)> =
                model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            assert_eq!(scan(&tree), expected, "round {}", round);
            assert_eq!(tree.size().expect("size") as usize, model.len());

            for key in model.keys().take(5) {
                let (index, value) = tree.get_with_index(key).expect("rank");
                assert!(value.is_some());
                assert_eq!(
                    index as usize,
                    model.range(..key.clone()).count(),
                    "rank of {:?}",
                    key
                );
            }
        }
    }

    #[test]
    fn prune_drops_old_versions_but_keeps_latest_intact() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        for version in 1..=4u32 {
            tree.set(b"counter", &version.to_le_bytes()).expect("set");
            tree.set(format!("k{}", version).as_bytes(), b"v").expect("set");
            tree.commit().expect("commit");
        }
        let latest_hash = tree.get_immutable(4).expect("v4").root_hash();

        tree.prune(&PruneOptions {
            keep_recent: 1,
            pinned: vec![2],
        })
        .expect("prune");

        assert_eq!(tree.available_versions(), vec![2, 4]);
        assert!(matches!(
            tree.get_immutable(1),
            Err(Error::VersionNotFound(1))
        ));
        assert_eq!(tree.get_immutable(4).expect("v4").root_hash(), latest_hash);
        assert_eq!(
            tree.get(b"counter").expect("get").as_deref(),
            Some(4u32.to_le_bytes().as_slice())
        );
        let v2 = tree.get_immutable(2).expect("v2");
        assert_eq!(v2.get(b"k2").expect("get").as_deref(), Some(b"v".as_slice()));
        assert_eq!(v2.get(b"k3").expect("get"), None);

        // the tree keeps working after the rewrite
        tree.set(b"after", b"prune").expect("set");
        tree.commit().expect("commit");
        assert_eq!(
            tree.get(b"after").expect("get").as_deref(),
            Some(b"prune".as_slice())
        );
    }

    #[test]
    fn failed_mutation_does_not_commit_an_empty_tree() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        for i in 0..20u32 {
            tree.set(format!("k{:02}", i).as_bytes(), b"v").expect("set");
        }
        tree.commit().expect("commit");

        // truncate the branch table behind the open tree so the next
        // descent fails mid-rewrite
        std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("branches.dat"))
            .expect("open table")
            .set_len(0)
            .expect("truncate");

        assert!(tree.set(b"k05", b"changed").is_err());
        assert_matches::assert_matches!(tree.commit(), Err(Error::InvalidOperation(_)));
        // still rejected on retry; version 1 stays the latest commit
        assert_matches::assert_matches!(tree.commit(), Err(Error::InvalidOperation(_)));
        assert_eq!(tree.latest_version(), Some(1));
        assert!(tree.has_pending_changes());
    }

    #[test]
    fn prune_with_pending_changes_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = open(&dir);
        tree.set(b"a", b"1").expect("set");
        tree.commit().expect("commit");
        tree.set(b"b", b"2").expect("set");
        assert_matches::assert_matches!(
            tree.prune(&PruneOptions::default()),
            Err(Error::InvalidOperation(_))
        );
    }

    #[test]
    fn zero_copy_tree_reads() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree =
            MutableTree::open(dir.path(), StoreOptions { zero_copy: true }).expect("open");
        for i in 0..20u32 {
            tree.set(format!("k{}", i).as_bytes(), &i.to_le_bytes())
                .expect("set");
        }
        tree.commit().expect("commit");
        assert_eq!(
            tree.get(b"k7").expect("get").as_deref(),
            Some(7u32.to_le_bytes().as_slice())
        );
        assert_eq!(scan(&tree).len(), 20);
    }
}
