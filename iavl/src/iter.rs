//! Ordered range iteration.
//!
//! Iteration is lazy: the iterator keeps an explicit descent stack of node
//! handles and resolves persisted nodes through the store only as they are
//! reached. Split keys prune whole subtrees that fall outside the range.

use std::borrow::Cow;

use crate::{
    error::Error,
    store::{NodeStore, StoredNode},
    tree::{MemNode, NodeId, NodeRef},
};

enum Cursor<'a> {
    Mem(&'a MemNode),
    Id(NodeId),
}

fn cursor_of<'a>(node_ref: &'a NodeRef) -> Cursor<'a> {
    match node_ref {
        NodeRef::Mem(node) => Cursor::Mem(node),
        NodeRef::Stored(id) => Cursor::Id(*id),
    }
}

/// A lazy in-order iterator over `(key, value)` pairs. `start` is inclusive,
/// `end` exclusive; `None` bounds are open. Yielded slices may borrow the
/// store's memory map.
pub struct TreeIterator<'a> {
    store: &'a NodeStore,
    stack: Vec<Cursor<'a>>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    done: bool,
}

impl<'a> TreeIterator<'a> {
    pub(crate) fn new(
        root: Option<&'a NodeRef>,
        store: &'a NodeStore,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Self {
        TreeIterator {
            store,
            stack: root.map(cursor_of).into_iter().collect(),
            start: start.map(|s| s.to_vec()),
            end: end.map(|e| e.to_vec()),
            ascending,
            done: false,
        }
    }

    fn in_range(&self, key: &[u8]) -> bool {
        let after_start = self.start.as_deref().map(|s| key >= s).unwrap_or(true);
        let before_end = self.end.as_deref().map(|e| key < e).unwrap_or(true);
        after_start && before_end
    }

    /// Pushes a branch's children in visit order, skipping subtrees the
    /// range cannot reach: every left key is strictly below the split key
    /// and every right key is at or above it.
    fn push_children(&mut self, split_key: &[u8], left: Cursor<'a>, right: Cursor<'a>) {
        let skip_left = self.start.as_deref().map(|s| s >= split_key).unwrap_or(false);
        let skip_right = self.end.as_deref().map(|e| e <= split_key).unwrap_or(false);
        if self.ascending {
            if !skip_right {
                self.stack.push(right);
            }
            if !skip_left {
                self.stack.push(left);
            }
        } else {
            if !skip_left {
                self.stack.push(left);
            }
            if !skip_right {
                self.stack.push(right);
            }
        }
    }
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = Result<(Cow<'a, [u8]>, Cow<'a, [u8]>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(cursor) = self.stack.pop() {
            match cursor {
                Cursor::Mem(MemNode::Leaf(leaf)) => {
                    if self.in_range(&leaf.key) {
                        return Some(Ok((
                            Cow::Borrowed(leaf.key.as_slice()),
                            Cow::Borrowed(leaf.value.as_slice()),
                        )));
                    }
                }
                Cursor::Mem(MemNode::Branch(branch)) => {
                    let (left, right) = (cursor_of(&branch.left), cursor_of(&branch.right));
                    self.push_children(&branch.key, left, right);
                }
                Cursor::Id(id) => match self.store.resolve(id) {
                    Ok(StoredNode::Leaf(leaf)) => {
                        if self.in_range(&leaf.key) {
                            return Some(Ok((leaf.key, leaf.value)));
                        }
                    }
                    Ok(StoredNode::Branch(branch)) => {
                        let (left, right) = (Cursor::Id(branch.left), Cursor::Id(branch.right));
                        self.push_children(&branch.key, left, right);
                    }
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                },
            }
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        store::StoreOptions,
        tree::{ops, MemNode},
    };

    fn mem_tree(store: &NodeStore, keys: &[&[u8]]) -> NodeRef {
        let mut orphans = Vec::new();
        let mut root: Option<NodeRef> = None;
        for key in keys {
            root = Some(match root {
                None => MemNode::new_leaf(key.to_vec(), key.to_vec(), 1).into(),
                Some(node) => {
                    let (node, _) = ops::set(node, key, key, 1, store, &mut orphans).expect("set");
                    node.into()
                }
            });
        }
        root.expect("non-empty")
    }

    fn collect(iter: TreeIterator) -> Vec<Vec<u8>> {
        iter.map(|item| item.expect("iterate").0.into_owned())
            .collect()
    }

    #[test]
    fn full_ascending_scan_is_ordered() {
        let dir = TempDir::new().expect("tempdir");
        let store = NodeStore::open(dir.path(), StoreOptions::default()).expect("open");
        let root = mem_tree(&store, &[b"d", b"a", b"c", b"e", b"b"]);
        let keys = collect(TreeIterator::new(Some(&root), &store, None, None, true));
        assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e"]);
    }

    #[test]
    fn descending_scan_reverses() {
        let dir = TempDir::new().expect("tempdir");
        let store = NodeStore::open(dir.path(), StoreOptions::default()).expect("open");
        let root = mem_tree(&store, &[b"a", b"b", b"c"]);
        let keys = collect(TreeIterator::new(Some(&root), &store, None, None, false));
        assert_eq!(keys, vec![b"c", b"b", b"a"]);
    }

    #[test]
    fn range_bounds_are_inclusive_exclusive() {
        let dir = TempDir::new().expect("tempdir");
        let store = NodeStore::open(dir.path(), StoreOptions::default()).expect("open");
        let root = mem_tree(&store, &[b"a", b"b", b"c", b"d", b"e"]);
        let keys = collect(TreeIterator::new(
            Some(&root),
            &store,
            Some(b"b"),
            Some(b"d"),
            true,
        ));
        assert_eq!(keys, vec![b"b", b"c"]);
    }

    #[test]
    fn empty_tree_and_empty_range() {
        let dir = TempDir::new().expect("tempdir");
        let store = NodeStore::open(dir.path(), StoreOptions::default()).expect("open");
        assert!(collect(TreeIterator::new(None, &store, None, None, true)).is_empty());

        let root = mem_tree(&store, &[b"a", b"b"]);
        let keys = collect(TreeIterator::new(
            Some(&root),
            &store,
            Some(b"x"),
            Some(b"z"),
            true,
        ));
        assert!(keys.is_empty());
    }

    #[test]
    fn iterates_committed_nodes_through_the_store() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = NodeStore::open(dir.path(), StoreOptions::default()).expect("open");
        let root = mem_tree(&store, &[b"b", b"a", b"c"]);
        let NodeRef::Mem(mut node) = root else {
            panic!("expected mem root")
        };
        let hash = ops::compute_hashes(&mut node, &store).expect("hashes");
        let record = store
            .commit_version(1, Some((*node).into()), hash, &[])
            .expect("commit");

        let root = NodeRef::Stored(record.root_id);
        let keys = collect(TreeIterator::new(Some(&root), &store, None, None, true));
        assert_eq!(keys, vec![b"a", b"b", b"c"]);
    }
}
