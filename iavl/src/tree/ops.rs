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

//! Copy-on-write mutation and AVL rebalancing.
//!
//! Every operation rewrites the touched root-to-leaf path as new mem nodes
//! at the working version and leaves untouched subtrees as lazy references
//! into the persisted store; superseded persisted nodes are queued as
//! orphans. Per-write cost is O(tree height) new nodes.

use std::{borrow::Cow, cmp::Ordering};

use crate::{
    error::Error,
    store::{NodeStore, StoredNode},
    tree::{
        hash::{branch_hash, leaf_hash},
        BranchNode, CryptoHash, LeafNode, MemNode, NodeId, NodeRef,
    },
    Version,
};

/// Inserts or updates `key`, returning the rewritten subtree root and
/// whether an existing leaf was replaced.
pub(crate) fn set(
    node_ref: NodeRef,
    key: &[u8],
    value: &[u8],
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<(MemNode, bool), Error> {
    match node_ref {
        NodeRef::Stored(id) => match store.resolve(id)? {
            StoredNode::Leaf(stored) => {
                let existing = LeafNode {
                    key: stored.key.into_owned(),
                    value: stored.value.into_owned(),
                    version: stored.version,
                    hash: Some(stored.hash),
                };
                Ok(set_leaf(existing, Some(id), key, value, version, orphans))
            }
            StoredNode::Branch(stored) => {
                let branch = BranchNode {
                    key: stored.key.into_owned(),
                    left: NodeRef::Stored(stored.left),
                    right: NodeRef::Stored(stored.right),
                    height: stored.height,
                    size: stored.size,
                    version,
                    hash: None,
                };
                // the branch is on the write path and will be superseded
                orphans.push(id);
                set_branch(branch, key, value, version, store, orphans)
            }
        },
        NodeRef::Mem(node) => match *node {
            MemNode::Leaf(existing) => Ok(set_leaf(existing, None, key, value, version, orphans)),
            MemNode::Branch(branch) => set_branch(branch, key, value, version, store, orphans),
        },
    }
}

/// Replaces a leaf with the same key, or splits it into a new branch whose
/// split key is the greater of the two leaf keys.
fn set_leaf(
    existing: LeafNode,
    stored: Option<NodeId>,
    key: &[u8],
    value: &[u8],
    version: Version,
    orphans: &mut Vec<NodeId>,
) -> (MemNode, bool) {
    let new_leaf = MemNode::new_leaf(key.to_vec(), value.to_vec(), version);
    match key.cmp(existing.key.as_slice()) {
        Ordering::Equal => {
            if let Some(id) = stored {
                orphans.push(id);
            }
            (new_leaf, true)
        }
        Ordering::Less => {
            let split_key = existing.key.clone();
            let branch = BranchNode {
                key: split_key,
                left: new_leaf.into(),
                right: keep_leaf(existing, stored),
                height: 1,
                size: 2,
                version,
                hash: None,
            };
            (MemNode::Branch(branch), false)
        }
        Ordering::Greater => {
            let branch = BranchNode {
                key: key.to_vec(),
                left: keep_leaf(existing, stored),
                right: new_leaf.into(),
                height: 1,
                size: 2,
                version,
                hash: None,
            };
            (MemNode::Branch(branch), false)
        }
    }
}

/// The untouched existing leaf stays where it was: persisted leaves remain
/// lazy references, in-memory ones keep their node.
fn keep_leaf(existing: LeafNode, stored: Option<NodeId>) -> NodeRef {
    match stored {
        Some(id) => NodeRef::Stored(id),
        None => MemNode::Leaf(existing).into(),
    }
}

fn set_branch(
    mut branch: BranchNode,
    key: &[u8],
    value: &[u8],
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<(MemNode, bool), Error> {
    branch.version = version;
    branch.hash = None;

    let updated = if key < branch.key.as_slice() {
        let left = std::mem::replace(&mut branch.left, NodeRef::Stored(NodeId::NONE));
        let (new_left, updated) = set(left, key, value, version, store, orphans)?;
        branch.left = new_left.into();
        updated
    } else {
        let right = std::mem::replace(&mut branch.right, NodeRef::Stored(NodeId::NONE));
        let (new_right, updated) = set(right, key, value, version, store, orphans)?;
        branch.right = new_right.into();
        updated
    };

    if updated {
        // a replaced leaf leaves heights and sizes untouched
        return Ok((MemNode::Branch(branch), true));
    }
    update_height_size(&mut branch, store)?;
    Ok((balance(branch, version, store, orphans)?, false))
}

/// Removes `key` from the subtree.
///
/// Returns `(new_self, new_split_key, removed_value)`: `new_self` is `None`
/// when the whole subtree was the removed leaf; `new_split_key` propagates
/// the replacement split key upward when the removed leaf was the smallest
/// of some right subtree; `removed_value` is `None` when the key was absent,
/// in which case the subtree is returned unchanged and nothing is orphaned.
#[allow(clippy::type_complexity)]
pub(crate) fn remove(
    node_ref: NodeRef,
    key: &[u8],
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<(Option<NodeRef>, Option<Vec<u8>>, Option<Vec<u8>>), Error> {
    match node_ref {
        NodeRef::Stored(id) if id.is_leaf() => {
            let StoredNode::Leaf(leaf) = store.resolve(id)? else {
                return Err(Error::CorruptionError(format!(
                    "leaf id {:?} resolved to a branch",
                    id
                )));
            };
            if leaf.key.as_ref() == key {
                let value = leaf.value.into_owned();
                orphans.push(id);
                Ok((None, None, Some(value)))
            } else {
                Ok((Some(NodeRef::Stored(id)), None, None))
            }
        }
        NodeRef::Stored(id) => {
            let StoredNode::Branch(branch) = store.resolve(id)? else {
                return Err(Error::CorruptionError(format!(
                    "branch id {:?} resolved to a leaf",
                    id
                )));
            };
            let parts = BranchParts {
                key: branch.key.into_owned(),
                left: NodeRef::Stored(branch.left),
                right: NodeRef::Stored(branch.right),
                height: branch.height,
                size: branch.size,
                stored: Some(id),
            };
            remove_branch(parts, key, version, store, orphans)
        }
        NodeRef::Mem(node) => match *node {
            MemNode::Leaf(leaf) => {
                if leaf.key.as_slice() == key {
                    Ok((None, None, Some(leaf.value)))
                } else {
                    Ok((Some(MemNode::Leaf(leaf).into()), None, None))
                }
            }
            MemNode::Branch(branch) => {
                let parts = BranchParts {
                    key: branch.key,
                    left: branch.left,
                    right: branch.right,
                    height: branch.height,
                    size: branch.size,
                    stored: None,
                };
                remove_branch(parts, key, version, store, orphans)
            }
        },
    }
}

struct BranchParts {
    key: Vec<u8>,
    left: NodeRef,
    right: NodeRef,
    height: u8,
    size: u32,
    stored: Option<NodeId>,
}

/// Rebuilds the original, untouched node after a miss: persisted branches
/// stay lazy references, in-memory ones are reassembled as they were.
fn rebuild_unchanged(
    stored: Option<NodeId>,
    key: Vec<u8>,
    left: NodeRef,
    right: NodeRef,
    height: u8,
    size: u32,
    version: Version,
) -> NodeRef {
    match stored {
        Some(id) => NodeRef::Stored(id),
        None => MemNode::Branch(BranchNode {
            key,
            left,
            right,
            height,
            size,
            version,
            hash: None,
        })
        .into(),
    }
}

#[allow(clippy::type_complexity)]
fn remove_branch(
    parts: BranchParts,
    key: &[u8],
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<(Option<NodeRef>, Option<Vec<u8>>, Option<Vec<u8>>), Error> {
    let BranchParts {
        key: split_key,
        left,
        right,
        height,
        size,
        stored,
    } = parts;

    if key < split_key.as_slice() {
        let (new_left, new_key, value) = remove(left, key, version, store, orphans)?;
        if value.is_none() {
            let left = new_left.expect("a miss returns the subtree unchanged");
            let node = rebuild_unchanged(stored, split_key, left, right, height, size, version);
            return Ok((Some(node), None, None));
        }
        if let Some(id) = stored {
            orphans.push(id);
        }
        match new_left {
            // the left subtree was the removed leaf itself: collapse to the
            // right child and propagate our split key upward, since it is
            // now the smallest key of the surviving subtree
            None => Ok((Some(right), Some(split_key), value)),
            Some(new_left) => {
                let mut branch = BranchNode {
                    key: split_key,
                    left: new_left,
                    right,
                    height,
                    size,
                    version,
                    hash: None,
                };
                update_height_size(&mut branch, store)?;
                let balanced = balance(branch, version, store, orphans)?;
                Ok((Some(balanced.into()), new_key, value))
            }
        }
    } else {
        let (new_right, new_key, value) = remove(right, key, version, store, orphans)?;
        if value.is_none() {
            let right = new_right.expect("a miss returns the subtree unchanged");
            let node = rebuild_unchanged(stored, split_key, left, right, height, size, version);
            return Ok((Some(node), None, None));
        }
        if let Some(id) = stored {
            orphans.push(id);
        }
        match new_right {
            None => Ok((Some(left), None, value)),
            Some(new_right) => {
                let mut branch = BranchNode {
                    // the removed leaf may have been the smallest of our
                    // right subtree; absorb the replacement split key here
                    key: new_key.unwrap_or(split_key),
                    left,
                    right: new_right,
                    height,
                    size,
                    version,
                    hash: None,
                };
                update_height_size(&mut branch, store)?;
                let balanced = balance(branch, version, store, orphans)?;
                Ok((Some(balanced.into()), None, value))
            }
        }
    }
}

/// Height and subtree size of a referenced node, resolving lazily.
pub(crate) fn ref_height_size(node_ref: &NodeRef, store: &NodeStore) -> Result<(u8, u32), Error> {
    match node_ref {
        NodeRef::Mem(node) => Ok((node.height(), node.size())),
        NodeRef::Stored(id) if id.is_leaf() => Ok((0, 1)),
        NodeRef::Stored(id) => {
            let node = store.resolve(*id)?;
            Ok((node.height(), node.size()))
        }
    }
}

fn update_height_size(branch: &mut BranchNode, store: &NodeStore) -> Result<(), Error> {
    let (left_height, left_size) = ref_height_size(&branch.left, store)?;
    let (right_height, right_size) = ref_height_size(&branch.right, store)?;
    branch.height = 1 + left_height.max(right_height);
    branch.size = left_size + right_size;
    Ok(())
}

fn balance_factor(branch: &BranchNode, store: &NodeStore) -> Result<i16, Error> {
    let (left_height, _) = ref_height_size(&branch.left, store)?;
    let (right_height, _) = ref_height_size(&branch.right, store)?;
    Ok(left_height as i16 - right_height as i16)
}

/// Converts a referenced branch into a mutable mem node at the working
/// version, orphaning its persisted predecessor. Rotations only ever reach
/// for branches here; a leaf would mean the AVL invariant was already
/// broken.
fn materialize_branch(
    node_ref: NodeRef,
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<BranchNode, Error> {
    match node_ref {
        NodeRef::Mem(node) => match *node {
            MemNode::Branch(mut branch) => {
                branch.version = version;
                branch.hash = None;
                Ok(branch)
            }
            MemNode::Leaf(_) => {
                debug_assert!(false, "rotation reached a leaf");
                Err(Error::InvalidOperation("rotation reached a leaf"))
            }
        },
        NodeRef::Stored(id) => {
            let StoredNode::Branch(stored) = store.resolve(id)? else {
                debug_assert!(false, "rotation reached a leaf");
                return Err(Error::InvalidOperation("rotation reached a leaf"));
            };
            let branch = BranchNode {
                key: stored.key.into_owned(),
                left: NodeRef::Stored(stored.left),
                right: NodeRef::Stored(stored.right),
                height: stored.height,
                size: stored.size,
                version,
                hash: None,
            };
            orphans.push(id);
            Ok(branch)
        }
    }
}

/// Checks the node's balance factor and applies single or double AVL
/// rotations as needed. Heights and sizes are recomputed for every rotated
/// node.
fn balance(
    branch: BranchNode,
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<MemNode, Error> {
    let factor = balance_factor(&branch, store)?;
    debug_assert!(factor.abs() <= 2, "balance factor {} out of range", factor);
    if factor.abs() <= 1 {
        return Ok(MemNode::Branch(branch));
    }

    if factor > 1 {
        let mut branch = branch;
        let left = std::mem::replace(&mut branch.left, NodeRef::Stored(NodeId::NONE));
        let left = materialize_branch(left, version, store, orphans)?;
        if balance_factor(&left, store)? >= 0 {
            // left-left
            branch.left = MemNode::Branch(left).into();
            rotate_right(branch, version, store, orphans)
        } else {
            // left-right
            let rotated = rotate_left(left, version, store, orphans)?;
            branch.left = rotated.into();
            rotate_right(branch, version, store, orphans)
        }
    } else {
        let mut branch = branch;
        let right = std::mem::replace(&mut branch.right, NodeRef::Stored(NodeId::NONE));
        let right = materialize_branch(right, version, store, orphans)?;
        if balance_factor(&right, store)? <= 0 {
            // right-right
            branch.right = MemNode::Branch(right).into();
            rotate_left(branch, version, store, orphans)
        } else {
            // right-left
            let rotated = rotate_right(right, version, store, orphans)?;
            branch.right = rotated.into();
            rotate_left(branch, version, store, orphans)
        }
    }
}

/// Single right rotation: the left child becomes the subtree root.
fn rotate_right(
    mut branch: BranchNode,
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<MemNode, Error> {
    let left = std::mem::replace(&mut branch.left, NodeRef::Stored(NodeId::NONE));
    let mut left = materialize_branch(left, version, store, orphans)?;
    branch.left = std::mem::replace(&mut left.right, NodeRef::Stored(NodeId::NONE));
    update_height_size(&mut branch, store)?;
    left.right = MemNode::Branch(branch).into();
    update_height_size(&mut left, store)?;
    Ok(MemNode::Branch(left))
}

/// Single left rotation: the right child becomes the subtree root.
fn rotate_left(
    mut branch: BranchNode,
    version: Version,
    store: &NodeStore,
    orphans: &mut Vec<NodeId>,
) -> Result<MemNode, Error> {
    let right = std::mem::replace(&mut branch.right, NodeRef::Stored(NodeId::NONE));
    let mut right = materialize_branch(right, version, store, orphans)?;
    branch.right = std::mem::replace(&mut right.left, NodeRef::Stored(NodeId::NONE));
    update_height_size(&mut branch, store)?;
    right.left = MemNode::Branch(branch).into();
    update_height_size(&mut right, store)?;
    Ok(MemNode::Branch(right))
}

/// Computes and caches hashes bottom-up over the unpersisted part of the
/// subtree. Persisted children contribute their stored hash; already-hashed
/// mem nodes are not revisited. Run before flushing, while the store is
/// still borrowed shared.
pub(crate) fn compute_hashes(node: &mut MemNode, store: &NodeStore) -> Result<CryptoHash, Error> {
    if let Some(hash) = node.cached_hash() {
        return Ok(hash);
    }
    match node {
        MemNode::Leaf(leaf) => {
            let hash = leaf_hash(leaf.version, &leaf.key, &leaf.value);
            leaf.hash = Some(hash);
            Ok(hash)
        }
        MemNode::Branch(branch) => {
            let left = ref_hash(&mut branch.left, store)?;
            let right = ref_hash(&mut branch.right, store)?;
            let hash = branch_hash(branch.height, branch.size, branch.version, &left, &right);
            branch.hash = Some(hash);
            Ok(hash)
        }
    }
}

fn ref_hash(node_ref: &mut NodeRef, store: &NodeStore) -> Result<CryptoHash, Error> {
    match node_ref {
        NodeRef::Mem(node) => compute_hashes(node, store),
        NodeRef::Stored(id) => store.resolve_hash(*id),
    }
}

/// Looks `key` up in the subtree, resolving persisted nodes lazily.
pub(crate) fn get<'a>(
    node_ref: &'a NodeRef,
    key: &[u8],
    store: &'a NodeStore,
) -> Result<Option<Cow<'a, [u8]>>, Error> {
    enum Cursor<'a> {
        Mem(&'a MemNode),
        Id(NodeId),
    }

    let mut cursor = match node_ref {
        NodeRef::Mem(node) => Cursor::Mem(node),
        NodeRef::Stored(id) => Cursor::Id(*id),
    };
    loop {
        match cursor {
            Cursor::Mem(MemNode::Leaf(leaf)) => {
                return Ok(if leaf.key.as_slice() == key {
                    Some(Cow::Borrowed(leaf.value.as_slice()))
                } else {
                    None
                });
            }
            Cursor::Mem(MemNode::Branch(branch)) => {
                let child = if key < branch.key.as_slice() {
                    &branch.left
                } else {
                    &branch.right
                };
                cursor = match child {
                    NodeRef::Mem(node) => Cursor::Mem(node),
                    NodeRef::Stored(id) => Cursor::Id(*id),
                };
            }
            Cursor::Id(id) => match store.resolve(id)? {
                StoredNode::Leaf(leaf) => {
                    return Ok(if leaf.key.as_ref() == key {
                        Some(leaf.value)
                    } else {
                        None
                    });
                }
                StoredNode::Branch(branch) => {
                    cursor = Cursor::Id(if key < branch.key.as_ref() {
                        branch.left
                    } else {
                        branch.right
                    });
                }
            },
        }
    }
}

/// Looks `key` up and computes its in-order rank among the leaves. The rank
/// is accumulated on the way down: descending right adds the size of the
/// skipped left subtree. When the key is absent the returned rank is the
/// position it would be inserted at.
pub(crate) fn get_with_index<'a>(
    node_ref: &'a NodeRef,
    key: &[u8],
    store: &'a NodeStore,
) -> Result<(u64, Option<Cow<'a, [u8]>>), Error> {
    enum Cursor<'a> {
        Mem(&'a MemNode),
        Id(NodeId),
    }

    let mut index: u64 = 0;
    let mut cursor = match node_ref {
        NodeRef::Mem(node) => Cursor::Mem(node),
        NodeRef::Stored(id) => Cursor::Id(*id),
    };
    loop {
        match cursor {
            Cursor::Mem(MemNode::Leaf(leaf)) => {
                return Ok(match key.cmp(leaf.key.as_slice()) {
                    Ordering::Equal => (index, Some(Cow::Borrowed(leaf.value.as_slice()))),
                    Ordering::Less => (index, None),
                    Ordering::Greater => (index + 1, None),
                });
            }
            Cursor::Mem(MemNode::Branch(branch)) => {
                let child = if key < branch.key.as_slice() {
                    &branch.left
                } else {
                    let (_, left_size) = ref_height_size(&branch.left, store)?;
                    index += left_size as u64;
                    &branch.right
                };
                cursor = match child {
                    NodeRef::Mem(node) => Cursor::Mem(node),
                    NodeRef::Stored(id) => Cursor::Id(*id),
                };
            }
            Cursor::Id(id) => match store.resolve(id)? {
                StoredNode::Leaf(leaf) => {
                    return Ok(match key.cmp(leaf.key.as_ref()) {
                        Ordering::Equal => (index, Some(leaf.value)),
                        Ordering::Less => (index, None),
                        Ordering::Greater => (index + 1, None),
                    });
                }
                StoredNode::Branch(branch) => {
                    cursor = Cursor::Id(if key < branch.key.as_ref() {
                        branch.left
                    } else {
                        let left_ref = NodeRef::Stored(branch.left);
                        let (_, left_size) = ref_height_size(&left_ref, store)?;
                        index += left_size as u64;
                        branch.right
                    });
                }
            },
        }
    }
}
