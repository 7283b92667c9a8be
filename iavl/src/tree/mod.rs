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

//! Tree node model

#[cfg(any(feature = "full", feature = "verify"))]
pub mod hash;
#[cfg(feature = "full")]
pub mod ops;

use std::fmt;

#[cfg(any(feature = "full", feature = "verify"))]
pub use hash::{CryptoHash, HASH_LENGTH, NULL_HASH};

use crate::Version;

/// Marks the sequence half of a `NodeId` as referring to a leaf record.
const LEAF_BIT: u32 = 1 << 31;

/// Identifies a persisted node: the version it was committed at, plus its
/// local sequence number within that version's segment. Sequence numbers
/// start at 1; the high bit of the sequence distinguishes leaves from
/// branches. `NodeId` is the persistence key and the unit of orphan
/// tracking.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// The absent node id, used for the root of an empty tree.
    pub const NONE: NodeId = NodeId(0);

    /// Creates a branch node id.
    #[inline]
    pub fn branch(version: Version, sequence: u32) -> Self {
        debug_assert!(sequence > 0 && sequence < LEAF_BIT);
        NodeId(((version as u64) << 32) | sequence as u64)
    }

    /// Creates a leaf node id.
    #[inline]
    pub fn leaf(version: Version, sequence: u32) -> Self {
        debug_assert!(sequence > 0 && sequence < LEAF_BIT);
        NodeId(((version as u64) << 32) | (sequence | LEAF_BIT) as u64)
    }

    /// The version this node was committed at.
    #[inline]
    pub fn version(&self) -> Version {
        (self.0 >> 32) as Version
    }

    /// The node's sequence number within its version segment, starting at 1.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.0 as u32 & !LEAF_BIT
    }

    /// Returns `true` if the id refers to a leaf record.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.0 as u32 & LEAF_BIT != 0
    }

    /// Returns `true` if this is the absent node id.
    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(raw: u64) -> Self {
        NodeId(raw)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        let kind = if self.is_leaf() { "L" } else { "B" };
        write!(f, "{}:{}{}", self.version(), kind, self.sequence())
    }
}

#[cfg(feature = "full")]
/// A leaf node: owns a real key/value pair. Height is always 0 and size is
/// always 1.
#[derive(Clone, Debug)]
pub struct LeafNode {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: Version,
    pub(crate) hash: Option<CryptoHash>,
}

#[cfg(feature = "full")]
/// A branch node. Only leaves own real key/value pairs; a branch's key is
/// the split key, the smallest key reachable in its right subtree. Traversal
/// compares the target key against it: strictly smaller keys go left,
/// everything else goes right.
#[derive(Clone, Debug)]
pub struct BranchNode {
    pub key: Vec<u8>,
    pub left: NodeRef,
    pub right: NodeRef,
    pub height: u8,
    pub size: u32,
    pub version: Version,
    pub(crate) hash: Option<CryptoHash>,
}

#[cfg(feature = "full")]
/// An in-memory node created by the current working version and not yet
/// persisted. Nodes become immutable the instant they are hashed and
/// flushed; until then they are owned exclusively by the working tree.
#[derive(Clone, Debug)]
pub enum MemNode {
    Leaf(LeafNode),
    Branch(BranchNode),
}

#[cfg(feature = "full")]
impl MemNode {
    /// Creates a new unpersisted leaf.
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: Version) -> Self {
        MemNode::Leaf(LeafNode {
            key,
            value,
            version,
            hash: None,
        })
    }

    /// The node's height: 0 for leaves.
    #[inline]
    pub fn height(&self) -> u8 {
        match self {
            MemNode::Leaf(_) => 0,
            MemNode::Branch(branch) => branch.height,
        }
    }

    /// The number of leaves in the node's subtree: 1 for leaves.
    #[inline]
    pub fn size(&self) -> u32 {
        match self {
            MemNode::Leaf(_) => 1,
            MemNode::Branch(branch) => branch.size,
        }
    }

    /// The leaf key, or the branch split key.
    #[inline]
    pub fn key(&self) -> &[u8] {
        match self {
            MemNode::Leaf(leaf) => &leaf.key,
            MemNode::Branch(branch) => &branch.key,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, MemNode::Leaf(_))
    }

    /// The cached hash, if it has been computed.
    #[inline]
    pub(crate) fn cached_hash(&self) -> Option<CryptoHash> {
        match self {
            MemNode::Leaf(leaf) => leaf.hash,
            MemNode::Branch(branch) => branch.hash,
        }
    }
}

#[cfg(feature = "full")]
/// An ownership-free handle to a child node: either an already-materialized
/// `MemNode` owned exclusively by the working tree, or the id of a persisted
/// node to be resolved lazily through the node store. Resolution is
/// idempotent and side-effect free.
#[derive(Clone, Debug)]
pub enum NodeRef {
    Mem(Box<MemNode>),
    Stored(NodeId),
}

#[cfg(feature = "full")]
impl NodeRef {
    /// Returns `true` if the handle refers to a persisted node.
    #[inline]
    pub fn is_stored(&self) -> bool {
        matches!(self, NodeRef::Stored(_))
    }

    /// The `MemNode` behind the handle, if it is materialized.
    #[inline]
    pub fn mem(&self) -> Option<&MemNode> {
        match self {
            NodeRef::Mem(node) => Some(node),
            NodeRef::Stored(_) => None,
        }
    }
}

#[cfg(feature = "full")]
impl From<MemNode> for NodeRef {
    fn from(node: MemNode) -> Self {
        NodeRef::Mem(Box::new(node))
    }
}
