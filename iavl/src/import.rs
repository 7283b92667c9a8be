//! Streaming import for bulk state transfer.
//!
//! An import consumes the post-order stream produced by an export and
//! reconstructs the tree bottom-up with a stack, bypassing the mutation and
//! rebalancing path entirely: the stream came from a valid tree, so it is
//! already sorted and balanced. Heights are revalidated against the
//! reconstructed children as a cheap structural check.

use crate::{
    error::Error,
    export::ExportNode,
    mutable::MutableTree,
    tree::{ops, BranchNode, CryptoHash, MemNode, NodeRef},
    Version,
};

/// Rebuilds one version from an export stream into an empty tree.
///
/// Feed nodes with [`Importer::add`] in stream order, then call
/// [`Importer::commit`] to hash and persist the version.
pub struct Importer<'a> {
    tree: &'a mut MutableTree,
    version: Version,
    stack: Vec<MemNode>,
}

impl<'a> Importer<'a> {
    pub(crate) fn new(tree: &'a mut MutableTree, version: Version) -> Result<Self, Error> {
        if version == 0 {
            return Err(Error::InvalidOperation("cannot import version 0"));
        }
        if tree.latest_version().is_some() || tree.has_pending_changes() {
            return Err(Error::InvalidOperation(
                "import requires an empty tree with no pending changes",
            ));
        }
        Ok(Importer {
            tree,
            version,
            stack: Vec::new(),
        })
    }

    /// Adds the next node of the stream. A branch consumes its two most
    /// recently added subtrees.
    pub fn add(&mut self, node: ExportNode) -> Result<(), Error> {
        if node.height == 0 {
            let value = node
                .value
                .ok_or(Error::InvalidOperation("leaf without a value in import stream"))?;
            self.stack.push(MemNode::Leaf(crate::tree::LeafNode {
                key: node.key,
                value,
                version: node.version,
                hash: None,
            }));
            return Ok(());
        }

        if node.value.is_some() {
            return Err(Error::InvalidOperation("branch with a value in import stream"));
        }
        let right = self
            .stack
            .pop()
            .ok_or(Error::InvalidOperation("branch before its children in import stream"))?;
        let left = self
            .stack
            .pop()
            .ok_or(Error::InvalidOperation("branch before its children in import stream"))?;
        if node.height != 1 + left.height().max(right.height()) {
            return Err(Error::InvalidOperation("height mismatch in import stream"));
        }
        let size = left.size() + right.size();
        self.stack.push(MemNode::Branch(BranchNode {
            key: node.key,
            left: left.into(),
            right: right.into(),
            height: node.height,
            size,
            version: node.version,
            hash: None,
        }));
        Ok(())
    }

    /// Hashes the reconstructed tree and commits it as the target version.
    /// The stream must have reduced to a single root (or nothing, for an
    /// empty version).
    pub fn commit(mut self) -> Result<(Version, CryptoHash), Error> {
        if self.stack.len() > 1 {
            return Err(Error::InvalidOperation("incomplete import stream"));
        }
        let (root, hash) = match self.stack.pop() {
            None => (None, crate::tree::hash::empty_tree_hash()),
            Some(mut node) => {
                let hash = ops::compute_hashes(&mut node, &self.tree.store)?;
                (Some(NodeRef::from(node)), hash)
            }
        };
        let record = self
            .tree
            .store
            .commit_version(self.version, root, hash, &[])?;
        self.tree.root =
            (!record.root_id.is_none()).then_some(NodeRef::Stored(record.root_id));
        self.tree.version = self.version + 1;
        Ok((self.version, record.hash))
    }
}
