//! Read-only views of committed versions.

use std::borrow::Cow;

use crate::{
    error::Error,
    export::Exporter,
    iter::TreeIterator,
    proofs::{self, KeyProof},
    store::NodeStore,
    tree::{ops, CryptoHash, NodeId, NodeRef},
    Version,
};

/// An independent read-only tree over one committed version's root. Reads
/// never observe later commits; no coordination with the writer is needed
/// beyond the shared store borrow.
pub struct ImmutableTree<'a> {
    store: &'a NodeStore,
    root: Option<NodeRef>,
    root_hash: CryptoHash,
    version: Version,
}

impl<'a> ImmutableTree<'a> {
    pub(crate) fn new(
        store: &'a NodeStore,
        version: Version,
        root_id: NodeId,
        root_hash: CryptoHash,
    ) -> Self {
        let root = (!root_id.is_none()).then_some(NodeRef::Stored(root_id));
        ImmutableTree {
            store,
            root,
            root_hash,
            version,
        }
    }

    /// The committed version this view reads.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The committed root hash of this version.
    pub fn root_hash(&self) -> CryptoHash {
        self.root_hash
    }

    /// The number of keys in this version.
    pub fn size(&self) -> Result<u32, Error> {
        match &self.root {
            None => Ok(0),
            Some(root) => Ok(ops::ref_height_size(root, self.store)?.1),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Cow<'_, [u8]>>, Error> {
        match &self.root {
            None => Ok(None),
            Some(root) => ops::get(root, key, self.store),
        }
    }

    /// Looks up a key along with its in-order rank. When the key is absent
    /// the rank is the position it would be inserted at.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(u64, Option<Cow<'_, [u8]>>), Error> {
        match &self.root {
            None => Ok((0, None)),
            Some(root) => ops::get_with_index(root, key, self.store),
        }
    }

    /// Iterates `[start, end)` in key order.
    pub fn iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator<'_> {
        TreeIterator::new(self.root.as_ref(), self.store, start, end, ascending)
    }

    /// Streams this version's nodes in post-order for snapshot transfer.
    pub fn export(&self) -> Exporter<'_> {
        let root_id = match self.root {
            Some(NodeRef::Stored(id)) => Some(id),
            _ => None,
        };
        Exporter::new(self.store, root_id)
    }

    /// Builds an inclusion proof for `key` against this version's root hash.
    pub fn get_proof(&self, key: &[u8]) -> Result<KeyProof, Error> {
        match self.root {
            Some(NodeRef::Stored(id)) => proofs::create_proof(self.store, id, key),
            _ => Err(Error::ProofCreationError(
                "cannot prove against an empty tree".to_string(),
            )),
        }
    }
}
