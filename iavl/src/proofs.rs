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

//! Per-key Merkle inclusion proofs.
//!
//! A proof records the root-to-leaf path of a `get`, keeping for each
//! branch the hash of the unvisited sibling subtree. Verification
//! recomputes the leaf hash from the claimed key and value, folds the
//! steps leaf-to-root, and compares against the known root hash. The step
//! ordering (leaf to root) is part of the stable proof format.

use crate::{
    error::Error,
    tree::hash::{branch_hash, leaf_hash, CryptoHash},
    Version,
};

#[cfg(feature = "full")]
use crate::{
    store::{NodeStore, StoredNode},
    tree::NodeId,
};

/// One branch on the path from the proven leaf up to the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    pub height: u8,
    pub size: u32,
    pub version: Version,
    /// Hash of the subtree not taken at this branch.
    pub sibling: CryptoHash,
    /// Whether the sibling is the left child.
    pub sibling_on_left: bool,
}

/// An inclusion proof for one key inside one committed version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyProof {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub leaf_version: Version,
    /// Path steps ordered leaf to root.
    pub steps: Vec<ProofStep>,
}

impl KeyProof {
    /// Checks the proof against a trusted root hash.
    pub fn verify(&self, root_hash: &CryptoHash) -> Result<(), Error> {
        let mut hash = leaf_hash(self.leaf_version, &self.key, &self.value);
        for step in &self.steps {
            hash = if step.sibling_on_left {
                branch_hash(step.height, step.size, step.version, &step.sibling, &hash)
            } else {
                branch_hash(step.height, step.size, step.version, &hash, &step.sibling)
            };
        }
        if &hash == root_hash {
            Ok(())
        } else {
            Err(Error::InvalidProofError(format!(
                "proof resolves to root {}, expected {}",
                hex::encode(hash),
                hex::encode(root_hash)
            )))
        }
    }
}

/// Walks the same root-to-leaf path as a `get`, recording sibling hashes.
/// The key must be present; absence proofs are not produced.
#[cfg(feature = "full")]
pub(crate) fn create_proof(
    store: &NodeStore,
    root: NodeId,
    key: &[u8],
) -> Result<KeyProof, Error> {
    let mut steps = Vec::new();
    let mut cursor = root;
    loop {
        match store.resolve(cursor)? {
            StoredNode::Branch(branch) => {
                let goes_left = key < branch.key.as_ref();
                let (next, sibling) = if goes_left {
                    (branch.left, branch.right)
                } else {
                    (branch.right, branch.left)
                };
                steps.push(ProofStep {
                    height: branch.height,
                    size: branch.size,
                    version: branch.version,
                    sibling: store.resolve_hash(sibling)?,
                    sibling_on_left: !goes_left,
                });
                cursor = next;
            }
            StoredNode::Leaf(leaf) => {
                if leaf.key.as_ref() != key {
                    return Err(Error::ProofCreationError(format!(
                        "key {} is not in the tree",
                        hex::encode(key)
                    )));
                }
                let proof = KeyProof {
                    key: leaf.key.into_owned(),
                    value: leaf.value.into_owned(),
                    leaf_version: leaf.version,
                    steps: {
                        steps.reverse();
                        steps
                    },
                };
                return Ok(proof);
            }
        }
    }
}

#[cfg(all(test, feature = "full"))]
mod test {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;
    use crate::{mutable::MutableTree, store::StoreOptions};

    fn populated_tree(dir: &TempDir, keys: u32) -> MutableTree {
        let mut tree = MutableTree::open(dir.path(), StoreOptions::default()).expect("open");
        for i in 0..keys {
            tree.set(format!("key{:02}", i).as_bytes(), format!("val{}", i).as_bytes())
                .expect("set");
        }
        tree.commit().expect("commit");
        tree
    }

    #[test]
    fn every_key_proves_against_the_root() {
        let dir = TempDir::new().expect("tempdir");
        let tree = populated_tree(&dir, 20);
        let view = tree.get_immutable(1).expect("view");
        for i in 0..20 {
            let key = format!("key{:02}", i);
            let proof = view.get_proof(key.as_bytes()).expect("proof");
            proof.verify(&view.root_hash()).expect("verify");
            assert_eq!(proof.value, format!("val{}", i).into_bytes());
        }
    }

    #[test]
    fn single_key_tree_has_an_empty_path() {
        let dir = TempDir::new().expect("tempdir");
        let tree = populated_tree(&dir, 1);
        let view = tree.get_immutable(1).expect("view");
        let proof = view.get_proof(b"key00").expect("proof");
        assert!(proof.steps.is_empty());
        proof.verify(&view.root_hash()).expect("verify");
    }

    #[test]
    fn tampering_fails_verification() {
        let dir = TempDir::new().expect("tempdir");
        let tree = populated_tree(&dir, 8);
        let view = tree.get_immutable(1).expect("view");
        let root = view.root_hash();
        let proof = view.get_proof(b"key03").expect("proof");

        let mut tampered = proof.clone();
        tampered.value = b"forged".to_vec();
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut tampered = proof.clone();
        tampered.key = b"key04".to_vec();
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut tampered = proof.clone();
        tampered.steps[0].sibling[0] ^= 1;
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut wrong_root = root;
        wrong_root[0] ^= 1;
        assert_matches!(proof.verify(&wrong_root), Err(Error::InvalidProofError(_)));
    }

    #[test]
    fn absent_key_cannot_be_proven() {
        let dir = TempDir::new().expect("tempdir");
        let tree = populated_tree(&dir, 4);
        let view = tree.get_immutable(1).expect("view");
        assert_matches!(
            view.get_proof(b"missing"),
            Err(Error::ProofCreationError(_))
        );
    }

    #[test]
    fn historical_version_proofs_still_verify() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = populated_tree(&dir, 8);
        tree.set(b"key03", b"changed").expect("set");
        tree.commit().expect("commit v2");

        let v1 = tree.get_immutable(1).expect("v1");
        let proof = v1.get_proof(b"key03").expect("proof");
        assert_eq!(proof.value, b"val3".to_vec());
        proof.verify(&v1.root_hash()).expect("verify");
        // a v1 proof does not verify against the v2 root
        let v2 = tree.get_immutable(2).expect("v2");
        assert_matches!(
            proof.verify(&v2.root_hash()),
            Err(Error::InvalidProofError(_))
        );
    }
}
