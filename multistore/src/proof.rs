//! Inclusion proofs for one store inside the aggregate commitment.

use iavl::CryptoHash;

use crate::{
    commit_info::{leaf_bytes, merkle_inner, merkle_leaf, merkle_root, split_point, CommitInfo},
    error::Error,
};

/// Proves that one store's commit hash is part of a `CommitInfo` hash.
/// Verification needs nothing but this object and the trusted aggregate
/// root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreProof {
    pub name: String,
    pub commit_hash: CryptoHash,
    /// Position of the store in the name-sorted list.
    pub index: u32,
    pub total: u32,
    /// Sibling subtree roots ordered leaf to root.
    pub siblings: Vec<CryptoHash>,
}

impl CommitInfo {
    /// Builds the inclusion proof for a named store.
    pub fn store_proof(&self, name: &str) -> Result<StoreProof, Error> {
        let index = self
            .store_infos
            .binary_search_by(|info| info.name.as_str().cmp(name))
            .map_err(|_| Error::StoreNotFound(name.to_string()))?;
        let leaves: Vec<CryptoHash> = self
            .store_infos
            .iter()
            .map(|info| merkle_leaf(&leaf_bytes(&info.name, &info.commit_id.hash)))
            .collect();
        let mut siblings = Vec::new();
        collect_siblings(&leaves, index, &mut siblings);
        Ok(StoreProof {
            name: name.to_string(),
            commit_hash: self.store_infos[index].commit_id.hash,
            index: index as u32,
            total: leaves.len() as u32,
            siblings,
        })
    }
}

fn collect_siblings(leaves: &[CryptoHash], index: usize, out: &mut Vec<CryptoHash>) {
    if leaves.len() <= 1 {
        return;
    }
    let point = split_point(leaves.len());
    if index < point {
        collect_siblings(&leaves[..point], index, out);
        out.push(merkle_root(&leaves[point..]));
    } else {
        collect_siblings(&leaves[point..], index - point, out);
        out.push(merkle_root(&leaves[..point]));
    }
}

impl StoreProof {
    /// Recomputes the aggregate root this proof resolves to.
    pub fn compute_root(&self) -> Result<CryptoHash, Error> {
        if self.total == 0 || self.index >= self.total {
            return Err(Error::InvalidProofError(format!(
                "index {} out of range for {} stores",
                self.index, self.total
            )));
        }
        let leaf = merkle_leaf(&leaf_bytes(&self.name, &self.commit_hash));
        fold(self.index as usize, self.total as usize, leaf, &self.siblings)
    }

    /// Checks the proof against a trusted aggregate root.
    pub fn verify(&self, root: &CryptoHash) -> Result<(), Error> {
        let computed = self.compute_root()?;
        if &computed == root {
            Ok(())
        } else {
            Err(Error::InvalidProofError(format!(
                "proof resolves to root {}, expected {}",
                hex::encode(computed),
                hex::encode(root)
            )))
        }
    }
}

/// Folds the sibling path bottom-up. The shallowest sibling is last, so
/// each level consumes from the end.
fn fold(
    index: usize,
    total: usize,
    leaf: CryptoHash,
    siblings: &[CryptoHash],
) -> Result<CryptoHash, Error> {
    if total == 1 {
        return if siblings.is_empty() {
            Ok(leaf)
        } else {
            Err(Error::InvalidProofError(
                "too many sibling hashes".to_string(),
            ))
        };
    }
    let Some((last, rest)) = siblings.split_last() else {
        return Err(Error::InvalidProofError(
            "too few sibling hashes".to_string(),
        ));
    };
    let point = split_point(total);
    if index < point {
        Ok(merkle_inner(&fold(index, point, leaf, rest)?, last))
    } else {
        Ok(merkle_inner(last, &fold(index - point, total - point, leaf, rest)?))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use iavl::HASH_LENGTH;

    use super::*;
    use crate::commit_info::{CommitId, StoreInfo};

    fn commit_info(names: &[&str]) -> CommitInfo {
        let infos = names
            .iter()
            .enumerate()
            .map(|(i, name)| StoreInfo {
                name: name.to_string(),
                commit_id: CommitId {
                    version: 1,
                    hash: [i as u8 + 1; HASH_LENGTH],
                },
            })
            .collect();
        CommitInfo::new(1, 0, infos)
    }

    #[test]
    fn every_store_proves_for_all_set_sizes() {
        let all = ["acc", "bank", "gov", "mint", "staking"];
        for n in 1..=all.len() {
            let ci = commit_info(&all[..n]);
            let root = ci.hash();
            for name in &all[..n] {
                let proof = ci.store_proof(name).expect("proof");
                proof.verify(&root).expect("verify");
                assert_eq!(proof.total as usize, n);
            }
        }
    }

    #[test]
    fn tampering_fails_verification() {
        let ci = commit_info(&["acc", "bank", "gov"]);
        let root = ci.hash();
        let proof = ci.store_proof("bank").expect("proof");

        let mut tampered = proof.clone();
        tampered.commit_hash[0] ^= 1;
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut tampered = proof.clone();
        tampered.name = "gov".to_string();
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut tampered = proof.clone();
        tampered.siblings[0][0] ^= 1;
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));

        let mut tampered = proof;
        tampered.siblings.pop();
        assert_matches!(tampered.verify(&root), Err(Error::InvalidProofError(_)));
    }

    #[test]
    fn unknown_store_has_no_proof() {
        let ci = commit_info(&["acc", "bank"]);
        assert_matches!(ci.store_proof("missing"), Err(Error::StoreNotFound(_)));
    }
}
