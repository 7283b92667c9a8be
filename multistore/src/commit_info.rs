//! Commit metadata and the aggregate commitment.
//!
//! A `CommitInfo` records one multi-store commit: the version, a timestamp,
//! and each store's root hash. Its hash — a simple binary Merkle tree over
//! the name-sorted store list — is the externally observed application
//! state root. Sorting before hashing makes the commitment independent of
//! the order stores were mounted in.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use iavl::{CryptoHash, HASH_LENGTH};
use integer_encoding::{VarInt, VarIntReader, VarIntWriter};

use crate::error::Error;

/// Domain separation prefixes for the Merkle tree, so a leaf can never be
/// reinterpreted as an inner node.
const LEAF_PREFIX: u8 = 0x00;
const INNER_PREFIX: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitId {
    pub version: i64,
    pub hash: CryptoHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    pub name: String,
    pub commit_id: CommitId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub version: i64,
    /// Unix nanoseconds of the block this commit belongs to.
    pub timestamp: i64,
    /// Always sorted ascending by store name.
    pub store_infos: Vec<StoreInfo>,
}

impl CommitInfo {
    /// Normalizes the store list by name before construction.
    pub fn new(version: i64, timestamp: i64, mut store_infos: Vec<StoreInfo>) -> Self {
        store_infos.sort_by(|a, b| a.name.cmp(&b.name));
        CommitInfo {
            version,
            timestamp,
            store_infos,
        }
    }

    /// The aggregate commitment over all stores.
    pub fn hash(&self) -> CryptoHash {
        debug_assert!(
            self.store_infos.windows(2).all(|w| w[0].name < w[1].name),
            "store infos must be sorted by name"
        );
        let leaves: Vec<CryptoHash> = self
            .store_infos
            .iter()
            .map(|info| merkle_leaf(&leaf_bytes(&info.name, &info.commit_id.hash)))
            .collect();
        merkle_root(&leaves)
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writer.write_u32::<LittleEndian>(self.version as u32)?;
        writer.write_u64::<LittleEndian>(self.timestamp as u64)?;
        writer.write_u32::<LittleEndian>(self.store_infos.len() as u32)?;
        for info in &self.store_infos {
            writer.write_varint(info.name.len() as u64)?;
            writer.write_all(info.name.as_bytes())?;
        }
        for info in &self.store_infos {
            writer.write_varint(HASH_LENGTH as u64)?;
            writer.write_all(&info.commit_id.hash)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let version = reader.read_u32::<LittleEndian>()? as i64;
        let timestamp = reader.read_u64::<LittleEndian>()? as i64;
        let count = reader.read_u32::<LittleEndian>()?;

        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len: u64 = reader.read_varint()?;
            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes)?;
            let name = String::from_utf8(bytes).map_err(|_| {
                Error::CorruptionError("store name is not valid utf-8".to_string())
            })?;
            names.push(name);
        }

        // stores commit in lockstep, so the file records a single version
        // that every decoded commit id shares
        let mut store_infos = Vec::with_capacity(count as usize);
        for name in names {
            let len: u64 = reader.read_varint()?;
            if len != HASH_LENGTH as u64 {
                return Err(Error::CorruptionError(format!(
                    "commit hash has {} bytes, expected {}",
                    len, HASH_LENGTH
                )));
            }
            let mut hash = [0u8; HASH_LENGTH];
            reader.read_exact(&mut hash)?;
            store_infos.push(StoreInfo {
                name,
                commit_id: CommitId { version, hash },
            });
        }

        Ok(CommitInfo {
            version,
            timestamp,
            store_infos,
        })
    }
}

/// The preimage a store contributes as a Merkle leaf.
pub(crate) fn leaf_bytes(name: &str, commit_hash: &CryptoHash) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + HASH_LENGTH + 2);
    buf.extend_from_slice(name.len().encode_var_vec().as_slice());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(commit_hash);
    buf
}

pub(crate) fn merkle_leaf(bytes: &[u8]) -> CryptoHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(bytes);
    *hasher.finalize().as_bytes()
}

pub(crate) fn merkle_inner(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[INNER_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// The largest power of two strictly less than `n`.
pub(crate) fn split_point(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut point = 1;
    while point * 2 < n {
        point *= 2;
    }
    point
}

/// Root of a simple Merkle tree over already-hashed leaves, split at the
/// largest power of two strictly below the length.
pub(crate) fn merkle_root(leaves: &[CryptoHash]) -> CryptoHash {
    match leaves.len() {
        0 => *blake3::Hasher::new().finalize().as_bytes(),
        1 => leaves[0],
        n => {
            let point = split_point(n);
            merkle_inner(
                &merkle_root(&leaves[..point]),
                &merkle_root(&leaves[point..]),
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(name: &str, fill: u8) -> StoreInfo {
        StoreInfo {
            name: name.to_string(),
            commit_id: CommitId {
                version: 1,
                hash: [fill; HASH_LENGTH],
            },
        }
    }

    #[test]
    fn new_sorts_by_name() {
        let ci = CommitInfo::new(1, 0, vec![info("bank", 2), info("acc", 1), info("gov", 3)]);
        let names: Vec<&str> = ci.store_infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["acc", "bank", "gov"]);
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let a = CommitInfo::new(1, 0, vec![info("x", 1), info("y", 2), info("z", 3)]);
        let b = CommitInfo::new(1, 0, vec![info("z", 3), info("x", 1), info("y", 2)]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_commits_to_every_store() {
        let base = CommitInfo::new(1, 0, vec![info("x", 1), info("y", 2)]);
        let changed = CommitInfo::new(1, 0, vec![info("x", 1), info("y", 9)]);
        let renamed = CommitInfo::new(1, 0, vec![info("x", 1), info("w", 2)]);
        assert_ne!(base.hash(), changed.hash());
        assert_ne!(base.hash(), renamed.hash());
    }

    #[test]
    fn codec_round_trip() {
        // per-store versions equal the aggregate version (lockstep commit);
        // the file format records the version once
        let lockstep = |name: &str, fill: u8| StoreInfo {
            name: name.to_string(),
            commit_id: CommitId {
                version: 42,
                hash: [fill; HASH_LENGTH],
            },
        };
        let ci = CommitInfo::new(
            42,
            1_700_000_000_000_000_000,
            vec![lockstep("bank", 7), lockstep("staking", 9)],
        );
        let mut buf = Vec::new();
        ci.encode(&mut buf).expect("encode");
        let decoded = CommitInfo::decode(&mut buf.as_slice()).expect("decode");
        assert_eq!(decoded, ci);
        assert_eq!(decoded.hash(), ci.hash());
    }

    #[test]
    fn truncated_file_is_an_error() {
        let ci = CommitInfo::new(1, 0, vec![info("bank", 7)]);
        let mut buf = Vec::new();
        ci.encode(&mut buf).expect("encode");
        let truncated = &buf[..buf.len() - 4];
        assert!(CommitInfo::decode(&mut &truncated[..]).is_err());
    }

    #[test]
    fn split_points() {
        assert_eq!(split_point(2), 1);
        assert_eq!(split_point(3), 2);
        assert_eq!(split_point(4), 2);
        assert_eq!(split_point(5), 4);
        assert_eq!(split_point(8), 4);
        assert_eq!(split_point(9), 8);
    }
}
