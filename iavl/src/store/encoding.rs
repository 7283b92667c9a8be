//! Fixed-layout on-disk record codecs.
//!
//! Branch and leaf records have a fixed size so a `NodeId` resolves to a
//! byte offset by arithmetic alone; key and value bytes live in a separate
//! append-only blob region addressed by offset.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::Error,
    tree::{CryptoHash, NodeId, HASH_LENGTH},
    Version,
};

/// Byte layout of a branch record:
/// id(8) | left(8) | right(8) | key_offset(8) | height(1) | size(4) |
/// version(4) | orphaned_at(4) | hash(32).
///
/// The id names the segment the record lives in; `version` is the logical
/// creation version committed to by the hash. They differ for imported
/// nodes.
pub const BRANCH_RECORD_SIZE: usize = 8 + 8 + 8 + 8 + 1 + 4 + 4 + 4 + HASH_LENGTH;

/// Byte layout of a leaf record:
/// id(8) | key_offset(8) | value_offset(8) | version(4) | orphaned_at(4) |
/// hash(32).
pub const LEAF_RECORD_SIZE: usize = 8 + 8 + 8 + 4 + 4 + HASH_LENGTH;

/// Byte layout of a root record: version(4) | root_id(8) | hash(32).
pub const ROOT_RECORD_SIZE: usize = 4 + 8 + HASH_LENGTH;

/// Byte layout of a segment record:
/// version(4) | first_branch(8) | branches(4) | first_leaf(8) | leaves(4).
pub const SEGMENT_RECORD_SIZE: usize = 4 + 8 + 4 + 8 + 4;

/// Byte layout of an orphan log entry: id(8) | orphaned_at(4).
pub const ORPHAN_RECORD_SIZE: usize = 8 + 4;

const _: () = assert!(BRANCH_RECORD_SIZE == 77);
const _: () = assert!(LEAF_RECORD_SIZE == 64);
const _: () = assert!(ROOT_RECORD_SIZE == 44);
const _: () = assert!(SEGMENT_RECORD_SIZE == 28);
const _: () = assert!(ORPHAN_RECORD_SIZE == 12);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BranchRecord {
    pub id: NodeId,
    pub left: NodeId,
    pub right: NodeId,
    pub key_offset: u64,
    pub height: u8,
    pub size: u32,
    pub version: Version,
    pub orphaned_at: Version,
    pub hash: CryptoHash,
}

impl BranchRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.left.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.right.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.key_offset.to_le_bytes());
        buf.push(self.height);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.orphaned_at.to_le_bytes());
        buf.extend_from_slice(&self.hash);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != BRANCH_RECORD_SIZE {
            return Err(Error::CorruptionError(format!(
                "branch record has {} bytes, expected {}",
                buf.len(),
                BRANCH_RECORD_SIZE
            )));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&buf[45..77]);
        Ok(BranchRecord {
            id: NodeId::from_u64(LittleEndian::read_u64(&buf[0..8])),
            left: NodeId::from_u64(LittleEndian::read_u64(&buf[8..16])),
            right: NodeId::from_u64(LittleEndian::read_u64(&buf[16..24])),
            key_offset: LittleEndian::read_u64(&buf[24..32]),
            height: buf[32],
            size: LittleEndian::read_u32(&buf[33..37]),
            version: LittleEndian::read_u32(&buf[37..41]),
            orphaned_at: LittleEndian::read_u32(&buf[41..45]),
            hash,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LeafRecord {
    pub id: NodeId,
    pub key_offset: u64,
    pub value_offset: u64,
    pub version: Version,
    pub orphaned_at: Version,
    pub hash: CryptoHash,
}

impl LeafRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.key_offset.to_le_bytes());
        buf.extend_from_slice(&self.value_offset.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.orphaned_at.to_le_bytes());
        buf.extend_from_slice(&self.hash);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != LEAF_RECORD_SIZE {
            return Err(Error::CorruptionError(format!(
                "leaf record has {} bytes, expected {}",
                buf.len(),
                LEAF_RECORD_SIZE
            )));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&buf[32..64]);
        Ok(LeafRecord {
            id: NodeId::from_u64(LittleEndian::read_u64(&buf[0..8])),
            key_offset: LittleEndian::read_u64(&buf[8..16]),
            value_offset: LittleEndian::read_u64(&buf[16..24]),
            version: LittleEndian::read_u32(&buf[24..28]),
            orphaned_at: LittleEndian::read_u32(&buf[28..32]),
            hash,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RootRecord {
    pub version: Version,
    pub root_id: NodeId,
    pub hash: CryptoHash,
}

impl RootRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.root_id.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.hash);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != ROOT_RECORD_SIZE {
            return Err(Error::CorruptionError(format!(
                "root record has {} bytes, expected {}",
                buf.len(),
                ROOT_RECORD_SIZE
            )));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&buf[12..44]);
        Ok(RootRecord {
            version: LittleEndian::read_u32(&buf[0..4]),
            root_id: NodeId::from_u64(LittleEndian::read_u64(&buf[4..12])),
            hash,
        })
    }
}

/// Where one committed version's records live inside the node tables.
/// Nodes of a version are flushed contiguously, so `NodeId -> offset` is
/// `(first + sequence - 1) * record size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegmentRecord {
    pub version: Version,
    pub first_branch: u64,
    pub branches: u32,
    pub first_leaf: u64,
    pub leaves: u32,
}

impl SegmentRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.first_branch.to_le_bytes());
        buf.extend_from_slice(&self.branches.to_le_bytes());
        buf.extend_from_slice(&self.first_leaf.to_le_bytes());
        buf.extend_from_slice(&self.leaves.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != SEGMENT_RECORD_SIZE {
            return Err(Error::CorruptionError(format!(
                "segment record has {} bytes, expected {}",
                buf.len(),
                SEGMENT_RECORD_SIZE
            )));
        }
        Ok(SegmentRecord {
            version: LittleEndian::read_u32(&buf[0..4]),
            first_branch: LittleEndian::read_u64(&buf[4..12]),
            branches: LittleEndian::read_u32(&buf[12..16]),
            first_leaf: LittleEndian::read_u64(&buf[16..24]),
            leaves: LittleEndian::read_u32(&buf[24..28]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OrphanRecord {
    pub id: NodeId,
    pub orphaned_at: Version,
}

impl OrphanRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.orphaned_at.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != ORPHAN_RECORD_SIZE {
            return Err(Error::CorruptionError(format!(
                "orphan record has {} bytes, expected {}",
                buf.len(),
                ORPHAN_RECORD_SIZE
            )));
        }
        Ok(OrphanRecord {
            id: NodeId::from_u64(LittleEndian::read_u64(&buf[0..8])),
            orphaned_at: LittleEndian::read_u32(&buf[8..12]),
        })
    }
}
