use integer_encoding::VarInt;

use crate::Version;

/// The length of a `Hash` (in bytes).
pub const HASH_LENGTH: usize = 32;

/// A zero-filled `Hash`.
pub const NULL_HASH: CryptoHash = [0; HASH_LENGTH];

/// A cryptographic hash digest.
pub type CryptoHash = [u8; HASH_LENGTH];

/// The hash of the empty tree: the hash function applied to zero bytes.
pub fn empty_tree_hash() -> CryptoHash {
    *blake3::Hasher::new().finalize().as_bytes()
}

/// Hashes a value.
///
/// Leaf hashes commit to the hash of the value rather than the value itself,
/// so that proofs can omit values.
pub fn value_hash(value: &[u8]) -> CryptoHash {
    *blake3::hash(value).as_bytes()
}

/// Hashes a leaf node.
///
/// The preimage is, in order: varint height (always 0), varint size (always
/// 1), varint version, varint-length-prefixed key, varint-length-prefixed
/// hash of the value. This ordering must be bit-exact across implementations.
pub fn leaf_hash(version: Version, key: &[u8], value: &[u8]) -> CryptoHash {
    leaf_hash_from_value_hash(version, key, &value_hash(value))
}

/// Hashes a leaf node given the digest of its value.
pub fn leaf_hash_from_value_hash(
    version: Version,
    key: &[u8],
    value_hash: &CryptoHash,
) -> CryptoHash {
    let mut hasher = blake3::Hasher::new();

    hasher.update(0u64.encode_var_vec().as_slice());
    hasher.update(1u64.encode_var_vec().as_slice());
    hasher.update((version as u64).encode_var_vec().as_slice());

    hasher.update(key.len().encode_var_vec().as_slice());
    hasher.update(key);

    hasher.update(HASH_LENGTH.encode_var_vec().as_slice());
    hasher.update(value_hash.as_slice());

    *hasher.finalize().as_bytes()
}

/// Hashes a branch node based on the hashes of its children.
///
/// The preimage is, in order: varint height, varint size, varint version,
/// varint-length-prefixed left child hash, varint-length-prefixed right child
/// hash. Children are committed to by hash only, never by content.
pub fn branch_hash(
    height: u8,
    size: u32,
    version: Version,
    left: &CryptoHash,
    right: &CryptoHash,
) -> CryptoHash {
    let mut hasher = blake3::Hasher::new();

    hasher.update((height as u64).encode_var_vec().as_slice());
    hasher.update((size as u64).encode_var_vec().as_slice());
    hasher.update((version as u64).encode_var_vec().as_slice());

    hasher.update(HASH_LENGTH.encode_var_vec().as_slice());
    hasher.update(left.as_slice());

    hasher.update(HASH_LENGTH.encode_var_vec().as_slice());
    hasher.update(right.as_slice());

    *hasher.finalize().as_bytes()
}
