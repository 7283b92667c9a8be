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

//! A versioned, authenticated key-value store.
//!
//! Every commit produces an immutable snapshot identified by a version
//! number and a 32-byte root hash. The tree is an AVL variant where only
//! leaves carry key-value pairs and branches carry the smallest key of
//! their right subtree; mutation is copy-on-write, so historical versions
//! stay readable until explicitly pruned. Per-key Merkle proofs tie any
//! value to a root hash.
//!
//! The `verify` feature builds only the types needed to check proofs
//! against a trusted root hash, without the storage engine.

#[cfg(feature = "full")]
pub mod batch;
pub mod error;
#[cfg(feature = "full")]
pub mod export;
#[cfg(feature = "full")]
pub mod immutable;
#[cfg(feature = "full")]
pub mod import;
#[cfg(feature = "full")]
pub mod iter;
#[cfg(feature = "full")]
pub mod mutable;
#[cfg(any(feature = "full", feature = "verify"))]
pub mod proofs;
#[cfg(feature = "full")]
pub mod store;
pub mod tree;

/// A committed snapshot number. Version 0 is reserved to mean "latest" in
/// lookups; the first committed version is 1.
pub type Version = u32;

pub use error::Error;
pub use tree::NodeId;
#[cfg(any(feature = "full", feature = "verify"))]
pub use tree::{CryptoHash, HASH_LENGTH, NULL_HASH};

#[cfg(feature = "full")]
pub use crate::{
    batch::{Batch, BatchEntry},
    export::{ExportNode, Exporter},
    immutable::ImmutableTree,
    import::Importer,
    iter::TreeIterator,
    mutable::MutableTree,
    store::{NodeStore, PruneOptions, StoreOptions},
};
#[cfg(any(feature = "full", feature = "verify"))]
pub use crate::proofs::{KeyProof, ProofStep};
