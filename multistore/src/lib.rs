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

//! Multi-store commitment over independently named trees.
//!
//! A `MultiStore` mounts named [`MutableTree`]s under one directory and
//! commits them in lockstep: every commit advances all stores to the same
//! version and records a [`CommitInfo`] whose hash aggregates the per-store
//! root hashes into the single externally observed application state root.

pub mod commit_info;
pub mod error;
pub mod proof;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use iavl::{MutableTree, StoreOptions, Version};
use indexmap::IndexMap;

pub use crate::{
    commit_info::{CommitId, CommitInfo, StoreInfo},
    error::Error,
    proof::StoreProof,
};

const COMMIT_INFO_DIR: &str = "commit_info";
const STORES_DIR: &str = "stores";

pub struct MultiStore {
    dir: PathBuf,
    options: StoreOptions,
    /// Kept sorted by name, so commit order is deterministic no matter the
    /// mount order.
    stores: IndexMap<String, MutableTree>,
    version: Version,
    last_commit_info: Option<CommitInfo>,
}

impl MultiStore {
    /// Opens (or creates) a multi-store rooted at `dir`. Mount the stores,
    /// then call [`MultiStore::load_latest`].
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(COMMIT_INFO_DIR))?;
        fs::create_dir_all(dir.join(STORES_DIR))?;
        Ok(MultiStore {
            dir,
            options,
            stores: IndexMap::new(),
            version: 0,
            last_commit_info: None,
        })
    }

    /// Mounts a named tree under `stores/<name>`.
    pub fn mount(&mut self, name: &str) -> Result<(), Error> {
        if self.stores.contains_key(name) {
            return Err(Error::InvalidOperation("store is already mounted"));
        }
        let tree = MutableTree::open(self.dir.join(STORES_DIR).join(name), self.options)?;
        self.stores.insert(name.to_string(), tree);
        self.stores.sort_keys();
        Ok(())
    }

    /// Restores from the highest commit-info file and loads every mounted
    /// store at that version. Stores with no history yet (mounted into an
    /// existing multi-store) start empty at the next commit's version.
    /// Returns the restored version, 0 when nothing was committed.
    pub fn load_latest(&mut self) -> Result<Version, Error> {
        let (version, info) = self.read_latest_commit_info()?;
        for tree in self.stores.values_mut() {
            if tree.latest_version().is_none() {
                tree.load_version(0)?;
                if version > 0 {
                    tree.set_initial_version(version + 1)?;
                }
            } else {
                tree.load_version(version)?;
            }
        }
        self.version = version;
        self.last_commit_info = info;
        Ok(version)
    }

    /// Commits every mounted store at the next version and persists the
    /// commit info. Returns the new aggregate commit id.
    pub fn commit(&mut self, timestamp: i64) -> Result<CommitId, Error> {
        let target = self.version + 1;
        let mut infos = Vec::with_capacity(self.stores.len());
        for (name, tree) in self.stores.iter_mut() {
            let (version, hash) = tree.commit()?;
            if version != target {
                return Err(Error::InvalidOperation(
                    "store version out of step with the multi-store",
                ));
            }
            infos.push(StoreInfo {
                name: name.clone(),
                commit_id: CommitId {
                    version: version as i64,
                    hash,
                },
            });
        }
        let info = CommitInfo::new(target as i64, timestamp, infos);

        let path = self.commit_info_path(target);
        let mut file = File::create(&path)?;
        info.encode(&mut file)?;
        file.sync_data()?;

        let commit_id = CommitId {
            version: target as i64,
            hash: info.hash(),
        };
        self.version = target;
        self.last_commit_info = Some(info);
        Ok(commit_id)
    }

    /// The latest committed version, 0 when nothing was committed.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn last_commit_info(&self) -> Option<&CommitInfo> {
        self.last_commit_info.as_ref()
    }

    pub fn last_commit_id(&self) -> Option<CommitId> {
        self.last_commit_info.as_ref().map(|info| CommitId {
            version: info.version,
            hash: info.hash(),
        })
    }

    /// Reads a historical commit info back from disk.
    pub fn commit_info(&self, version: Version) -> Result<CommitInfo, Error> {
        let path = self.commit_info_path(version);
        let mut file = File::open(&path)
            .map_err(|_| Error::VersionNotFound(version as i64))?;
        CommitInfo::decode(&mut file)
    }

    pub fn tree(&self, name: &str) -> Result<&MutableTree, Error> {
        self.stores
            .get(name)
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))
    }

    pub fn tree_mut(&mut self, name: &str) -> Result<&mut MutableTree, Error> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))
    }

    /// Mounted store names, sorted.
    pub fn store_names(&self) -> Vec<&str> {
        self.stores.keys().map(String::as_str).collect()
    }

    /// An inclusion proof for one store's root hash inside the latest
    /// aggregate commitment.
    pub fn get_store_proof(&self, name: &str) -> Result<StoreProof, Error> {
        self.last_commit_info
            .as_ref()
            .ok_or(Error::InvalidOperation("nothing has been committed"))?
            .store_proof(name)
    }

    fn commit_info_path(&self, version: Version) -> PathBuf {
        self.dir.join(COMMIT_INFO_DIR).join(version.to_string())
    }

    fn read_latest_commit_info(&self) -> Result<(Version, Option<CommitInfo>), Error> {
        let mut latest: Version = 0;
        for entry in fs::read_dir(self.dir.join(COMMIT_INFO_DIR))? {
            let entry = entry?;
            // skip files that are not version-numbered
            if let Ok(version) = entry.file_name().to_string_lossy().parse::<Version>() {
                latest = latest.max(version);
            }
        }
        if latest == 0 {
            return Ok((0, None));
        }
        let info = self.commit_info(latest)?;
        Ok((latest, Some(info)))
    }
}
