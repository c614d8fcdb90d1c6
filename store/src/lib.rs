// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Content-addressed blob and directory storage. A `Store` is local-file-backed
//! with an LRU eviction policy (see [`local`]), and may optionally mirror to a remote CAS (see
//! [`remote`]) so that a cache hit on one machine can be served to another.

pub mod local;
pub mod remote;
pub mod snapshot;

pub use crate::remote::RemoteStore;
pub use crate::snapshot::capture_snapshot;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs::directory::{Directory, DirectoryDigest, DirectoryEntry};
use fs::RelativePath;
use hashing::Digest;

use crate::local::LocalStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("store corruption: {0}")]
    Corruption(String),
    #[error("directory merge conflict: {0}")]
    MergeConflict(String),
    #[error("unknown digest: {0}")]
    UnknownDigest(Digest),
    #[error("remote store error: {0}")]
    Remote(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The façade every other component talks to. Holds a `Digest` or `DirectoryDigest`, never the
/// bytes themselves: callers dereference through `load_bytes`/`load_directory` on demand, which
/// is what keeps large blobs from leaking across task boundaries by reference to mutable memory.
#[derive(Clone)]
pub struct Store {
    local: Arc<LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl Store {
    pub fn local_only(root: impl Into<PathBuf>) -> StoreResult<Store> {
        Ok(Store {
            local: Arc::new(LocalStore::new(root)?),
            remote: None,
        })
    }

    pub fn with_remote(root: impl Into<PathBuf>, remote: Arc<dyn RemoteStore>) -> StoreResult<Store> {
        Ok(Store {
            local: Arc::new(LocalStore::new(root)?),
            remote: Some(remote),
        })
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> StoreResult<Digest> {
        self.local.store_bytes(bytes)
    }

    /// Loads a blob, falling back to the remote mirror (and populating the local store from it)
    /// on a local miss. Returns `None` only if neither tier has the content -- `load_bytes` never
    /// invents content to paper over a miss.
    pub async fn load_bytes(&self, digest: Digest) -> StoreResult<Option<Vec<u8>>> {
        if let Some(bytes) = self.local.load_bytes(digest)? {
            return Ok(Some(bytes));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        match remote.load_bytes(digest).await? {
            Some(bytes) => {
                self.local.store_bytes(&bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn store_directory(&self, directory: &Directory) -> StoreResult<DirectoryDigest> {
        let digest = directory.digest();
        self.local
            .store_directory_bytes(digest.0, &directory.to_canonical_bytes())?;
        Ok(digest)
    }

    pub fn load_directory(&self, digest: DirectoryDigest) -> StoreResult<Option<Directory>> {
        match self.local.load_directory_bytes(digest.0)? {
            Some(bytes) => Ok(Some(
                Directory::from_canonical_bytes(&bytes).map_err(StoreError::Corruption)?,
            )),
            None => Ok(None),
        }
    }

    /// Deterministically unions two or more directory trees, failing with `MergeConflict` if the
    /// same relative path names different content or a mismatched executable bit in more than
    /// one input -- this is what lets a process's declared input digest be built by merging its
    /// sources, its resolved dependencies, and its append-only caches independently.
    pub fn merge_directories(&self, digests: Vec<DirectoryDigest>) -> StoreResult<DirectoryDigest> {
        let mut by_name: BTreeMap<String, DirectoryEntry> = BTreeMap::new();
        for digest in digests {
            let Some(directory) = self.load_directory(digest)? else {
                return Err(StoreError::UnknownDigest(digest.0));
            };
            for entry in directory.entries() {
                match by_name.get(entry.name()) {
                    None => {
                        by_name.insert(entry.name().to_owned(), entry.clone());
                    }
                    Some(existing) if existing == entry => {}
                    Some(DirectoryEntry::Directory { digest: existing_digest, .. }) => {
                        if let DirectoryEntry::Directory { digest: new_digest, .. } = entry {
                            let merged = self.merge_directories(vec![
                                DirectoryDigest(*existing_digest),
                                DirectoryDigest(*new_digest),
                            ])?;
                            by_name.insert(
                                entry.name().to_owned(),
                                DirectoryEntry::Directory {
                                    name: entry.name().to_owned(),
                                    digest: merged.0,
                                },
                            );
                        } else {
                            return Err(StoreError::MergeConflict(format!(
                                "{:?} is a directory in one input and a file in another",
                                entry.name()
                            )));
                        }
                    }
                    Some(_) => {
                        return Err(StoreError::MergeConflict(format!(
                            "{:?} has different content or executable bit in two inputs",
                            entry.name()
                        )));
                    }
                }
            }
        }
        let merged = Directory::new(by_name.into_values().collect())
            .map_err(|e| StoreError::MergeConflict(e.to_string()))?;
        self.store_directory(&merged)
    }

    /// Extracts the subtree of `digest` matching `globs`, as a fresh `Directory` tree: every
    /// level is walked, files whose reconstructed relative path doesn't satisfy `globs.is_match`
    /// are dropped, and a directory that ends up with no surviving entries is dropped from its
    /// parent in turn. Mirrors the bottom-up rebuild `snapshot::TreeBuilder::store_level` does
    /// when assembling a tree from scratch, just pruning an existing one instead.
    pub fn subset(&self, digest: DirectoryDigest, globs: &fs::PreparedPathGlobs) -> StoreResult<DirectoryDigest> {
        let pruned = self.subset_level(digest, globs, &RelativePath::empty())?;
        self.store_directory(&pruned)
    }

    fn subset_level(
        &self,
        digest: DirectoryDigest,
        globs: &fs::PreparedPathGlobs,
        prefix: &RelativePath,
    ) -> StoreResult<Directory> {
        let Some(directory) = self.load_directory(digest)? else {
            return Err(StoreError::UnknownDigest(digest.0));
        };

        let mut entries = Vec::new();
        for entry in directory.entries() {
            let child_path = RelativePath::new(entry.name()).map_err(StoreError::Corruption)?;
            let child_path = prefix.join(&child_path);
            match entry {
                DirectoryEntry::File { .. } => {
                    if globs.is_match(child_path.as_ref()) {
                        entries.push(entry.clone());
                    }
                }
                DirectoryEntry::Directory { name, digest: child_digest } => {
                    let pruned = self.subset_level(DirectoryDigest(*child_digest), globs, &child_path)?;
                    if !pruned.is_empty() {
                        let stored = self.store_directory(&pruned)?;
                        entries.push(DirectoryEntry::Directory {
                            name: name.clone(),
                            digest: stored.0,
                        });
                    }
                }
            }
        }
        Directory::new(entries).map_err(|e| StoreError::Corruption(e.to_string()))
    }

    pub fn lease(&self, digest: Digest, ttl: Duration) -> StoreResult<()> {
        self.local.lease(digest, ttl)
    }

    pub fn reap(&self, high_water_mark_bytes: u64) -> StoreResult<local::ReapReport> {
        self.local.reap(high_water_mark_bytes)
    }

    pub fn has_blob(&self, digest: Digest) -> bool {
        self.local.has_blob(digest)
    }

    /// The on-disk path of a stored blob, for a sandbox materialiser that wants to hard-link a
    /// file into place rather than copy its bytes. Does not check that the blob is present.
    pub fn blob_path(&self, digest: Digest) -> PathBuf {
        self.local.blob_path(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::directory::DirectoryEntry;
    use tempfile::tempdir;

    fn file(name: &str, content: &[u8]) -> DirectoryEntry {
        DirectoryEntry::File {
            name: name.to_owned(),
            digest: Digest::of_bytes(content),
            is_executable: false,
        }
    }

    #[test]
    fn merge_directories_unions_disjoint_paths() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let a = store
            .store_directory(&Directory::new(vec![file("a", b"a")]).unwrap())
            .unwrap();
        let b = store
            .store_directory(&Directory::new(vec![file("b", b"b")]).unwrap())
            .unwrap();
        let merged = store.merge_directories(vec![a, b]).unwrap();
        let tree = store.load_directory(merged).unwrap().unwrap();
        assert_eq!(tree.entries().len(), 2);
    }

    #[test]
    fn merge_directories_is_idempotent_for_identical_entries() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let a = store
            .store_directory(&Directory::new(vec![file("a", b"a")]).unwrap())
            .unwrap();
        let merged = store.merge_directories(vec![a, a]).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn merge_directories_conflicts_on_same_path_different_content() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let a = store
            .store_directory(&Directory::new(vec![file("a", b"one")]).unwrap())
            .unwrap();
        let b = store
            .store_directory(&Directory::new(vec![file("a", b"two")]).unwrap())
            .unwrap();
        assert!(matches!(
            store.merge_directories(vec![a, b]),
            Err(StoreError::MergeConflict(_))
        ));
    }

    #[tokio::test]
    async fn load_bytes_without_remote_returns_none_on_miss() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let digest = Digest::of_bytes(b"absent");
        assert_eq!(store.load_bytes(digest).await.unwrap(), None);
    }

    fn globs(patterns: &[&str]) -> fs::PreparedPathGlobs {
        fs::PathGlobs {
            include: patterns.iter().map(|s| s.to_string()).collect(),
            exclude: Vec::new(),
            conjunction: fs::GlobExpansionConjunction::All,
            missing: fs::GlobMatchErrorBehavior::Ignore,
        }
        .parse()
        .unwrap()
    }

    fn dir_entry(name: &str, digest: DirectoryDigest) -> DirectoryEntry {
        DirectoryEntry::Directory {
            name: name.to_owned(),
            digest: digest.0,
        }
    }

    #[test]
    fn subset_keeps_only_matching_files() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let tree = store
            .store_directory(&Directory::new(vec![file("a.py", b"a"), file("b.txt", b"b")]).unwrap())
            .unwrap();

        let subset = store.subset(tree, &globs(&["*.py"])).unwrap();
        let pruned = store.load_directory(subset).unwrap().unwrap();

        assert_eq!(pruned.entries().to_vec(), vec![file("a.py", b"a")]);
    }

    #[test]
    fn subset_drops_subdirectories_left_with_no_matches() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let inner = store
            .store_directory(&Directory::new(vec![file("b.txt", b"b")]).unwrap())
            .unwrap();
        let outer = store
            .store_directory(&Directory::new(vec![file("a.py", b"a"), dir_entry("pkg", inner)]).unwrap())
            .unwrap();

        let subset = store.subset(outer, &globs(&["*.py"])).unwrap();
        let pruned = store.load_directory(subset).unwrap().unwrap();

        assert_eq!(pruned.entries().to_vec(), vec![file("a.py", b"a")]);
    }

    #[test]
    fn subset_keeps_a_subdirectory_with_a_surviving_match() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let inner = store
            .store_directory(&Directory::new(vec![file("b.py", b"b")]).unwrap())
            .unwrap();
        let outer = store
            .store_directory(&Directory::new(vec![dir_entry("pkg", inner)]).unwrap())
            .unwrap();

        let subset = store.subset(outer, &globs(&["**/*.py"])).unwrap();
        let pruned = store.load_directory(subset).unwrap().unwrap();

        assert_eq!(pruned.entries().len(), 1);
        let DirectoryEntry::Directory { digest, .. } = &pruned.entries()[0] else {
            panic!("expected a surviving subdirectory");
        };
        let pkg = store.load_directory(DirectoryDigest(*digest)).unwrap().unwrap();
        assert_eq!(pkg.entries().to_vec(), vec![file("b.py", b"b")]);
    }

    #[test]
    fn subset_of_an_unknown_digest_is_an_error() {
        let dir = tempdir().unwrap();
        let store = Store::local_only(dir.path()).unwrap();
        let unknown = Directory::new(vec![file("a", b"a")]).unwrap().digest();
        assert!(matches!(
            store.subset(unknown, &globs(&["*"])),
            Err(StoreError::UnknownDigest(_))
        ));
    }
}
