// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The on-disk layout: a directory with two subtrees --
//! `blobs/<two-char-prefix>/<hash>` for file blobs and `directories/<two-char-prefix>/<hash>`
//! for serialised `Directory` entries -- plus an atomic lease file recording `{digest: expiry}`.
//!
//! Sharding by the first two hex characters of the fingerprint keeps any one directory from
//! holding more than ~1/256th of the store's blobs, which matters once a monorepo's build
//! touches millions of distinct digests over its lifetime.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Leading `::` picks the `fs` crate over the `std::fs` module already imported below by its
// bare name.
use ::fs::directory::{Directory, DirectoryEntry};
use hashing::{Digest, Fingerprint};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

const LEASE_FILE_NAME: &str = "leases.json";

#[derive(Default, Serialize, Deserialize)]
struct Leases {
    /// Fingerprint hex -> expiry, nanoseconds since the Unix epoch.
    expiry_ns: HashMap<String, u128>,
}

/// A local, file-backed content store. Safe for concurrent readers and writers: writes for the
/// same digest are idempotent (the publish is a rename over an existing file, which is a no-op
/// in content terms), and the lease table is guarded by a mutex and persisted atomically.
pub struct LocalStore {
    root: PathBuf,
    leases: Mutex<Leases>,
}

enum Kind {
    Blob,
    Directory,
}

impl Kind {
    fn subdir(&self) -> &'static str {
        match self {
            Kind::Blob => "blobs",
            Kind::Directory => "directories",
        }
    }
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<LocalStore> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))?;
        fs::create_dir_all(root.join("directories"))?;
        let leases = Self::load_leases(&root).unwrap_or_default();
        Ok(LocalStore {
            root,
            leases: Mutex::new(leases),
        })
    }

    fn load_leases(root: &Path) -> StoreResult<Leases> {
        let path = root.join(LEASE_FILE_NAME);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Leases::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist_leases(&self, leases: &Leases) -> StoreResult<()> {
        let bytes = serde_json::to_vec(leases)?;
        atomic_write(&self.root.join(LEASE_FILE_NAME), &bytes)
    }

    fn path_for(&self, kind: Kind, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(kind.subdir())
            .join(fingerprint.shard_prefix())
            .join(fingerprint.to_hex())
    }

    /// Idempotently inserts `bytes`, returning its digest. Publication is atomic: the content is
    /// written to a sibling temp file, then renamed into place, so a reader can never observe a
    /// partially written blob, and a crash mid-write never corrupts an existing one.
    pub fn store_bytes(&self, bytes: &[u8]) -> StoreResult<Digest> {
        let digest = Digest::of_bytes(bytes);
        let path = self.path_for(Kind::Blob, &digest.hash);
        if !path.exists() {
            atomic_write(&path, bytes)?;
        }
        Ok(digest)
    }

    pub fn load_bytes(&self, digest: Digest) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(Kind::Blob, &digest.hash);
        match fs::read(&path) {
            Ok(bytes) => {
                if bytes.len() != digest.size_bytes {
                    return Err(StoreError::Corruption(format!(
                        "digest {digest} names {} bytes on disk but claims size {}",
                        bytes.len(),
                        digest.size_bytes
                    )));
                }
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store_directory_bytes(&self, digest: Digest, bytes: &[u8]) -> StoreResult<()> {
        let path = self.path_for(Kind::Directory, &digest.hash);
        if !path.exists() {
            atomic_write(&path, bytes)?;
        }
        Ok(())
    }

    pub fn load_directory_bytes(&self, digest: Digest) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(Kind::Directory, &digest.hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_blob(&self, digest: Digest) -> bool {
        self.path_for(Kind::Blob, &digest.hash).exists()
    }

    /// The on-disk path a blob is published at, for callers (the sandbox materialiser) that want
    /// to hard-link rather than read-and-rewrite the bytes. Does not check the blob exists.
    pub fn blob_path(&self, digest: Digest) -> PathBuf {
        self.path_for(Kind::Blob, &digest.hash)
    }

    /// Leases protect a digest from eviction for `ttl`. Extending the lease on a digest that's
    /// already leased simply moves its expiry forward; leases never shrink another holder's
    /// window.
    pub fn lease(&self, digest: Digest, ttl: Duration) -> StoreResult<()> {
        let expiry = now_ns() + ttl.as_nanos();
        let mut leases = self.leases.lock();
        let entry = leases.expiry_ns.entry(digest.hash.to_hex()).or_insert(0);
        if *entry < expiry {
            *entry = expiry;
        }
        self.persist_leases(&leases)
    }

    /// Parses the stored `Directory` named by `fingerprint` (if any digest leased directly is in
    /// fact a directory, not a blob) and adds every file digest it transitively references to
    /// `protected`, recursing into child directories. A leased tree protects every blob it
    /// references this way, not just its own top-level digest.
    fn collect_reachable_blobs(
        &self,
        fingerprint: &Fingerprint,
        visited_directories: &mut HashSet<Fingerprint>,
        protected: &mut HashSet<Fingerprint>,
    ) -> StoreResult<()> {
        if !visited_directories.insert(*fingerprint) {
            return Ok(());
        }
        let path = self.path_for(Kind::Directory, fingerprint);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let directory = Directory::from_canonical_bytes(&bytes).map_err(StoreError::Corruption)?;
        for entry in directory.entries() {
            match entry {
                DirectoryEntry::File { digest, .. } => {
                    protected.insert(digest.hash);
                }
                DirectoryEntry::Directory { digest, .. } => {
                    self.collect_reachable_blobs(&digest.hash, visited_directories, protected)?;
                }
            }
        }
        Ok(())
    }

    /// Removes lease entries whose expiry has passed, then evicts unleased blobs under LRU order
    /// (oldest access time first) until disk usage is at or below `high_water_mark_bytes`. Before
    /// evicting anything, every live lease is resolved as a potential directory digest and walked
    /// so that a lease on a `Snapshot`/`Directory` protects the file blobs it references, not just
    /// its own top-level digest. Directory entries themselves are never evicted: they're small,
    /// and `reap` only ever walks `blobs/`.
    pub fn reap(&self, high_water_mark_bytes: u64) -> StoreResult<ReapReport> {
        let now = now_ns();
        let mut protected: HashSet<Fingerprint> = HashSet::new();
        {
            let mut leases = self.leases.lock();
            leases.expiry_ns.retain(|_, expiry| *expiry > now);
            self.persist_leases(&leases)?;
            for hex in leases.expiry_ns.keys() {
                if let Ok(fingerprint) = Fingerprint::from_hex_string(hex) {
                    protected.insert(fingerprint);
                }
            }
        }
        let mut visited_directories = HashSet::new();
        for fingerprint in protected.clone() {
            self.collect_reachable_blobs(&fingerprint, &mut visited_directories, &mut protected)?;
        }

        let blobs_dir = self.root.join("blobs");
        let mut entries: Vec<(PathBuf, Fingerprint, u64, SystemTime)> = Vec::new();
        let mut total_bytes: u64 = 0;
        for entry in walkdir::WalkDir::new(&blobs_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| StoreError::Io(e.into()))?;
            let fingerprint = match entry.file_name().to_str().and_then(|h| Fingerprint::from_hex_string(h).ok()) {
                Some(fp) => fp,
                None => continue,
            };
            total_bytes += metadata.len();
            entries.push((
                entry.path().to_path_buf(),
                fingerprint,
                metadata.len(),
                metadata.accessed().unwrap_or(UNIX_EPOCH),
            ));
        }

        entries.sort_by_key(|(_, _, _, accessed)| *accessed);

        let mut evicted = 0usize;
        let mut freed_bytes = 0u64;
        for (path, fingerprint, len, _) in entries {
            if total_bytes - freed_bytes <= high_water_mark_bytes {
                break;
            }
            if protected.contains(&fingerprint) {
                continue;
            }
            fs::remove_file(&path)?;
            freed_bytes += len;
            evicted += 1;
        }

        Ok(ReapReport {
            evicted_blobs: evicted,
            freed_bytes,
        })
    }

    pub fn disk_usage_bytes(&self) -> StoreResult<u64> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(self.root.join("blobs")) {
            let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(|e| StoreError::Io(e.into()))?.len();
            }
        }
        Ok(total)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReapReport {
    pub evicted_blobs: usize,
    pub freed_bytes: u64,
}

fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch")
        .as_nanos()
}

/// Writes `bytes` to a temp file beside `path` and renames it into place. `rename` is atomic on
/// the same filesystem, so a concurrent reader either sees the old absent file or the complete
/// new one -- never a partial write, and never the torn content a signal or panic mid-`write`
/// could otherwise leave behind.
fn atomic_write(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = path.parent().expect("store paths always have a parent dir");
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn store_bytes_is_idempotent_and_content_addressed() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let d1 = store.store_bytes(b"hello").unwrap();
        let d2 = store.store_bytes(b"hello").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.load_bytes(d1).unwrap().unwrap(), b"hello".to_vec());
    }

    #[test]
    fn load_bytes_returns_none_for_unknown_digest() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let digest = Digest::of_bytes(b"never stored");
        assert_eq!(store.load_bytes(digest).unwrap(), None);
    }

    #[test]
    fn reap_never_evicts_a_leased_blob() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let digest = store.store_bytes(b"precious").unwrap();
        store.lease(digest, Duration::from_secs(3600)).unwrap();
        let report = store.reap(0).unwrap();
        assert_eq!(report.evicted_blobs, 0);
        assert!(store.load_bytes(digest).unwrap().is_some());
    }

    #[test]
    fn reap_evicts_unleased_blobs_when_over_the_high_water_mark() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let digest = store.store_bytes(b"evict me").unwrap();
        let report = store.reap(0).unwrap();
        assert_eq!(report.evicted_blobs, 1);
        assert_eq!(store.load_bytes(digest).unwrap(), None);
    }

    #[test]
    fn expired_leases_no_longer_protect_a_blob() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let digest = store.store_bytes(b"short lease").unwrap();
        store.lease(digest, Duration::from_nanos(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let report = store.reap(0).unwrap();
        assert_eq!(report.evicted_blobs, 1);
    }

    #[test]
    fn leasing_a_directory_protects_the_file_blobs_it_references() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let file_digest = store.store_bytes(b"tree contents").unwrap();
        let directory = Directory::new(vec![DirectoryEntry::File {
            name: "a".to_string(),
            digest: file_digest,
            is_executable: false,
        }])
        .unwrap();
        let directory_digest = directory.digest();
        store
            .store_directory_bytes(directory_digest.0, &directory.to_canonical_bytes())
            .unwrap();
        store.lease(directory_digest.0, Duration::from_secs(3600)).unwrap();

        let report = store.reap(0).unwrap();

        assert_eq!(report.evicted_blobs, 0);
        assert!(store.load_bytes(file_digest).unwrap().is_some());
    }

    #[test]
    fn reap_walks_nested_directories_to_protect_their_blobs() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let file_digest = store.store_bytes(b"nested contents").unwrap();
        let inner = Directory::new(vec![DirectoryEntry::File {
            name: "nested".to_string(),
            digest: file_digest,
            is_executable: false,
        }])
        .unwrap();
        let inner_digest = inner.digest();
        store
            .store_directory_bytes(inner_digest.0, &inner.to_canonical_bytes())
            .unwrap();

        let outer = Directory::new(vec![DirectoryEntry::Directory {
            name: "sub".to_string(),
            digest: inner_digest.0,
        }])
        .unwrap();
        let outer_digest = outer.digest();
        store
            .store_directory_bytes(outer_digest.0, &outer.to_canonical_bytes())
            .unwrap();
        store.lease(outer_digest.0, Duration::from_secs(3600)).unwrap();

        let report = store.reap(0).unwrap();

        assert_eq!(report.evicted_blobs, 0);
        assert!(store.load_bytes(file_digest).unwrap().is_some());
    }
}
