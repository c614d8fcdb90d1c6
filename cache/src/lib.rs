// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! A process-result cache table: small, untyped values addressed by an already-computed
//! fingerprint, checked in-memory first, then on local disk, then (optionally) remotely. Callers
//! serialize their own domain value (a `process_execution::ProcessResult`) before storing it and
//! deserialize after loading -- the value is stored under the fingerprint of its cache key rather
//! than of the value's own bytes.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashing::Fingerprint;
use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// An optional remote tier. `process_execution` implements this against whatever remote cache
/// protocol a backend configures; the fake used in tests and the in-memory-only default
/// deployment both satisfy it trivially.
#[async_trait::async_trait]
pub trait RemoteCache: Send + Sync {
    async fn load(&self, key: Fingerprint) -> CacheResult<Option<Vec<u8>>>;
    async fn store(&self, key: Fingerprint, value: Vec<u8>) -> CacheResult<()>;
}

/// A bounded, insertion-order-evicted in-memory tier. Not a strict LRU (a read does not bump an
/// entry's position) -- fine for a first-line cache in front of local disk, where a false miss
/// just costs one extra disk read.
struct MemoryTier {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    values: HashMap<Fingerprint, Vec<u8>>,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        MemoryTier {
            capacity,
            order: VecDeque::new(),
            values: HashMap::new(),
        }
    }

    fn get(&self, key: &Fingerprint) -> Option<Vec<u8>> {
        self.values.get(key).cloned()
    }

    fn insert(&mut self, key: Fingerprint, value: Vec<u8>) {
        if !self.values.contains_key(&key) {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.values.remove(&oldest);
                }
            }
        }
        self.values.insert(key, value);
    }
}

/// The local disk tier: one file per key, sharded by the first two hex characters of the
/// fingerprint (same layout convention as `store::local`), published via temp-file-then-rename so
/// a reader never observes a partial write.
struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    fn new(root: PathBuf) -> CacheResult<Self> {
        fs::create_dir_all(&root)?;
        Ok(DiskTier { root })
    }

    fn path_for(&self, key: &Fingerprint) -> PathBuf {
        self.root.join(key.shard_prefix()).join(key.to_hex())
    }

    fn load(&self, key: &Fingerprint) -> CacheResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &Fingerprint, value: &[u8]) -> CacheResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(value)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// The process-result cache: checks memory, then disk, then (if configured) a remote tier, and
/// back-fills every tier it missed on the way there.
#[derive(Clone)]
pub struct ProcessCache {
    memory: Arc<Mutex<MemoryTier>>,
    disk: Arc<DiskTier>,
    remote: Option<Arc<dyn RemoteCache>>,
}

impl ProcessCache {
    pub fn new(local_root: impl AsRef<Path>, memory_capacity: usize) -> CacheResult<Self> {
        Ok(ProcessCache {
            memory: Arc::new(Mutex::new(MemoryTier::new(memory_capacity))),
            disk: Arc::new(DiskTier::new(local_root.as_ref().to_path_buf())?),
            remote: None,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Looks up `key`, checking memory first, then disk, then remote; a hit at a slower tier is
    /// copied forward into every faster tier it missed.
    pub async fn load(&self, key: Fingerprint) -> CacheResult<Option<Vec<u8>>> {
        if let Some(value) = self.memory.lock().get(&key) {
            return Ok(Some(value));
        }
        if let Some(value) = self.disk.load(&key)? {
            self.memory.lock().insert(key, value.clone());
            return Ok(Some(value));
        }
        if let Some(remote) = &self.remote {
            if let Some(value) = remote.load(key).await? {
                self.disk.store(&key, &value)?;
                self.memory.lock().insert(key, value.clone());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Writes `value` under `key` to every configured tier.
    pub async fn store(&self, key: Fingerprint, value: Vec<u8>) -> CacheResult<()> {
        self.memory.lock().insert(key, value.clone());
        self.disk.store(&key, &value)?;
        if let Some(remote) = &self.remote {
            remote.store(key, value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashing::Digest;

    fn key(seed: &str) -> Fingerprint {
        Digest::of_bytes(seed.as_bytes()).hash
    }

    #[tokio::test]
    async fn stores_and_loads_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProcessCache::new(dir.path(), 8).unwrap();
        let k = key("argv: echo hi");
        cache.store(k, b"exit_code=0".to_vec()).await.unwrap();
        assert_eq!(cache.load(k).await.unwrap(), Some(b"exit_code=0".to_vec()));
    }

    #[tokio::test]
    async fn distinct_fingerprints_are_distinct_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProcessCache::new(dir.path(), 8).unwrap();
        let a = key("argv: echo hi");
        let b = key("argv: echo hi -l=120");
        cache.store(a, b"a".to_vec()).await.unwrap();
        cache.store(b, b"b".to_vec()).await.unwrap();
        assert_eq!(cache.load(a).await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(cache.load(b).await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn disk_hit_backfills_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProcessCache::new(dir.path(), 8).unwrap();
        let k = key("argv: echo hi");
        // Write straight to disk, bypassing the in-memory tier.
        cache.disk.store(&k, b"from disk").unwrap();
        assert!(cache.memory.lock().get(&k).is_none());
        assert_eq!(cache.load(k).await.unwrap(), Some(b"from disk".to_vec()));
        assert_eq!(cache.memory.lock().get(&k), Some(b"from disk".to_vec()));
    }

    #[test]
    fn memory_tier_evicts_oldest_past_capacity() {
        let mut tier = MemoryTier::new(2);
        let a = key("a");
        let b = key("b");
        let c = key("c");
        tier.insert(a, b"a".to_vec());
        tier.insert(b, b"b".to_vec());
        tier.insert(c, b"c".to_vec());
        assert!(tier.get(&a).is_none());
        assert_eq!(tier.get(&b), Some(b"b".to_vec()));
        assert_eq!(tier.get(&c), Some(b"c".to_vec()));
    }
}
