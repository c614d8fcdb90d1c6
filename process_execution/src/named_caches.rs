// Copyright 2022 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Append-only named caches. A named cache is a host directory that the sandbox materialiser
//! symlinks into every sandbox that declares it, and that is never cleared between runs --
//! distinct from `cache::ProcessCache`, which is keyed by process fingerprint and freely
//! evictable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs::RelativePath;

use crate::CacheName;

/// Owns the directory tree under which every named cache lives, one subdirectory per cache name.
#[derive(Clone)]
pub struct NamedCaches {
    local_base: PathBuf,
}

impl NamedCaches {
    pub fn new(local_base: PathBuf) -> std::io::Result<NamedCaches> {
        std::fs::create_dir_all(&local_base)?;
        Ok(NamedCaches { local_base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.local_base
    }

    /// The host-side directory a named cache lives in, creating it if this is the first process
    /// to reference it.
    pub fn host_path(&self, name: &CacheName) -> std::io::Result<PathBuf> {
        let path = self.local_base.join(name.as_str());
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Pairs of (sandbox-relative destination, host path to symlink it to) for every named cache
    /// a `Process` declared, for the sandbox materialiser to wire up before spawning.
    pub fn symlinks_for(
        &self,
        caches: &BTreeMap<CacheName, RelativePath>,
    ) -> std::io::Result<Vec<(RelativePath, PathBuf)>> {
        caches
            .iter()
            .map(|(name, dest)| Ok((dest.clone(), self.host_path(name)?)))
            .collect()
    }
}
