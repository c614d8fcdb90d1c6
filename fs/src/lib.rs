// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The path and directory-tree data model shared by the content store, the file watcher
//! and snapshotter, and the process executor's sandbox materialiser. This crate owns no
//! storage of its own: it describes what a `Directory` *is* and how a workspace is walked into
//! one, while `store` is responsible for persisting and retrieving the bytes those digests name.

pub mod directory;
pub mod glob_matching;

pub use crate::directory::{Directory, DirectoryDigest, DirectoryEntry, EMPTY_DIRECTORY_DIGEST};
pub use crate::glob_matching::{
    GlobExpansionConjunction, GlobMatchErrorBehavior, PathGlobs, PreparedPathGlobs,
};

use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};

/// A workspace-relative, forward-slash-normalised path. Constructing one rejects absolute
/// paths, Windows path prefixes, and any `..` component that would escape the root it is
/// relative to -- the same invariant the `Directory` Merkle tree requires of its entry names.
#[derive(Clone, Debug, DeepSizeOf, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let candidate = path.as_ref();
        let mut relative_path = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Prefix(_) => {
                    return Err(format!("Windows paths are not allowed: {candidate:?}"));
                }
                Component::RootDir => {
                    return Err(format!("Absolute paths are not allowed: {candidate:?}"));
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !relative_path.pop() {
                        return Err(format!(
                            "Relative paths that escape their root are not allowed: {candidate:?}"
                        ));
                    }
                }
                Component::Normal(part) => relative_path.push(part),
            }
        }
        Ok(RelativePath(relative_path))
    }

    pub fn join(&self, other: &RelativePath) -> RelativePath {
        RelativePath(self.0.join(&other.0))
    }

    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }
}

impl Deref for RelativePath {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        self.0.as_path()
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<RelativePath> for PathBuf {
    fn from(p: RelativePath) -> Self {
        p.0
    }
}

/// A single file discovered while walking a workspace, prior to being hashed into the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStat {
    File {
        path: RelativePath,
        is_executable: bool,
    },
    Dir {
        path: RelativePath,
    },
}

impl PathStat {
    pub fn path(&self) -> &RelativePath {
        match self {
            PathStat::File { path, .. } => path,
            PathStat::Dir { path } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RelativePath;

    #[test]
    fn rejects_absolute_paths() {
        assert!(RelativePath::new("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_escaping_parent_components() {
        assert!(RelativePath::new("../outside").is_err());
        assert!(RelativePath::new("a/../../outside").is_err());
    }

    #[test]
    fn normalises_current_dir_components() {
        let p = RelativePath::new("./a/./b").unwrap();
        assert_eq!(p.to_str(), Some("a/b"));
    }

    #[test]
    fn resolves_internal_parent_components() {
        let p = RelativePath::new("a/b/../c").unwrap();
        assert_eq!(p.to_str(), Some("a/c"));
    }
}
