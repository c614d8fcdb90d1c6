// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `Directory` Merkle tree: a sorted, deduplicated list of
//! `(name, child digest, executable bit)` entries. A `Directory`'s `Digest` is a deterministic
//! function of its canonical encoding, so two trees with identical contents always produce the
//! same digest regardless of the order operations built them in.

use std::fmt;

use hashing::{Digest, EMPTY_DIGEST};
use serde::{Deserialize, Serialize};

/// A digest that names a `Directory` rather than a plain blob. Kept as a distinct type from
/// `hashing::Digest` so call sites can't accidentally pass a file digest where a tree digest is
/// expected -- the content store's `load_bytes` and `store_directory` operate on genuinely
/// different address spaces even though both happen to be SHA-256 digests underneath.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DirectoryDigest(pub Digest);

pub const EMPTY_DIRECTORY_DIGEST: DirectoryDigest = DirectoryDigest(EMPTY_DIGEST);

impl fmt::Display for DirectoryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One child of a `Directory`: either a file (with its content digest and executable bit) or a
/// nested directory (with its own tree digest).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryEntry {
    File {
        name: String,
        digest: Digest,
        is_executable: bool,
    },
    Directory {
        name: String,
        digest: DirectoryDigestBytes,
    },
}

/// `DirectoryDigest` does not itself implement `Serialize`/`Deserialize` (it deliberately isn't
/// interchangeable with a file `Digest` in Rust's type system), so the canonical encoding stores
/// the underlying bytes directly.
pub type DirectoryDigestBytes = Digest;

impl DirectoryEntry {
    pub fn name(&self) -> &str {
        match self {
            DirectoryEntry::File { name, .. } => name,
            DirectoryEntry::Directory { name, .. } => name,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory entry names must be unique, but {0:?} was repeated")]
    DuplicateName(String),
    #[error("directory entries must be sorted lexicographically by name; {0:?} was out of order")]
    Unsorted(String),
    #[error("directory entry names may not be empty, `.`, `..`, or contain a path separator: {0:?}")]
    InvalidName(String),
}

/// A single level of the Merkle tree. Constructing one validates the invariant that entry
/// names are unique, sorted, and may not be `.`, `..`, or contain a path separator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new(mut entries: Vec<DirectoryEntry>) -> Result<Directory, DirectoryError> {
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        for entry in &entries {
            let name = entry.name();
            if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
            {
                return Err(DirectoryError::InvalidName(name.to_owned()));
            }
        }
        for pair in entries.windows(2) {
            if pair[0].name() == pair[1].name() {
                return Err(DirectoryError::DuplicateName(pair[0].name().to_owned()));
            }
        }
        Ok(Directory { entries })
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The canonical byte encoding whose digest identifies this tree. Because `entries` is
    /// always kept sorted, two `Directory`s with the same logical contents serialise to the
    /// same bytes regardless of construction order.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.entries).expect("Directory entries are always serializable")
    }

    pub fn digest(&self) -> DirectoryDigest {
        DirectoryDigest(Digest::of_bytes(&self.to_canonical_bytes()))
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Directory, String> {
        let entries: Vec<DirectoryEntry> =
            bincode::deserialize(bytes).map_err(|e| format!("corrupt directory encoding: {e}"))?;
        Directory::new(entries).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> DirectoryEntry {
        DirectoryEntry::File {
            name: name.to_owned(),
            digest: Digest::of_bytes(name.as_bytes()),
            is_executable: false,
        }
    }

    #[test]
    fn digest_is_order_independent() {
        let a = Directory::new(vec![file("a"), file("b"), file("c")]).unwrap();
        let b = Directory::new(vec![file("c"), file("a"), file("b")]).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Directory::new(vec![file("a"), file("a")]).unwrap_err();
        assert_eq!(err, DirectoryError::DuplicateName("a".to_owned()));
    }

    #[test]
    fn rejects_dot_and_dotdot_and_separators() {
        assert!(matches!(
            Directory::new(vec![file(".")]),
            Err(DirectoryError::InvalidName(_))
        ));
        assert!(matches!(
            Directory::new(vec![file("..")]),
            Err(DirectoryError::InvalidName(_))
        ));
        assert!(matches!(
            Directory::new(vec![file("a/b")]),
            Err(DirectoryError::InvalidName(_))
        ));
    }

    #[test]
    fn distinct_contents_produce_distinct_digests() {
        let a = Directory::new(vec![file("a")]).unwrap();
        let b = Directory::new(vec![file("b")]).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn round_trips_through_canonical_bytes() {
        let original = Directory::new(vec![file("a"), file("b")]).unwrap();
        let bytes = original.to_canonical_bytes();
        let restored = Directory::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(original, restored);
    }
}
