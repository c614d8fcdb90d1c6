// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Turns a workspace walk (`fs::PreparedPathGlobs::walk`) into a `Snapshot`: every matched
//! file's bytes are hashed into the store, and the resulting tree of `Directory`s is built
//! bottom-up and stored, producing one digest that names the whole captured subset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use fs::directory::{Directory, DirectoryDigest, DirectoryEntry};
use fs::{PathStat, PreparedPathGlobs, RelativePath};
use hashing::Digest;

use crate::{Store, StoreResult};

/// The output of capturing a `PathGlobs` against a concrete workspace: a digest identifying the
/// matched subset, plus the ordered list of paths that went into it. Two `capture_snapshot`
/// calls against an unchanged workspace with the same globs always produce equal `Snapshot`s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub digest: DirectoryDigest,
    pub paths: Vec<RelativePath>,
}

/// Captures `globs` against `root`, storing every matched file's content and the resulting
/// directory tree, and returns the combined `Snapshot`. This is the `PathGlobs -> Snapshot`
/// intrinsic's entry point; the file watcher calls this once per distinct `PathGlobs` it's asked
/// to capture.
pub fn capture_snapshot(store: &Store, root: &Path, globs: &PreparedPathGlobs) -> StoreResult<Snapshot> {
    let matched = globs.walk(root).map_err(|e| crate::StoreError::Corruption(e.to_string()))?;

    let mut tree = TreeBuilder::default();
    let mut paths = Vec::with_capacity(matched.len());
    for path_stat in &matched {
        match path_stat {
            PathStat::File { path, is_executable } => {
                let absolute: PathBuf = root.join(path.as_ref());
                let bytes = fs::read(&absolute)?;
                let digest = store.store_bytes(&bytes)?;
                tree.insert_file(path, digest, *is_executable);
                paths.push(path.clone());
            }
            PathStat::Dir { .. } => {}
        }
    }
    paths.sort();

    let digest = tree.store(store)?;
    Ok(Snapshot { digest, paths })
}

/// Accumulates file entries keyed by their path and folds them into nested `Directory`s from
/// the leaves up, so a snapshot with files in several subdirectories produces one tree whose
/// digest is deterministic regardless of the order files were inserted.
#[derive(Default)]
struct TreeBuilder {
    files: BTreeMap<Vec<String>, (Digest, bool)>,
}

impl TreeBuilder {
    fn insert_file(&mut self, path: &RelativePath, digest: Digest, is_executable: bool) {
        let components: Vec<String> = path
            .as_ref()
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        self.files.insert(components, (digest, is_executable));
    }

    fn store(&self, store: &Store) -> StoreResult<DirectoryDigest> {
        Self::store_level(store, &self.files, &[])
    }

    fn store_level(
        store: &Store,
        files: &BTreeMap<Vec<String>, (Digest, bool)>,
        prefix: &[String],
    ) -> StoreResult<DirectoryDigest> {
        let mut children_by_name: BTreeMap<String, BTreeMap<Vec<String>, (Digest, bool)>> =
            BTreeMap::new();
        let mut entries = Vec::new();

        for (components, (digest, is_executable)) in files {
            if components.len() < prefix.len() || &components[..prefix.len()] != prefix {
                continue;
            }
            let rest = &components[prefix.len()..];
            match rest.len() {
                0 => continue,
                1 => entries.push(DirectoryEntry::File {
                    name: rest[0].clone(),
                    digest: *digest,
                    is_executable: *is_executable,
                }),
                _ => {
                    children_by_name
                        .entry(rest[0].clone())
                        .or_default()
                        .insert(components.clone(), (*digest, *is_executable));
                }
            }
        }

        for (name, child_files) in children_by_name {
            let mut child_prefix = prefix.to_vec();
            child_prefix.push(name.clone());
            let child_digest = Self::store_level(store, &child_files, &child_prefix)?;
            entries.push(DirectoryEntry::Directory {
                name,
                digest: child_digest.0,
            });
        }

        let directory = Directory::new(entries).map_err(|e| crate::StoreError::Corruption(e.to_string()))?;
        store.store_directory(&directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::{GlobExpansionConjunction, GlobMatchErrorBehavior, PathGlobs};
    use std::fs::{create_dir_all, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap().write_all(content).unwrap();
    }

    fn globs(patterns: &[&str]) -> PreparedPathGlobs {
        PathGlobs {
            include: patterns.iter().map(|s| s.to_string()).collect(),
            exclude: Vec::new(),
            conjunction: GlobExpansionConjunction::All,
            missing: GlobMatchErrorBehavior::Ignore,
        }
        .parse()
        .unwrap()
    }

    #[test]
    fn capture_builds_a_nested_tree_deterministically() {
        let workspace = tempdir().unwrap();
        write(workspace.path(), "pkg/a.py", b"a = 1");
        write(workspace.path(), "pkg/sub/b.py", b"b = 2");

        let store_dir = tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let prepared = globs(&["**/*.py"]);

        let first = capture_snapshot(&store, workspace.path(), &prepared).unwrap();
        let second = capture_snapshot(&store, workspace.path(), &prepared).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.paths.len(), 2);

        let top = store.load_directory(first.digest).unwrap().unwrap();
        assert_eq!(top.entries().len(), 1);
    }

    #[test]
    fn capture_is_order_independent_in_resulting_digest() {
        let workspace_a = tempdir().unwrap();
        write(workspace_a.path(), "one.py", b"x");
        write(workspace_a.path(), "two.py", b"y");

        let workspace_b = tempdir().unwrap();
        write(workspace_b.path(), "two.py", b"y");
        write(workspace_b.path(), "one.py", b"x");

        let store_dir = tempdir().unwrap();
        let store = Store::local_only(store_dir.path()).unwrap();
        let prepared = globs(&["**/*.py"]);

        let a = capture_snapshot(&store, workspace_a.path(), &prepared).unwrap();
        let b = capture_snapshot(&store, workspace_b.path(), &prepared).unwrap();
        assert_eq!(a.digest, b.digest);
    }
}
