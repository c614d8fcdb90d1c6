// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `PathGlobs` evaluation: a deterministic walk of a workspace root that
//! honours include/exclude patterns, an `ALL`/`ANY` conjunction, a missing-file policy, and an
//! explicit symlink-escape policy (follow within the root, error otherwise).

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::PathStat;
use crate::RelativePath;

/// Whether every include pattern must match at least one path (`All`), or whether it is enough
/// for any one of them to (`Any`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobExpansionConjunction {
    All,
    Any,
}

/// What to do when an include pattern (or, under `All`, a required glob) matches nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobMatchErrorBehavior {
    Error,
    Warn,
    Ignore,
}

/// The declarative description of a set of paths to capture. Two `PathGlobs` with the same
/// field values always evaluate to the same `Snapshot` digest for a given workspace state --
/// this is what makes captures memoisable by the graph engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathGlobs {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub conjunction: GlobExpansionConjunction,
    pub missing: GlobMatchErrorBehavior,
}

impl PathGlobs {
    pub fn new(include: Vec<String>) -> PathGlobs {
        PathGlobs {
            include,
            exclude: Vec::new(),
            conjunction: GlobExpansionConjunction::All,
            missing: GlobMatchErrorBehavior::Ignore,
        }
    }

    pub fn with_excludes(mut self, exclude: Vec<String>) -> PathGlobs {
        self.exclude = exclude;
        self
    }

    pub fn parse(self) -> Result<PreparedPathGlobs, String> {
        let mut include_builder = GlobSetBuilder::new();
        for pattern in &self.include {
            include_builder.add(compile(pattern)?);
        }
        let mut exclude_builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            exclude_builder.add(compile(pattern)?);
        }
        Ok(PreparedPathGlobs {
            raw: self,
            include: include_builder.build().map_err(|e| e.to_string())?,
            exclude: exclude_builder.build().map_err(|e| e.to_string())?,
        })
    }
}

fn compile(pattern: &str) -> Result<Glob, String> {
    Glob::new(pattern).map_err(|e| format!("invalid glob {pattern:?}: {e}"))
}

/// A `PathGlobs` that has been compiled into matchers ready to walk a concrete root.
pub struct PreparedPathGlobs {
    raw: PathGlobs,
    include: GlobSet,
    exclude: GlobSet,
}

#[derive(Debug, thiserror::Error)]
pub enum GlobMatchError {
    #[error("{0}")]
    Message(String),
    #[error("symlink at {path} escapes the build root at {root}")]
    SymlinkEscapesRoot { path: PathBuf, root: PathBuf },
    #[error("I/O error walking {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PreparedPathGlobs {
    /// Whether a single workspace-relative path would be captured by this `PathGlobs`, without
    /// walking a filesystem. Used by the invalidation watcher to decide whether a changed path
    /// could have affected a prior `Snapshot` capture's result, without re-walking the whole tree
    /// on every filesystem event.
    pub fn is_match(&self, relative: &Path) -> bool {
        self.include.is_match(relative) && !self.exclude.is_match(relative)
    }

    /// Walks `root`, following symlinks that resolve inside it and erroring on any that don't,
    /// and returns every path matched by `include` and not matched by `exclude`, in sorted
    /// order. Sorting (rather than directory-iteration order, which varies by filesystem) is
    /// what lets two captures of an unchanged workspace produce bit-identical `Snapshot`s.
    pub fn walk(&self, root: &Path) -> Result<Vec<PathStat>, GlobMatchError> {
        let mut matched = Vec::new();
        let mut include_hits = vec![false; self.raw.include.len()];
        self.walk_dir(root, root, &mut matched, &mut include_hits)?;
        matched.sort_by(|a, b| a.path().cmp(b.path()));

        self.enforce_missing_policy(&include_hits)?;
        Ok(matched)
    }

    fn enforce_missing_policy(&self, include_hits: &[bool]) -> Result<(), GlobMatchError> {
        let satisfied = match self.raw.conjunction {
            GlobExpansionConjunction::All => include_hits.iter().all(|hit| *hit),
            GlobExpansionConjunction::Any => {
                include_hits.is_empty() || include_hits.iter().any(|hit| *hit)
            }
        };
        if satisfied {
            return Ok(());
        }
        let missing: Vec<&String> = self
            .raw
            .include
            .iter()
            .zip(include_hits.iter())
            .filter(|(_, hit)| !**hit)
            .map(|(pattern, _)| pattern)
            .collect();
        match self.raw.missing {
            GlobMatchErrorBehavior::Ignore => Ok(()),
            GlobMatchErrorBehavior::Warn => {
                log::warn!("Some globs did not match any files: {missing:?}");
                Ok(())
            }
            GlobMatchErrorBehavior::Error => Err(GlobMatchError::Message(format!(
                "Globs did not match any files: {missing:?}"
            ))),
        }
    }

    fn walk_dir(
        &self,
        root: &Path,
        dir: &Path,
        matched: &mut Vec<PathStat>,
        include_hits: &mut [bool],
    ) -> Result<(), GlobMatchError> {
        let read_dir = fs::read_dir(dir).map_err(|source| GlobMatchError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in read_dir {
            let entry = entry.map_err(|source| GlobMatchError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let absolute = entry.path();
            self.check_no_escaping_symlink(root, &absolute)?;
            let relative = absolute
                .strip_prefix(root)
                .expect("walked entries are always under root")
                .to_path_buf();
            let file_type = entry.file_type().map_err(|source| GlobMatchError::Io {
                path: absolute.clone(),
                source,
            })?;
            let is_dir = if file_type.is_symlink() {
                fs::metadata(&absolute)
                    .map_err(|source| GlobMatchError::Io {
                        path: absolute.clone(),
                        source,
                    })?
                    .is_dir()
            } else {
                file_type.is_dir()
            };

            if is_dir {
                self.walk_dir(root, &absolute, matched, include_hits)?;
                continue;
            }

            if self.exclude.is_match(&relative) {
                continue;
            }
            let mut any_include_matched = false;
            for (idx, glob) in self.include.matches(&relative).into_iter().enumerate() {
                any_include_matched = true;
                include_hits[glob] = true;
                let _ = idx;
            }
            if !any_include_matched {
                continue;
            }

            let is_executable = entry
                .metadata()
                .map(|m| is_executable_mode(&m))
                .unwrap_or(false);
            let rel = RelativePath::new(&relative)
                .map_err(GlobMatchError::Message)?;
            matched.push(PathStat::File {
                path: rel,
                is_executable,
            });
        }
        Ok(())
    }

    fn check_no_escaping_symlink(&self, root: &Path, path: &Path) -> Result<(), GlobMatchError> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        if !metadata.file_type().is_symlink() {
            return Ok(());
        }
        let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        match fs::canonicalize(path) {
            Ok(resolved) if resolved.starts_with(&canonical_root) => Ok(()),
            _ => Err(GlobMatchError::SymlinkEscapesRoot {
                path: path.to_path_buf(),
                root: root.to_path_buf(),
            }),
        }
    }
}

#[cfg(unix)]
fn is_executable_mode(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable_mode(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self as stdfs, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        stdfs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap().write_all(b"x").unwrap();
    }

    #[test]
    fn matches_include_and_skips_excluded() {
        let root = tempdir().unwrap();
        touch(&root.path().join("a.py"));
        touch(&root.path().join("b.py"));
        touch(&root.path().join("c.txt"));

        let globs = PathGlobs::new(vec!["**/*.py".to_string()])
            .with_excludes(vec!["b.py".to_string()])
            .parse()
            .unwrap();
        let matched = globs.walk(root.path()).unwrap();
        let names: Vec<String> = matched
            .iter()
            .map(|p| p.path().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.py".to_string()]);
    }

    #[test]
    fn two_captures_of_unchanged_workspace_agree_on_order() {
        let root = tempdir().unwrap();
        touch(&root.path().join("z.py"));
        touch(&root.path().join("a.py"));
        let globs = PathGlobs::new(vec!["**/*.py".to_string()]).parse().unwrap();
        let first = globs.walk(root.path()).unwrap();
        let second = globs.walk(root.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|p| p.path().to_str().unwrap()).collect::<Vec<_>>(),
            vec!["a.py", "z.py"]
        );
    }

    #[test]
    fn missing_required_glob_errors_under_all_conjunction() {
        let root = tempdir().unwrap();
        touch(&root.path().join("a.py"));
        let mut globs = PathGlobs::new(vec!["**/*.rs".to_string()]);
        globs.missing = GlobMatchErrorBehavior::Error;
        let prepared = globs.parse().unwrap();
        assert!(prepared.walk(root.path()).is_err());
    }

    #[test]
    fn symlink_escaping_root_is_an_error() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        touch(&outside.path().join("secret.txt"));
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path().join("secret.txt"), root.path().join("link"))
                .unwrap();
            let globs = PathGlobs::new(vec!["**/*".to_string()]).parse().unwrap();
            assert!(globs.walk(root.path()).is_err());
        }
    }
}
