// Copyright 2019 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The fixed set plus user-configured ignore patterns. These gate both what the watcher
//! subscribes to and, via [`IgnorePatterns::is_ignored`], what a glob walk should never descend
//! into regardless of what the caller's `PathGlobs` asked for.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Directories no build should ever need to watch or capture: version control metadata, editor
/// swap directories, and the engine's own on-disk state.
const DEFAULT_IGNORES: &[&str] = &[".git", ".hg", ".svn", "__pycache__", "*.pyc", ".build-cache"];

#[derive(Clone)]
pub struct IgnorePatterns {
    matcher: Gitignore,
}

impl IgnorePatterns {
    pub fn new(user_patterns: &[String]) -> IgnorePatterns {
        let mut builder = GitignoreBuilder::new("/");
        for pattern in DEFAULT_IGNORES {
            builder.add_line(None, pattern).expect("default ignore patterns are always valid");
        }
        for pattern in user_patterns {
            let _ = builder.add_line(None, pattern);
        }
        IgnorePatterns {
            matcher: builder.build().expect("gitignore builder never fails on valid lines"),
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.matcher.matched(path, path.is_dir()).is_ignore()
    }
}

impl Default for IgnorePatterns {
    fn default() -> Self {
        IgnorePatterns::new(&[])
    }
}
