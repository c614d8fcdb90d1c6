// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parses the target-spec grammar: `path/to:name`, `path/to:`, `path/to::`, `path/to/file.ext`,
//! and a leading `-` for exclusion. Parsing a spec is in scope for the core (it's part of the
//! CLI surface); *resolving* a non-file spec against a target graph is not -- that requires a
//! BUILD-file backend this core never loads, since target-graph construction lives outside the
//! core.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSpec {
    /// `path/to:name` -- a single, explicitly named target.
    Single { path: String, name: String },
    /// `path/to:` -- every target directly declared in `path`.
    Siblings { path: String },
    /// `path/to::` -- every target in `path` and its subdirectories.
    Transitive { path: String },
    /// `path/to/file.ext` -- a file address.
    File { path: String },
}

impl TargetSpec {
    /// Whether this spec was written with a leading `-`, excluding it from the final set rather
    /// than contributing to it.
    pub fn parse(raw: &str) -> Result<(TargetSpec, bool), String> {
        let (body, excluded) = match raw.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        if body.is_empty() {
            return Err("empty target spec".to_string());
        }
        let spec = if let Some(colon_index) = body.find(':') {
            let (path, rest) = body.split_at(colon_index);
            let name = &rest[1..];
            if rest.ends_with("::") {
                TargetSpec::Transitive { path: path.to_string() }
            } else if name.is_empty() {
                TargetSpec::Siblings { path: path.to_string() }
            } else {
                TargetSpec::Single {
                    path: path.to_string(),
                    name: name.to_string(),
                }
            }
        } else {
            TargetSpec::File { path: body.to_string() }
        };
        Ok((spec, excluded))
    }

    /// The filesystem glob this spec implies, for the parts of the core (the `PathGlobs ->
    /// Snapshot` intrinsic) that only need a file-level view. `Single`/`Siblings`/`Transitive`
    /// specs name an *address*, not a path, so they have no glob of their own -- resolving one
    /// into file globs is exactly the target-graph step a backend supplies.
    pub fn as_file_glob(&self) -> Option<String> {
        match self {
            TargetSpec::File { path } => Some(path.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Single { path, name } => write!(f, "{path}:{name}"),
            TargetSpec::Siblings { path } => write!(f, "{path}:"),
            TargetSpec::Transitive { path } => write!(f, "{path}::"),
            TargetSpec::File { path } => write!(f, "{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_target() {
        let (spec, excluded) = TargetSpec::parse("src/python:lib").unwrap();
        assert_eq!(
            spec,
            TargetSpec::Single { path: "src/python".to_string(), name: "lib".to_string() }
        );
        assert!(!excluded);
    }

    #[test]
    fn parses_siblings_and_transitive() {
        assert_eq!(
            TargetSpec::parse("src/python:").unwrap().0,
            TargetSpec::Siblings { path: "src/python".to_string() }
        );
        assert_eq!(
            TargetSpec::parse("src/python::").unwrap().0,
            TargetSpec::Transitive { path: "src/python".to_string() }
        );
    }

    #[test]
    fn parses_file_address() {
        assert_eq!(
            TargetSpec::parse("src/python/lib.py").unwrap().0,
            TargetSpec::File { path: "src/python/lib.py".to_string() }
        );
    }

    #[test]
    fn leading_dash_excludes() {
        let (spec, excluded) = TargetSpec::parse("-src/python::").unwrap();
        assert_eq!(spec, TargetSpec::Transitive { path: "src/python".to_string() });
        assert!(excluded);
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(TargetSpec::parse("").is_err());
        assert!(TargetSpec::parse("-").is_err());
    }

    #[test]
    fn only_file_addresses_have_a_file_glob() {
        assert_eq!(
            TargetSpec::parse("a/b.py").unwrap().0.as_file_glob(),
            Some("a/b.py".to_string())
        );
        assert_eq!(TargetSpec::parse("a/b:c").unwrap().0.as_file_glob(), None);
    }
}
