// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! Turns a `Process` description into a `ProcessResult`. This crate owns the data
//! model (`Process`/`ProcessResult`/the fingerprint that keys the process cache) and three
//! `CommandRunner` implementations that can be layered: [`local::CommandRunner`] (spawn on this
//! host), [`remote::CommandRunner`] (a fake in-memory remote executor), [`cached::CommandRunner`]
//! (wraps either, consulting `cache::ProcessCache` first), and [`bounded::CommandRunner`] (caps
//! concurrent sandboxes via `async_semaphore`).

pub mod bounded;
pub mod cached;
pub mod local;
pub mod named_caches;
pub mod remote;

pub use crate::named_caches::NamedCaches;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use fs::directory::DirectoryDigest;
use fs::RelativePath;
use hashing::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};
use workunit_store::{SpanId, WorkunitStore};

/// A named, persistent directory mounted into every sandbox that declares it, never wiped
/// between runs -- distinct from the process-result content cache, and from a process's own
/// hermetic inputs.
/// Used by tools with their own internal incremental state (e.g. a linter's daemon cache).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialOrd, PartialEq, Serialize, Deserialize)]
pub struct CacheName(String);

impl CacheName {
    pub fn new(name: impl Into<String>) -> Result<CacheName, String> {
        let name = name.into();
        if name
            .chars()
            .all(|c| (c.is_ascii_alphanumeric() && c.is_ascii_lowercase()) || c == '_')
            && !name.is_empty()
        {
            Ok(CacheName(name))
        } else {
            Err(format!(
                "cache names may only contain lowercase alphanumeric characters or underscores, got {name:?}"
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether a process's successful (or, for `Always`, any) result may be written to and served
/// from the process-result cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessCacheScope {
    /// Cache any result, including a non-zero exit.
    Always,
    /// Cache only a zero exit. The default.
    Successful,
    /// Never read or write the cache for this process.
    Never,
}

impl ProcessCacheScope {
    pub fn allows_caching(&self, exit_code: i32) -> bool {
        match self {
            ProcessCacheScope::Always => true,
            ProcessCacheScope::Successful => exit_code == 0,
            ProcessCacheScope::Never => false,
        }
    }
}

/// Which `CommandRunner` should ultimately run a process. Carried on the `Process` itself rather
/// than selected out-of-band, so that a node's fingerprint -- and therefore its cache key --
/// reflects which strategy produced a given result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessExecutionStrategy {
    Local,
    RemoteExecution,
}

/// A process to execute, hermetically: argv and env are exactly what's declared, and the sandbox
/// it runs in contains exactly `input_digest`, nothing from the surrounding host workspace.
///
/// Not itself `Serialize`: `DirectoryDigest` deliberately isn't interchangeable with a plain file
/// `Digest`, so only `fingerprint()`'s private view of the fingerprinted fields is serialised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Process {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<RelativePath>,
    pub input_digest: DirectoryDigest,
    pub output_file_paths: BTreeSet<RelativePath>,
    pub output_dir_paths: BTreeSet<RelativePath>,
    pub timeout: Option<Duration>,
    /// Not fingerprinted: a UI/debug label only ("Running pytest for //src/python:tests").
    pub description: String,
    /// Not fingerprinted: a debug-UI log-level hint.
    pub level: log::Level,
    pub append_only_caches: BTreeMap<CacheName, RelativePath>,
    /// JDK/interpreter search requirement: if present, a symlink is created at `.jdk` in the
    /// sandbox pointing at this directory.
    pub jdk_home: Option<PathBuf>,
    pub execution_strategy: ProcessExecutionStrategy,
    pub cache_scope: ProcessCacheScope,
}

impl Process {
    pub fn new(argv: Vec<String>) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            input_digest: fs::directory::EMPTY_DIRECTORY_DIGEST,
            output_file_paths: BTreeSet::new(),
            output_dir_paths: BTreeSet::new(),
            timeout: None,
            description: String::new(),
            level: log::Level::Info,
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_strategy: ProcessExecutionStrategy::Local,
            cache_scope: ProcessCacheScope::Successful,
        }
    }

    /// The cache key from testable property 7: a deterministic hash over every fingerprinted
    /// field. `description` and `level` are debug/UI hints and are deliberately excluded, so two
    /// processes that differ only in their description still share one cache entry.
    pub fn fingerprint(&self) -> Fingerprint {
        #[derive(Serialize)]
        struct FingerprintedFields<'a> {
            argv: &'a [String],
            env: &'a BTreeMap<String, String>,
            working_directory: &'a Option<RelativePath>,
            input_digest: Digest,
            output_file_paths: &'a BTreeSet<RelativePath>,
            output_dir_paths: &'a BTreeSet<RelativePath>,
            timeout: Option<Duration>,
            append_only_caches: &'a BTreeMap<CacheName, RelativePath>,
            jdk_home: &'a Option<PathBuf>,
            execution_strategy: &'a ProcessExecutionStrategy,
            cache_scope: &'a ProcessCacheScope,
        }
        let key = FingerprintedFields {
            argv: &self.argv,
            env: &self.env,
            working_directory: &self.working_directory,
            input_digest: self.input_digest.0,
            output_file_paths: &self.output_file_paths,
            output_dir_paths: &self.output_dir_paths,
            timeout: self.timeout,
            append_only_caches: &self.append_only_caches,
            jdk_home: &self.jdk_home,
            execution_strategy: &self.execution_strategy,
            cache_scope: &self.cache_scope,
        };
        let bytes = bincode::serialize(&key).expect("Process fingerprinted fields are always serializable");
        Digest::of_bytes(&bytes).hash
    }
}

/// Where a `ProcessResult` came from: whether it actually ran, or was served from one of the
/// process cache's tiers. Exposed so callers (workunit metadata, the `ui` crate) can show cache
/// hits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessResultSource {
    Ran,
    HitLocally,
    HitRemotely,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResultMetadata {
    pub source: ProcessResultSource,
    /// Wall-clock time spent actually running the process; `None` for a cache hit.
    pub total_elapsed: Option<Duration>,
}

impl ProcessResultMetadata {
    pub fn new(source: ProcessResultSource, total_elapsed: Option<Duration>) -> Self {
        ProcessResultMetadata { source, total_elapsed }
    }
}

/// The outcome of running (or serving from cache) a `Process`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    /// Addresses a `Directory` tree of the process's declared outputs.
    pub output_directory: Digest,
    pub metadata: ProcessResultMetadata,
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("process timed out after {0:?}")]
    Timeout(Duration),
    #[error("process execution was cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Cache(#[from] cache::CacheError),
    #[error("process I/O error: {0}")]
    Io(String),
}

/// Per-run context threaded through every `CommandRunner`: the session's workunit store (so a
/// process execution can nest a workunit under the rule that spawned it) and the executor its
/// async work should run on.
#[derive(Clone)]
pub struct Context {
    pub workunit_store: WorkunitStore,
    pub parent_span: Option<SpanId>,
    pub executor: task_executor::Executor,
}

impl Context {
    pub fn new(workunit_store: WorkunitStore, executor: task_executor::Executor) -> Context {
        Context {
            workunit_store,
            parent_span: None,
            executor,
        }
    }

    pub fn with_parent(mut self, parent: SpanId) -> Context {
        self.parent_span = Some(parent);
        self
    }
}

/// Whether a sandbox directory should be kept around after the process exits, for debugging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeepSandboxes {
    Always,
    Never,
    OnFailure,
}

/// A strategy for turning a `Process` into a `ProcessResult`. Implementations are composable:
/// `bounded::CommandRunner` and `cached::CommandRunner` both wrap an inner `Arc<dyn
/// CommandRunner>` to add concurrency limiting or caching without duplicating the strategy logic.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, context: Context, process: Process) -> Result<ProcessResult, ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn process() -> Process {
        let mut p = Process::new(vec!["echo".to_string(), "hi".to_string()]);
        p.description = "echo hi".to_string();
        p
    }

    #[test]
    fn fingerprint_ignores_description_and_level() {
        let mut a = process();
        let mut b = process();
        a.description = "first description".to_string();
        b.description = "an entirely different description".to_string();
        a.level = log::Level::Debug;
        b.level = log::Level::Error;
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_argv() {
        let a = process();
        let mut b = process();
        b.argv.push("-n".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_cache_scope() {
        let a = process();
        let mut b = process();
        b.cache_scope = ProcessCacheScope::Never;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn cache_scope_allows_caching_matches_exit_code_policy() {
        assert!(ProcessCacheScope::Always.allows_caching(1));
        assert!(ProcessCacheScope::Successful.allows_caching(0));
        assert!(!ProcessCacheScope::Successful.allows_caching(1));
        assert!(!ProcessCacheScope::Never.allows_caching(0));
    }

    #[test]
    fn cache_name_rejects_uppercase_and_separators() {
        assert!(CacheName::new("pip_cache").is_ok());
        assert!(CacheName::new("Pip-Cache").is_err());
        assert!(CacheName::new("").is_err());
    }

    #[test]
    fn fingerprint_is_stable_across_construction_order() {
        // BTreeMap iteration is already order-independent, but re-insertion order shouldn't matter.
        let mut a = process();
        a.env.insert("B".to_string(), "2".to_string());
        a.env.insert("A".to_string(), "1".to_string());
        let mut b = process();
        b.env.insert("A".to_string(), "1".to_string());
        b.env.insert("B".to_string(), "2".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
        let _ = Duration::from_secs(1);
    }
}
