// Copyright 2018 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Process-result caching: wraps an inner `CommandRunner`,
//! consulting `cache::ProcessCache` by fingerprint before running, and writing the result back
//! afterwards unless the process's `cache_scope` forbids it.

use std::sync::Arc;

use cache::ProcessCache;

use crate::{Context, Process, ProcessError, ProcessResult, ProcessResultMetadata, ProcessResultSource};

pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    cache: ProcessCache,
}

impl CommandRunner {
    pub fn new(inner: Arc<dyn crate::CommandRunner>, cache: ProcessCache) -> Self {
        CommandRunner { inner, cache }
    }
}

#[async_trait::async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(&self, context: Context, process: Process) -> Result<ProcessResult, ProcessError> {
        let key = process.fingerprint();

        if process.cache_scope != crate::ProcessCacheScope::Never {
            if let Some(bytes) = self.cache.load(key).await? {
                let cached: ProcessResult = bincode::deserialize(&bytes)
                    .map_err(|e| ProcessError::Io(format!("corrupt cache entry for {key}: {e}")))?;
                return Ok(ProcessResult {
                    metadata: ProcessResultMetadata::new(ProcessResultSource::HitLocally, None),
                    ..cached
                });
            }
        }

        let result = self.inner.run(context, process.clone()).await?;

        if process.cache_scope.allows_caching(result.exit_code) {
            let bytes = bincode::serialize(&result)
                .expect("ProcessResult is always serializable");
            self.cache.store(key, bytes).await?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandRunner as _, ProcessCacheScope, ProcessExecutionStrategy};
    use hashing::Digest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use workunit_store::WorkunitStore;

    struct CountingRunner {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::CommandRunner for CountingRunner {
        async fn run(&self, _context: Context, _process: Process) -> Result<ProcessResult, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessResult {
                exit_code: 0,
                stdout_digest: Digest::of_bytes(b"out"),
                stderr_digest: Digest::of_bytes(b""),
                output_directory: Digest::of_bytes(b"tree"),
                metadata: ProcessResultMetadata::new(ProcessResultSource::Ran, None),
            })
        }
    }

    fn context() -> Context {
        Context::new(WorkunitStore::new(), task_executor::Executor::new())
    }

    fn process() -> Process {
        let mut p = Process::new(vec!["true".to_string()]);
        p.execution_strategy = ProcessExecutionStrategy::Local;
        p.cache_scope = ProcessCacheScope::Successful;
        p
    }

    #[tokio::test]
    async fn a_second_identical_request_is_served_from_cache_without_a_second_spawn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(CountingRunner { calls: calls.clone() });
        let dir = tempfile::tempdir().unwrap();
        let cache = ProcessCache::new(dir.path(), 8).unwrap();
        let runner = CommandRunner::new(inner, cache);

        let first = crate::CommandRunner::run(&runner, context(), process()).await.unwrap();
        let second = crate::CommandRunner::run(&runner, context(), process()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.stdout_digest, second.stdout_digest);
        assert_eq!(second.metadata.source, ProcessResultSource::HitLocally);
    }

    #[tokio::test]
    async fn never_cache_scope_always_spawns() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(CountingRunner { calls: calls.clone() });
        let dir = tempfile::tempdir().unwrap();
        let cache = ProcessCache::new(dir.path(), 8).unwrap();
        let runner = CommandRunner::new(inner, cache);

        let mut never = process();
        never.cache_scope = ProcessCacheScope::Never;

        crate::CommandRunner::run(&runner, context(), never.clone()).await.unwrap();
        crate::CommandRunner::run(&runner, context(), never).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
