// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An optional remote execution strategy. No real remote-execution service is reachable from
//! this workspace, so this is an in-memory fake that still exercises the fingerprint/digest
//! exchange contract end-to-end: it
//! runs the same sandboxing steps as `local::CommandRunner` (there is nowhere else to actually
//! execute a process), but reports `ProcessResultSource::HitRemotely`/`Ran` the way a real RE
//! client would distinguish an action-cache hit from an executed action, and is keyed by the
//! process's fingerprint in its own store rather than sharing `cache::ProcessCache`'s tiers.
//!
//! A real backend would replace this module's body with a gRPC client; the trait boundary
//! (`crate::CommandRunner`) is exactly what makes that swap possible without touching callers.

use std::collections::HashMap;
use std::sync::Arc;

use hashing::Fingerprint;
use parking_lot::Mutex;

use crate::{Context, Process, ProcessError, ProcessResult, ProcessResultMetadata, ProcessResultSource};

/// An in-memory stand-in for a remote execution service's action cache: actions it has already
/// "executed" (via the wrapped local runner, standing in for a remote worker) are served back
/// without rerunning them, exercising the same fingerprint-keyed lookup a real RE client performs
/// before submitting an action.
#[derive(Default)]
pub struct FakeActionCache {
    results: Mutex<HashMap<Fingerprint, ProcessResult>>,
}

impl FakeActionCache {
    pub fn new() -> Self {
        FakeActionCache::default()
    }
}

pub struct CommandRunner {
    executor: Arc<dyn crate::CommandRunner>,
    action_cache: Arc<FakeActionCache>,
}

impl CommandRunner {
    /// `executor` stands in for the pool of remote workers that would actually run the action;
    /// in this fake, it is the same local sandboxing strategy used for the `Local` execution
    /// strategy.
    pub fn new(executor: Arc<dyn crate::CommandRunner>, action_cache: Arc<FakeActionCache>) -> Self {
        CommandRunner { executor, action_cache }
    }
}

#[async_trait::async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(&self, context: Context, process: Process) -> Result<ProcessResult, ProcessError> {
        let key = process.fingerprint();

        if let Some(cached) = self.action_cache.results.lock().get(&key).cloned() {
            return Ok(ProcessResult {
                metadata: ProcessResultMetadata::new(ProcessResultSource::HitRemotely, None),
                ..cached
            });
        }

        let result = self.executor.run(context, process).await?;
        self.action_cache.results.lock().insert(key, result.clone());
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
                stdout_digest: Digest::of_bytes(b"remote out"),
                stderr_digest: Digest::of_bytes(b""),
                output_directory: Digest::of_bytes(b""),
                metadata: ProcessResultMetadata::new(ProcessResultSource::Ran, None),
            })
        }
    }

    fn process() -> Process {
        let mut p = Process::new(vec!["true".to_string()]);
        p.execution_strategy = ProcessExecutionStrategy::RemoteExecution;
        p.cache_scope = ProcessCacheScope::Successful;
        p
    }

    fn context() -> Context {
        Context::new(WorkunitStore::new(), task_executor::Executor::new())
    }

    #[tokio::test]
    async fn a_repeated_action_is_served_from_the_fake_remote_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingRunner { calls: calls.clone() });
        let runner = CommandRunner::new(executor, Arc::new(FakeActionCache::new()));

        let first = crate::CommandRunner::run(&runner, context(), process()).await.unwrap();
        let second = crate::CommandRunner::run(&runner, context(), process()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.stdout_digest, second.stdout_digest);
        assert_eq!(second.metadata.source, ProcessResultSource::HitRemotely);
    }
}
