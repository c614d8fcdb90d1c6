// Copyright 2018 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Bounds how many sandboxes may be materialised and spawned concurrently, independent of the
//! graph engine's own task concurrency.

use std::sync::Arc;

use async_semaphore::AsyncSemaphore;

use crate::{Context, Process, ProcessError, ProcessResult};

pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    sema: AsyncSemaphore,
}

impl CommandRunner {
    pub fn new(inner: Arc<dyn crate::CommandRunner>, bound: usize) -> Self {
        CommandRunner {
            inner,
            sema: AsyncSemaphore::new(bound),
        }
    }
}

#[async_trait::async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(&self, context: Context, process: Process) -> Result<ProcessResult, ProcessError> {
        let inner = self.inner.clone();
        self.sema.with_acquired(|| inner.run(context, process)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandRunner as _, ProcessResultMetadata, ProcessResultSource};
    use hashing::Digest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use workunit_store::WorkunitStore;

    struct TrackingRunner {
        concurrent: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::CommandRunner for TrackingRunner {
        async fn run(&self, _context: Context, _process: Process) -> Result<ProcessResult, ProcessError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(ProcessResult {
                exit_code: 0,
                stdout_digest: Digest::of_bytes(b""),
                stderr_digest: Digest::of_bytes(b""),
                output_directory: Digest::of_bytes(b""),
                metadata: ProcessResultMetadata::new(ProcessResultSource::Ran, None),
            })
        }
    }

    #[tokio::test]
    async fn bounds_concurrent_runs() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(TrackingRunner {
            concurrent: concurrent.clone(),
            max_seen: max_seen.clone(),
        });
        let runner = Arc::new(CommandRunner::new(inner, 2));

        let context = || Context::new(WorkunitStore::new(), task_executor::Executor::new());
        let mut handles = Vec::new();
        for _ in 0..6 {
            let runner = runner.clone();
            let process = crate::Process::new(vec!["true".to_string()]);
            handles.push(tokio::spawn({
                let context = context();
                async move { crate::CommandRunner::run(&*runner, context, process).await }
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
