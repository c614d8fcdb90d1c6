// Copyright 2019 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The cooperative task runtime that the scheduler drives the graph engine on.
//! This crate knows nothing about the graph itself -- it is a thin, cloneable handle to a tokio
//! runtime plus the bookkeeping a session needs around it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};

/// Executors come in two flavors:
/// * "borrowed" -- created with [`Executor::new`] or [`Executor::to_borrowed`]; does not own a
///   `Runtime` and shutdown has no effect. Used in unit tests where the runtime is created by
///   tokio's macros, and anywhere multiple sessions share one runtime.
/// * "owned" -- created with [`Executor::new_owned`]; when all clones are dropped, or
///   [`Executor::shutdown`] is called, the owned `Runtime` is torn down.
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Wraps the ambient tokio runtime (generally provided by `#[tokio::main]`/`#[tokio::test]`).
    /// The returned `Executor` has a lifecycle independent of that runtime.
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    /// Builds and owns a fresh multi-thread runtime with the given worker/blocking thread counts.
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all()
            .build()
            .map_err(|e| format!("failed to start the task runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    /// A clone disconnected from this `Executor`'s shutdown lifecycle.
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    /// Spawns `future` as a new task and returns a `Future` resolving to its output, recovering a
    /// panic via `rescue_join_error` rather than propagating the `JoinError`.
    pub fn spawn<O, F>(&self, future: F, rescue_join_error: impl FnOnce(JoinError) -> O) -> impl Future<Output = O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.handle.spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    /// Spawns `future` as a new task, returning the raw `JoinHandle`.
    pub fn native_spawn<O, F>(&self, future: F) -> JoinHandle<O>
    where
        O: Send + 'static,
        F: Future<Output = O> + Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Blocks the calling thread on `future`. Must only be called from something resembling a
    /// main method, never from within another future running on this runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Spawns a blocking closure on the runtime's blocking thread pool.
    pub fn spawn_blocking<F, R>(&self, f: F, rescue_join_error: impl FnOnce(JoinError) -> R) -> impl Future<Output = R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Shuts down an owned runtime, leaking any tasks that do not complete within `timeout`.
    /// A no-op for borrowed executors.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("executor shutdown took unexpectedly long: tasks were likely leaked");
        }
    }

    /// Always `true` for borrowed executors; `true` for owned ones once `shutdown` has run.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

/// "Tail" tasks are async work that may continue alongside the session's main request (e.g.
/// flushing a remote cache write-back) but must complete -- or time out -- before the session
/// itself is considered finished.
#[derive(Clone)]
pub struct TailTasks {
    inner: Arc<Mutex<Option<TailTasksInner>>>,
}

struct TailTasksInner {
    id_to_name: HashMap<Id, String>,
    task_set: JoinSet<()>,
}

impl Default for TailTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl TailTasks {
    pub fn new() -> Self {
        TailTasks {
            inner: Arc::new(Mutex::new(Some(TailTasksInner {
                id_to_name: HashMap::new(),
                task_set: JoinSet::new(),
            }))),
        }
    }

    /// Spawns a named tail task on `handle`. A no-op (with a warning) if `wait` has already run.
    pub fn spawn_on<F>(&self, name: &str, handle: &Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.inner.lock();
        let Some(inner) = guard.as_mut() else {
            log::warn!("tail task `{name}` submitted after the session already completed");
            return;
        };
        let h = inner.task_set.spawn_on(task, handle);
        inner.id_to_name.insert(h.id(), name.to_string());
    }

    /// Waits for every tail task to finish, up to `timeout`; any still running afterwards are
    /// logged and aborted.
    pub async fn wait(self, timeout: Duration) {
        let mut inner = match self.inner.lock().take() {
            Some(inner) => inner,
            None => {
                log::debug!("tail tasks awaited more than once");
                return;
            }
        };

        if inner.task_set.is_empty() {
            return;
        }

        log::debug!("waiting for {} tail task(s) to complete", inner.task_set.len());
        let mut timeout = tokio::time::sleep(timeout).boxed();

        loop {
            tokio::select! {
                biased;
                _ = &mut timeout => break,
                next = inner.task_set.join_next_with_id() => {
                    match next {
                        Some(Ok((id, _))) => {
                            inner.id_to_name.remove(&id);
                        }
                        Some(Err(err)) => {
                            let name = inner.id_to_name.get(&err.id());
                            log::error!("tail task `{name:?}` failed: {err}");
                        }
                        None => break,
                    }
                }
            }
        }

        if !inner.task_set.is_empty() {
            log::debug!(
                "{} tail task(s) did not complete within the timeout: {}",
                inner.task_set.len(),
                inner.id_to_name.values().join(", "),
            );
            inner.task_set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Executor, TailTasks};

    #[tokio::test]
    async fn spawn_runs_the_future() {
        let executor = Executor::new();
        let result = executor.spawn(async { 1 + 1 }, |_| 0).await;
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn tail_tasks_wait_for_completion() {
        let tasks = TailTasks::new();
        let handle = tokio::runtime::Handle::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tasks.spawn_on("marks-done", &handle, async move {
            let _ = tx.send(());
        });
        tasks.wait(Duration::from_secs(5)).await;
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn tail_tasks_time_out_hung_work() {
        let tasks = TailTasks::new();
        let handle = tokio::runtime::Handle::current();
        tasks.spawn_on("never-finishes", &handle, futures::future::pending());
        // Should return promptly rather than hanging forever.
        tasks.wait(Duration::from_millis(50)).await;
    }
}
