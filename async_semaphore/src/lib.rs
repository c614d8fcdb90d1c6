// Copyright 2018 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// A counting semaphore that gates how many futures may run a body concurrently.
///
/// Used by the process executor to bound the number of live sandboxes to the
/// configured parallelism, independent of the graph engine's own task concurrency.
#[derive(Clone)]
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
    total_permits: Arc<AtomicUsize>,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> AsyncSemaphore {
        AsyncSemaphore {
            inner: Arc::new(Semaphore::new(permits)),
            total_permits: Arc::new(AtomicUsize::new(permits)),
        }
    }

    /// Runs `f` (and the future it returns) only once a permit is available, and returns the
    /// permit automatically when the future completes or is dropped.
    pub async fn with_acquired<F, B, T>(&self, f: F) -> T
    where
        F: FnOnce() -> B,
        B: std::future::Future<Output = T>,
    {
        let _permit = self
            .inner
            .acquire()
            .await
            .expect("semaphore is never closed for the lifetime of a session");
        f().await
    }

    /// Acquires a single permit without running a body, for callers that need to hold it across
    /// several awaits (e.g. "reserve a sandbox slot, then materialise, then spawn").
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.inner
            .acquire()
            .await
            .expect("semaphore is never closed for the lifetime of a session")
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn total_permits(&self) -> usize {
        self.total_permits.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncSemaphore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release() {
        let sema = AsyncSemaphore::new(1);
        sema.with_acquired(|| async { 42 }).await;
        assert_eq!(sema.available_permits(), 1);
    }

    #[tokio::test]
    async fn at_most_n_concurrent_acquisitions() {
        let sema = AsyncSemaphore::new(1);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let sema = sema.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                sema.with_acquired(|| async {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn total_permits_is_fixed_at_construction() {
        let sema = AsyncSemaphore::new(4);
        assert_eq!(sema.total_permits(), 4);
    }
}
