// Copyright 2020 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// A condition that can be triggered exactly once to release any tasks waiting on it.
///
/// Equivalent to Java's `CountDownLatch` with a count of one, or Python's `threading.Event`
/// without the ability to clear the condition once triggered. Used by the graph engine's
/// session shutdown path to wake every task still polling for cancellation.
#[derive(Clone)]
pub struct AsyncLatch {
    sender: Arc<Mutex<Option<watch::Sender<()>>>>,
    receiver: watch::Receiver<()>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(());
        AsyncLatch {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Marks this latch triggered, releasing all tasks waiting on it. Calls after the first
    /// are no-ops: the latch cannot be un-triggered.
    pub fn trigger(&self) {
        self.sender.lock().take();
    }

    /// Waits until another task triggers this latch. Returns immediately if already triggered.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        while receiver.changed().await.is_ok() {}
    }

    pub fn poll_triggered(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Default for AsyncLatch {
    fn default() -> Self {
        Self::new()
    }
}
