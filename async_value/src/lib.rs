// Copyright 2020 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

use std::sync::{Arc, Weak};

use tokio::sync::{oneshot, watch};

/// A cancellable value computed by one sender and broadcast to multiple receivers.
///
/// The graph engine hands every concurrent requester of a `Running` node one of
/// these receivers, so a single in-flight computation satisfies all of them (single-flight).
/// Work can be cancelled two ways:
///   1. explicitly, by calling [`AsyncValue::try_abort`]
///   2. implicitly, if every [`AsyncValueReceiver`] is dropped (no one is waiting anymore)
///
/// This is a `tokio::sync::watch` (which gives us case 2 for free, since a `Weak` receiver
/// handle upgrades to `None` once the last `Arc` drops) plus a `tokio::sync::oneshot` used only
/// to carry an explicit abort signal.
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static> {
    item_receiver: Weak<watch::Receiver<Option<T>>>,
    abort_sender: Option<oneshot::Sender<T>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValue<T> {
    pub fn new() -> (AsyncValue<T>, AsyncValueSender<T>, AsyncValueReceiver<T>) {
        let (abort_sender, abort_receiver) = oneshot::channel();
        let (item_sender, item_receiver) = watch::channel(None);
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                item_receiver: Arc::downgrade(&item_receiver),
                abort_sender: Some(abort_sender),
            },
            AsyncValueSender {
                item_sender,
                abort_receiver,
            },
            AsyncValueReceiver { item_receiver },
        )
    }

    /// Returns another receiver for this value, unless all receivers have already gone away (in
    /// which case the associated work should be considered cancelled).
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }

    /// Requests cancellation, delivering `t` to the sender's `aborted()` future. A no-op if the
    /// value has already been sent.
    pub fn try_abort(&mut self, t: T) -> Result<(), T> {
        match self.abort_sender.take() {
            Some(abort_sender) => abort_sender.send(t),
            None => Ok(()),
        }
    }
}

pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    /// Waits for the value, or returns `None` if the work was cancelled before producing one.
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(value) = item_receiver.borrow().as_ref() {
                return Some(value.clone());
            }
            if item_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static> {
    item_sender: watch::Sender<Option<T>>,
    abort_receiver: oneshot::Receiver<T>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueSender<T> {
    pub fn send(self, item: T) {
        let _ = self.item_sender.send(Some(item));
    }

    /// Resolves with `Some(t)` if the value was explicitly aborted, or `None` if every receiver
    /// went away first.
    pub async fn aborted(&mut self) -> Option<T> {
        tokio::select! {
            res = &mut self.abort_receiver => res.ok(),
            () = self.item_sender.closed() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncValue;

    #[tokio::test]
    async fn send_then_recv() {
        let (_value, sender, receiver) = AsyncValue::<u32>::new();
        sender.send(42);
        assert_eq!(receiver.recv().await, Some(42));
    }

    #[tokio::test]
    async fn dropping_value_cancels_work() {
        let (value, mut sender, receiver) = AsyncValue::<u32>::new();
        drop(value);
        assert_eq!(sender.aborted().await, None);
        drop(sender);
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn explicit_abort_is_delivered() {
        let (mut value, mut sender, _receiver) = AsyncValue::<u32>::new();
        value.try_abort(7).unwrap();
        assert_eq!(sender.aborted().await, Some(7));
    }

    #[tokio::test]
    async fn multiple_receivers_all_see_the_same_value() {
        let (value, sender, receiver1) = AsyncValue::<u32>::new();
        let receiver2 = value.receiver().expect("receiver1 is still alive");
        sender.send(99);
        assert_eq!(receiver1.recv().await, Some(99));
        assert_eq!(receiver2.recv().await, Some(99));
    }
}
