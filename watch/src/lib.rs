// Copyright 2019 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The live half of the file watcher & snapshotter. [`fs::glob_matching`] and [`store::snapshot`]
//! already know how to turn a `PathGlobs` into a `Snapshot` once; this crate adds the standing
//! filesystem watch that tells the graph engine when a prior capture might now be stale, plus the
//! fixed+user ignore-pattern set.

mod ignore_patterns;

pub use crate::ignore_patterns::IgnorePatterns;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

/// A batch of changed paths, fenced by a monotonically increasing generation number. The graph
/// engine's `drain_and_invalidate` uses the generation to decide whether a session that started
/// at generation `g` has already seen every event up to `g`, bounding cross-session staleness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub generation: u64,
    pub paths: HashSet<PathBuf>,
}

/// Spawns a background thread that batches filesystem change notifications (at-least-once,
/// deduplicated) and publishes them as [`InvalidationEvent`]s.
///
/// A single-writer, multi-reader component: exactly one thread touches the underlying
/// `notify::Watcher` and the generation counter; any number of consumers may subscribe via
/// [`InvalidationWatcher::subscribe`].
pub struct InvalidationWatcher {
    watcher: Mutex<RecommendedWatcher>,
    generation: Arc<AtomicU64>,
    subscribers: Arc<Mutex<Vec<Sender<InvalidationEvent>>>>,
    liveness: Receiver<()>,
    ignore: IgnorePatterns,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to start watching the filesystem: {0}")]
    Start(String),
    #[error("failed to watch {path}: {source}")]
    Watch { path: PathBuf, source: notify::Error },
}

impl InvalidationWatcher {
    pub fn new(ignore: IgnorePatterns) -> Result<Arc<InvalidationWatcher>, WatchError> {
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();
        let watcher = RecommendedWatcher::new(
            move |res| {
                // `notify::Error` on the send side only happens if the receiver is gone, in
                // which case the watch thread below is already shutting down.
                let _ = event_sender.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| WatchError::Start(e.to_string()))?;

        let (liveness_sender, liveness_receiver) = crossbeam_channel::unbounded();
        let generation = Arc::new(AtomicU64::new(0));
        let subscribers: Arc<Mutex<Vec<Sender<InvalidationEvent>>>> = Arc::new(Mutex::new(Vec::new()));

        let this = Arc::new(InvalidationWatcher {
            watcher: Mutex::new(watcher),
            generation: generation.clone(),
            subscribers: subscribers.clone(),
            liveness: liveness_receiver,
            ignore,
        });

        let thread_generation = generation;
        let thread_subscribers = subscribers;
        thread::spawn(move || {
            Self::run(event_receiver, thread_generation, thread_subscribers);
            let _ = liveness_sender.send(());
            log::warn!("file watcher thread exiting");
        });

        Ok(this)
    }

    fn run(
        event_receiver: Receiver<notify::Result<Event>>,
        generation: Arc<AtomicU64>,
        subscribers: Arc<Mutex<Vec<Sender<InvalidationEvent>>>>,
    ) {
        loop {
            match event_receiver.recv_timeout(Duration::from_millis(50)) {
                Ok(Ok(event)) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        continue;
                    }
                    let paths: HashSet<PathBuf> = event.paths.into_iter().collect();
                    if paths.is_empty() {
                        continue;
                    }
                    let generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let invalidation = InvalidationEvent { generation, paths };
                    let mut subs = subscribers.lock();
                    subs.retain(|sender| sender.send(invalidation.clone()).is_ok());
                }
                Ok(Err(err)) => {
                    log::warn!("file watcher error: {err}");
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Watches `path` recursively, skipping subtrees the ignore patterns exclude up front so a
    /// large vendored directory never generates events the engine would just filter out anyway.
    pub fn watch(&self, path: &Path) -> Result<(), WatchError> {
        if self.ignore.is_ignored(path) {
            return Ok(());
        }
        self.watcher
            .lock()
            .watch(path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Registers a new subscriber; the returned receiver observes every invalidation batch from
    /// this point on (at-least-once; consumers must be idempotent).
    pub fn subscribe(&self) -> Receiver<InvalidationEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// False once the watch thread has exited (e.g. the underlying OS watch facility failed);
    /// callers should treat this as "no further invalidation will ever arrive" and fall back to
    /// re-capturing on every request.
    pub fn running(&self) -> bool {
        matches!(self.liveness.try_recv(), Err(crossbeam_channel::TryRecvError::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::tempdir;

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn file_creation_produces_an_invalidation_event() {
        let root = tempdir().unwrap();
        let watcher = InvalidationWatcher::new(IgnorePatterns::default()).unwrap();
        watcher.watch(root.path()).unwrap();
        let receiver = watcher.subscribe();

        fs::write(root.path().join("new_file.py"), b"x = 1").unwrap();

        let event = receiver.recv_timeout(Duration::from_secs(5));
        assert!(event.is_ok(), "expected an invalidation event after file creation");
    }

    #[test]
    fn generation_is_monotonically_increasing() {
        let root = tempdir().unwrap();
        let watcher = InvalidationWatcher::new(IgnorePatterns::default()).unwrap();
        watcher.watch(root.path()).unwrap();
        let receiver = watcher.subscribe();

        fs::write(root.path().join("a.py"), b"1").unwrap();
        fs::write(root.path().join("b.py"), b"2").unwrap();

        let mut last = 0;
        let saw_increase = wait_for(
            || {
                while let Ok(event) = receiver.try_recv() {
                    assert!(event.generation > last);
                    last = event.generation;
                }
                last >= 1
            },
            Duration::from_secs(5),
        );
        assert!(saw_increase);
    }

    #[test]
    fn ignored_paths_are_never_watched() {
        let root = tempdir().unwrap();
        let ignored = root.path().join(".git");
        fs::create_dir(&ignored).unwrap();
        let watcher = InvalidationWatcher::new(IgnorePatterns::default()).unwrap();
        // Watching an ignored directory is a no-op, not an error.
        assert!(watcher.watch(&ignored).is_ok());
    }
}
