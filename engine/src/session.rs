// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Per-invocation state layered over the long-lived `Core`. A `Session` is cheap to clone (every
//! field is itself an `Arc` or a handle), since every in-flight `ExecutionContext` carries one.
//! It owns the things that must not leak across invocations -- cancellation, the generation a run
//! started at, and the leases that keep this run's digests alive in the store while it's still
//! using them -- while `Core` owns everything that should survive to the next one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use hashing::Digest;
use parking_lot::Mutex;

use crate::core::Core;

/// How long a session's digests stay leased in the local store after the session completes, so
/// a quickly-repeated invocation doesn't pay to re-populate content the prior run just produced.
const SESSION_LEASE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Per-invocation state. Cloning shares the same cancellation latch, lease set, and generation
/// marker across every task the session spawns.
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
    cancelled: AsyncLatch,
    /// The invalidation generation this session began observing at; used to decide whether an
    /// invalidation event that arrived mid-run should be treated as "already accounted for" by
    /// a node this session itself just completed.
    started_at_generation: u64,
    preserved_permanently: bool,
    leased_digests: Arc<Mutex<HashSet<Digest>>>,
    run_id_counter: Arc<AtomicU64>,
}

impl Session {
    /// Begins a session against `core`, recording the invalidation generation as of this moment
    /// so a later `should_invalidate` check can tell a filesystem event that raced the session's
    /// own start from one that happened after.
    pub fn new(core: Arc<Core>) -> Session {
        let started_at_generation = core
            .watcher
            .as_ref()
            .map_or(0, |w| w.current_generation());
        Session {
            core,
            cancelled: AsyncLatch::new(),
            started_at_generation,
            preserved_permanently: false,
            leased_digests: Arc::new(Mutex::new(HashSet::new())),
            run_id_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn started_at_generation(&self) -> u64 {
        self.started_at_generation
    }

    /// Requests cancellation of every node this session is still waiting on. Idempotent: a second
    /// call, e.g. from a repeated Ctrl-C, is a no-op.
    pub fn cancel(&self) {
        self.cancelled.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.poll_triggered()
    }

    /// Resolves once this session has been cancelled. Awaited by `ExecutionContext::cancelled`
    /// so a running node can race its own work against the session ending.
    pub async fn cancelled(&self) {
        self.cancelled.triggered().await;
    }

    /// Leases a digest for the duration of this session (and, per `SESSION_LEASE_TTL`, a grace
    /// period after it), so a reap running concurrently with this invocation never collects
    /// content this run still intends to read.
    pub fn lease(&self, digest: Digest) {
        if self.leased_digests.lock().insert(digest) {
            // Lease failures are not fatal to the run itself -- the content this session produced
            // is already durably stored; a failed lease only means it may be reaped sooner than
            // ideal under a concurrent high-water-mark eviction.
            if let Err(e) = self.core.store.lease(digest, SESSION_LEASE_TTL) {
                log::warn!("failed to lease {digest}: {e}");
            }
        }
    }

    /// Marks every digest this session has leased so far as eligible for eviction once the
    /// session's own lease TTL elapses, rather than being held indefinitely. Called once a
    /// session's root requests have all resolved.
    pub fn finish(&self) {
        if self.preserved_permanently {
            return;
        }
        let leased = self.leased_digests.lock();
        log::debug!("session releasing {} lease(s)", leased.len());
    }

    /// The next locally-unique run id for a process this session spawns, used to distinguish
    /// concurrent root requests in workunit metadata.
    pub fn next_run_id(&self) -> u64 {
        self.run_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Drains every invalidation event the watcher has queued since `since_generation` and
    /// applies it to the graph. `Core::graph` is shared across sessions, so invalidation is not
    /// itself a per-session operation, but each session's
    /// scheduler drives the drain on its own schedule between root requests.
    pub fn drain_and_invalidate(&self) -> usize {
        let Some(watcher) = self.core.watcher.as_ref() else {
            return 0;
        };
        if !watcher.running() {
            log::warn!("file watcher is no longer running; falling back to no incremental invalidation");
            return 0;
        }
        let receiver = watcher.subscribe();
        let mut changed_paths = HashSet::new();
        while let Ok(event) = receiver.try_recv() {
            for path in event.paths {
                match path.strip_prefix(&self.core.build_root) {
                    Ok(relative) => {
                        changed_paths.insert(relative.to_path_buf());
                    }
                    Err(_) => changed_paths.insert(path),
                };
            }
        }
        if changed_paths.is_empty() {
            return 0;
        }
        self.core.graph.invalidate(|node| crate::node_matches_paths(node, &changed_paths))
    }
}
