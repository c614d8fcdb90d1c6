// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

use async_value::{AsyncValue, AsyncValueReceiver};

use crate::node::Node;
use crate::Failure;

/// A node's recorded dependencies at the time it last completed, paired with the value each one
/// produced. Re-running a `Dirty` node compares a fresh request for each of these against the
/// stored value; if every one is unchanged, the node is clean-reused without re-executing its
/// body.
#[derive(Clone)]
pub struct Completion<N: Node> {
    pub result: Result<N::Value, Failure<N::Error>>,
    pub deps: Vec<(N, N::Value)>,
}

/// A node's lifecycle. `Failed` is represented as a `Completed` completion whose `result` is
/// `Err` -- it is memoised identically once an error is known to be deterministic (see
/// `Graph::finish_run`).
pub enum EntryState<N: Node> {
    NotStarted,
    /// The `AsyncValueReceiver` is never read directly here -- it exists only to keep the
    /// `AsyncValue`'s weak handle upgradeable, so concurrent requesters can mint their own
    /// receivers via `AsyncValue::receiver` for as long as this node is genuinely in flight.
    Running(AsyncValue<Completion<N>>, AsyncValueReceiver<Completion<N>>),
    Completed(Completion<N>),
    Dirty(Completion<N>),
}

impl<N: Node> EntryState<N> {
    pub fn label(&self) -> &'static str {
        match self {
            EntryState::NotStarted => "NotStarted",
            EntryState::Running(_, _) => "Running",
            EntryState::Completed(_) => "Completed",
            EntryState::Dirty(_) => "Dirty",
        }
    }
}

/// One node's adjacency and state. `dependents` is maintained by the owning `Graph` whenever a
/// node's dependencies are captured, so invalidation can walk forward from a changed leaf to
/// every node that might be affected.
pub struct Entry<N: Node> {
    pub state: EntryState<N>,
    pub dependents: HashSet<N>,
}

impl<N: Node> Default for Entry<N> {
    fn default() -> Self {
        Entry {
            state: EntryState::NotStarted,
            dependents: HashSet::new(),
        }
    }
}
