// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::hash::Hash;

use futures::future::BoxFuture;

use crate::Failure;

/// One memoised unit of computation, identified by `(product_type, params)`. Implementations are
/// the rule-dispatch glue the `engine` crate builds over `rule_graph`'s solved table; this crate
/// only needs a key that is cheap to hash/clone and a way to run it.
pub trait Node: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    type Context: NodeContext<Self>;
    type Value: Clone + Eq + Send + Sync + 'static;
    type Error: NodeError;

    /// Runs this node's body. `context` carries whatever the node needs to issue sub-requests
    /// (in practice, a handle back to the owning `Graph` plus the in-flight call stack for cycle
    /// detection) -- see `engine::context::ExecutionContext`.
    fn run(self, context: Self::Context) -> BoxFuture<'static, Result<Self::Value, Self::Error>>;

    /// A short, human-readable label used in cycle diagnostics and workunit names.
    fn display_name(&self) -> String {
        format!("{self:?}")
    }
}

/// Distinguishes the error classes a node can fail with: a deterministic failure (the rule raised
/// a user error) is memoised like a successful completion; anything else is transient and must be
/// retried from `NotStarted` on the next request.
pub trait NodeError: Clone + fmt::Debug + Send + Sync + 'static {
    fn is_deterministic(&self) -> bool;
}

/// What a running node's body uses to reach back into the graph. Built by the `engine` crate for
/// each invocation with the in-flight call stack already extended by the node it is for, so that
/// nested `get` calls both detect cycles and land in the right place in `path`.
///
/// `Graph` itself is generic over this trait and never constructs a `Context` -- it only runs a
/// node's body with the one the caller supplied, and afterwards drains the dependencies that body
/// recorded through `get`.
pub trait NodeContext<N: Node>: Clone + Send + Sync + 'static {
    /// Resolves `dep`'s value, recording the edge for the node this context belongs to.
    fn get(&self, dep: N) -> BoxFuture<'static, Result<N::Value, Failure<N::Error>>>;

    /// Drains (and clears) the dependencies recorded via `get` so far. Called by `Graph` once
    /// after a node's body finishes, and also used internally while checking whether a `Dirty`
    /// node can be clean-reused.
    fn take_recorded_deps(&self) -> Vec<(N, N::Value)>;

    /// Resolves once this context's session has been cancelled. A node still `Running` when this
    /// fires reverts to `NotStarted` rather than being treated as failed.
    fn cancelled(&self) -> BoxFuture<'static, ()>;
}
