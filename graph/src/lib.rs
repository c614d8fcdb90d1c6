// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The memoising, content-addressed DAG of node states. This is deliberately small and generic
//! -- it knows nothing about rules, options, or processes, only about `Node` keys, their
//! `EntryState`, and the rules for reusing or invalidating that state.

mod entry;
mod node;

pub use entry::{Completion, Entry, EntryState};
pub use node::{Node, NodeContext, NodeError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_value::AsyncValue;
use parking_lot::Mutex;

/// The error type every `Graph::request` can resolve to.
#[derive(Clone, Debug)]
pub enum Failure<E: NodeError> {
    /// The node's body returned this error. Memoised (as a `Completed` entry) only if
    /// `E::is_deterministic()` is true for it.
    Throw(E),
    /// An I/O-ish or otherwise transient failure not attributable to the node's own logic. Never
    /// memoised; the entry reverts to `NotStarted`.
    Io(String),
    /// Resolving this node would close a cycle. Carries the display names of the path from the
    /// node that closes the cycle back to itself, e.g. `[a, b, a]`. Never memoised.
    Cycle(Vec<String>),
    /// The owning session was cancelled while this node was `Running`. Never memoised.
    Cancelled,
}

impl<E: NodeError> Failure<E> {
    /// Whether this failure should be memoised like a successful completion.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Failure::Throw(e) if e.is_deterministic())
    }
}

impl<E: NodeError> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Throw(e) => write!(f, "{e:?}"),
            Failure::Io(msg) => write!(f, "{msg}"),
            Failure::Cycle(path) => write!(f, "cycle detected: {}", path.join(" -> ")),
            Failure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The memoising DAG itself: a map from `Node` to its `Entry`, guarded per-entry so that
/// unrelated nodes never contend with each other.
pub struct Graph<N: Node> {
    entries: Mutex<HashMap<N, Arc<Mutex<Entry<N>>>>>,
}

impl<N: Node> Default for Graph<N> {
    fn default() -> Self {
        Graph {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// What the caller should do next, decided while holding only the entry's own lock.
enum Action<N: Node> {
    UseCached(Result<N::Value, Failure<N::Error>>),
    AwaitRunning(async_value::AsyncValueReceiver<Completion<N>>),
    Run { prior: Option<Completion<N>> },
    Retry,
}

impl<N: Node> Graph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(&self, node: &N) -> Arc<Mutex<Entry<N>>> {
        let mut entries = self.entries.lock();
        entries
            .entry(node.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Entry::default())))
            .clone()
    }

    /// Resolves `node`'s value, reusing a memoised or in-flight result if one is available,
    /// clean-reusing a `Dirty` one if its recorded dependencies are unchanged, and otherwise
    /// running its body exactly once no matter how many concurrent callers ask for it.
    ///
    /// `path` is the call stack of nodes already being resolved by whoever is calling this (empty
    /// for a session's root request). The caller -- in practice `engine::ExecutionContext::get`
    /// -- is responsible for extending it by `node` itself before building the `context` it
    /// passes to nested `get` calls; this method only uses `path` for its own cycle check.
    pub async fn request(
        &self,
        node: N,
        context: N::Context,
        path: Arc<Vec<N>>,
    ) -> Result<N::Value, Failure<N::Error>> {
        if let Some(closing) = path.iter().position(|n| n == &node) {
            let mut names: Vec<String> = path[closing..].iter().map(Node::display_name).collect();
            names.push(node.display_name());
            return Err(Failure::Cycle(names));
        }

        loop {
            let entry_arc = self.entry_for(&node);

            // Decide what to do while holding only this node's lock; any awaiting happens after
            // it has been released, so unrelated nodes are never blocked on this one.
            let (action, sender) = {
                let mut entry = entry_arc.lock();
                match &entry.state {
                    EntryState::Completed(completion) => (Action::UseCached(completion.result.clone()), None),
                    EntryState::Running(value, _keepalive) => match value.receiver() {
                        Some(receiver) => (Action::AwaitRunning(receiver), None),
                        None => (Action::Retry, None),
                    },
                    EntryState::NotStarted => {
                        let (value, sender, receiver) = AsyncValue::new();
                        entry.state = EntryState::Running(value, receiver);
                        (Action::Run { prior: None }, Some(sender))
                    }
                    EntryState::Dirty(completion) => {
                        let prior = completion.clone();
                        let (value, sender, receiver) = AsyncValue::new();
                        entry.state = EntryState::Running(value, receiver);
                        (Action::Run { prior: Some(prior) }, Some(sender))
                    }
                }
            };

            match action {
                Action::UseCached(result) => return result,
                Action::Retry => continue,
                Action::AwaitRunning(receiver) => match receiver.recv().await {
                    Some(completion) => return completion.result,
                    None => continue,
                },
                Action::Run { prior } => {
                    let sender = sender.expect("Action::Run always carries a sender");
                    let completion = tokio::select! {
                        completion = self.run_or_reuse(&node, &context, prior) => completion,
                        () = context.cancelled() => {
                            self.revert_to_not_started(&node);
                            // Dropping the sender without sending wakes any concurrent
                            // `AsyncValueReceiver::recv` callers with `None`, which sends them
                            // back through `Action::Retry`.
                            drop(sender);
                            return Err(Failure::Cancelled);
                        }
                    };

                    self.finish_running(&node, &completion);
                    sender.send(completion.clone());
                    return completion.result;
                }
            }
        }
    }

    /// Runs `node`'s body, unless `prior` is `Some` and every dependency it recorded last time
    /// still resolves to the same value, in which case `prior` is reused verbatim and the body is
    /// never invoked.
    async fn run_or_reuse(
        &self,
        node: &N,
        context: &N::Context,
        prior: Option<Completion<N>>,
    ) -> Completion<N> {
        if let Some(prior) = prior {
            if Self::is_clean(&prior, context).await {
                // Discard whatever the cleanliness probe itself recorded; the authoritative
                // dependency set is the one already stored on `prior`.
                let _ = context.take_recorded_deps();
                return prior;
            }
        }

        let result = node.clone().run(context.clone()).await.map_err(Failure::Throw);
        let deps = context.take_recorded_deps();
        Completion { result, deps }
    }

    async fn is_clean(prior: &Completion<N>, context: &N::Context) -> bool {
        for (dep, old_value) in &prior.deps {
            match context.get(dep.clone()).await {
                Ok(new_value) if &new_value == old_value => continue,
                _ => return false,
            }
        }
        true
    }

    /// Installs the outcome of a run, memoising it if it is a success or a deterministic error,
    /// and recording `node` as a dependent of everything it just depended on.
    fn finish_running(&self, node: &N, completion: &Completion<N>) {
        let memoise = match &completion.result {
            Ok(_) => true,
            Err(failure) => failure.is_deterministic(),
        };

        if memoise {
            for (dep, _) in &completion.deps {
                let dep_entry = self.entry_for(dep);
                dep_entry.lock().dependents.insert(node.clone());
            }
            let entry_arc = self.entry_for(node);
            entry_arc.lock().state = EntryState::Completed(completion.clone());
        } else {
            log::debug!("{} failed transiently, reverting to NotStarted", node.display_name());
            self.revert_to_not_started(node);
        }
    }

    fn revert_to_not_started(&self, node: &N) {
        let entry_arc = self.entry_for(node);
        entry_arc.lock().state = EntryState::NotStarted;
    }

    /// Marks every node matching `predicate`, and everything transitively downstream of it, as
    /// `Dirty` -- preserving each one's prior `Completion` so a later `request` can attempt a
    /// clean reuse before re-running anything.
    ///
    /// Dirtying is eager; re-running a dirtied node's body is lazy and only happens the next time
    /// it is actually requested.
    pub fn invalidate(&self, predicate: impl Fn(&N) -> bool) -> usize {
        let roots: Vec<N> = {
            let entries = self.entries.lock();
            entries.keys().filter(|n| predicate(n)).cloned().collect()
        };

        let mut dirtied = 0;
        let mut frontier = roots;
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = frontier.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            let entry_arc = self.entry_for(&node);
            let dependents: Vec<N> = {
                let mut entry = entry_arc.lock();
                let dependents = entry.dependents.iter().cloned().collect();
                match std::mem::replace(&mut entry.state, EntryState::NotStarted) {
                    EntryState::Completed(completion) => {
                        entry.state = EntryState::Dirty(completion);
                        dirtied += 1;
                    }
                    EntryState::Dirty(completion) => {
                        entry.state = EntryState::Dirty(completion);
                    }
                    other => entry.state = other,
                }
                dependents
            };
            frontier.extend(dependents);
        }
        log::debug!("dirtied {dirtied} node(s)");
        dirtied
    }

    /// Discards all memoised state. Used between sessions that do not share a workspace, and in
    /// tests.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// The number of distinct nodes this graph currently holds an entry for, regardless of state.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::future::{BoxFuture, FutureExt};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Key(&'static str);

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Boom(String);
    impl NodeError for Boom {
        fn is_deterministic(&self) -> bool {
            true
        }
    }

    /// A fake execution context sufficient to exercise `Graph` in isolation: it knows the `Graph`
    /// it belongs to, the call-stack path so far, and records whatever `get` calls the node's
    /// body makes.
    #[derive(Clone)]
    struct TestContext {
        graph: Arc<Graph<Key>>,
        path: Arc<Vec<Key>>,
        recorded: Arc<Mutex<Vec<(Key, usize)>>>,
        bodies: Arc<HashMap<Key, TestBody>>,
        spawn_count: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    enum TestBody {
        Value(usize),
        DependsOn(Key),
    }

    impl TestContext {
        fn for_node(&self, node: &Key) -> TestContext {
            let mut path = (*self.path).clone();
            path.push(node.clone());
            TestContext {
                graph: self.graph.clone(),
                path: Arc::new(path),
                recorded: Arc::new(Mutex::new(Vec::new())),
                bodies: self.bodies.clone(),
                spawn_count: self.spawn_count.clone(),
            }
        }
    }

    impl NodeContext<Key> for TestContext {
        fn get(&self, dep: Key) -> BoxFuture<'static, Result<usize, Failure<Boom>>> {
            let child_context = self.for_node(&dep);
            let graph = self.graph.clone();
            let path = self.path.clone();
            let recorded = self.recorded.clone();
            async move {
                let value = graph.request(dep.clone(), child_context, path).await?;
                recorded.lock().push((dep, value));
                Ok(value)
            }
            .boxed()
        }

        fn take_recorded_deps(&self) -> Vec<(Key, usize)> {
            std::mem::take(&mut self.recorded.lock())
        }

        fn cancelled(&self) -> BoxFuture<'static, ()> {
            futures::future::pending().boxed()
        }
    }

    impl Node for Key {
        type Context = TestContext;
        type Value = usize;
        type Error = Boom;

        fn run(self, context: Self::Context) -> BoxFuture<'static, Result<usize, Boom>> {
            let body = context
                .bodies
                .get(&self)
                .cloned()
                .unwrap_or(TestBody::Value(0));
            context.spawn_count.fetch_add(1, Ordering::SeqCst);
            async move {
                match body {
                    TestBody::Value(v) => Ok(v),
                    TestBody::DependsOn(dep) => context
                        .get(dep)
                        .await
                        .map_err(|_| Boom("dependency failed".to_string())),
                }
            }
            .boxed()
        }

        fn display_name(&self) -> String {
            self.0.to_string()
        }
    }

    fn root_context(
        graph: Arc<Graph<Key>>,
        bodies: HashMap<Key, TestBody>,
        spawn_count: Arc<AtomicUsize>,
    ) -> TestContext {
        TestContext {
            graph,
            path: Arc::new(Vec::new()),
            recorded: Arc::new(Mutex::new(Vec::new())),
            bodies: Arc::new(bodies),
            spawn_count,
        }
    }

    #[tokio::test]
    async fn resolves_a_simple_chain() {
        let graph = Arc::new(Graph::<Key>::new());
        let mut bodies = HashMap::new();
        bodies.insert(Key("root"), TestBody::DependsOn(Key("leaf")));
        bodies.insert(Key("leaf"), TestBody::Value(42));
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let context = root_context(graph.clone(), bodies, spawn_count);

        let value = graph
            .request(Key("root"), context, Arc::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn concurrent_requests_single_flight() {
        let graph = Arc::new(Graph::<Key>::new());
        let mut bodies = HashMap::new();
        bodies.insert(Key("shared"), TestBody::Value(7));
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let context = root_context(graph.clone(), bodies, spawn_count.clone());

        let (a, b) = tokio::join!(
            graph.request(Key("shared"), context.clone(), Arc::new(Vec::new())),
            graph.request(Key("shared"), context.clone(), Arc::new(Vec::new())),
        );
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(spawn_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clean_reuse_skips_rerunning_the_body() {
        let graph = Arc::new(Graph::<Key>::new());
        let mut bodies = HashMap::new();
        bodies.insert(Key("root"), TestBody::DependsOn(Key("leaf")));
        bodies.insert(Key("leaf"), TestBody::Value(1));
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let context = root_context(graph.clone(), bodies, spawn_count.clone());

        graph
            .request(Key("root"), context.clone(), Arc::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(spawn_count.load(Ordering::SeqCst), 2);

        let dirtied = graph.invalidate(|k| k == &Key("root"));
        assert_eq!(dirtied, 1);

        let value = graph
            .request(Key("root"), context.clone(), Arc::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(value, 1);
        // `leaf` is re-requested during the cleanliness probe (one more spawn) but `root`'s own
        // body is never invoked again because `leaf`'s value hasn't changed.
        assert_eq!(spawn_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidation_propagates_transitively_to_dependents() {
        let graph = Arc::new(Graph::<Key>::new());
        let mut bodies = HashMap::new();
        bodies.insert(Key("top"), TestBody::DependsOn(Key("mid")));
        bodies.insert(Key("mid"), TestBody::DependsOn(Key("leaf")));
        bodies.insert(Key("leaf"), TestBody::Value(1));
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let context = root_context(graph.clone(), bodies, spawn_count);

        graph
            .request(Key("top"), context.clone(), Arc::new(Vec::new()))
            .await
            .unwrap();

        let dirtied = graph.invalidate(|k| k == &Key("leaf"));
        // `leaf` itself, plus `mid` and `top` transitively through `dependents`.
        assert_eq!(dirtied, 3);
    }

    #[tokio::test]
    async fn cycles_are_reported_with_the_closing_path() {
        let graph = Arc::new(Graph::<Key>::new());
        let bodies = HashMap::new();
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let context = root_context(graph.clone(), bodies, spawn_count);

        // Simulate `a` already being on the call stack when `a` is requested again (i.e. a->b->a).
        let path = Arc::new(vec![Key("a"), Key("b")]);
        let result = graph.request(Key("a"), context, path).await;
        match result {
            Err(Failure::Cycle(names)) => {
                assert_eq!(names, vec!["a".to_string(), "b".to_string(), "a".to_string()]);
            }
            other => panic!("expected a Cycle failure, got {other:?}"),
        }
    }
}
