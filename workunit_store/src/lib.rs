// Copyright 2019 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The workunit store: a concurrent tree of start/complete/fail events, consumed by the
//! responsibility list ("reports progress ... to the console") and consumed by `ui` for live
//! rendering and by `cli` for the end-of-run summary.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use rand::Rng;
use smallvec::SmallVec;

pub use log::Level;

/// A unique id for one run of the engine within a single process (used to scope workunits that
/// outlive a single session, such as a shared local cache warm-up).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new() -> SpanId {
        SpanId(rand::rng().random())
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

type ParentIds = SmallVec<[SpanId; 2]>;

#[derive(Clone, Debug)]
pub enum WorkunitState {
    Started { start_time: Instant },
    Completed { duration: Duration },
    Failed { duration: Duration, description: String },
}

impl WorkunitState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, WorkunitState::Started { .. })
    }
}

#[derive(Clone, Debug)]
pub struct Workunit {
    pub span_id: SpanId,
    pub parent_ids: ParentIds,
    pub name: String,
    pub level: Level,
    pub state: WorkunitState,
}

/// Holds running workunits in a DAG (so a workunit can have more than one parent, e.g. when two
/// rule bodies both await the same cached sub-request's workunit) and retains a bounded tail of
/// completed ones for the final summary.
struct Inner {
    graph: StableDiGraph<SpanId, (), u32>,
    running: HashMap<SpanId, (NodeIndex<u32>, Workunit)>,
    completed: Vec<Workunit>,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            graph: StableDiGraph::default(),
            running: HashMap::new(),
            completed: Vec::new(),
        }
    }
}

/// The engine-wide store of workunit state. One instance lives on `engine::Core` and is shared
/// by every session; `ui` polls `running()` for live rendering, `cli` reads `completed()` (after
/// a session finishes) for the run summary.
#[derive(Clone)]
pub struct WorkunitStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for WorkunitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkunitStore {
    pub fn new() -> WorkunitStore {
        WorkunitStore {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Starts a workunit named `name` at `level`, optionally nested under `parent`. Returns the
    /// new workunit's id.
    pub fn start_workunit(&self, name: impl Into<String>, level: Level, parent: Option<SpanId>) -> SpanId {
        let span_id = SpanId::new();
        let mut inner = self.inner.lock();
        let node = inner.graph.add_node(span_id);
        if let Some(parent_id) = parent {
            if let Some((parent_node, _)) = inner.running.get(&parent_id) {
                inner.graph.add_edge(*parent_node, node, ());
            }
        }
        let workunit = Workunit {
            span_id,
            parent_ids: parent.into_iter().collect(),
            name: name.into(),
            level,
            state: WorkunitState::Started {
                start_time: Instant::now(),
            },
        };
        inner.running.insert(span_id, (node, workunit));
        span_id
    }

    /// Marks `span_id` completed, moving it out of the running set.
    pub fn complete_workunit(&self, span_id: SpanId) {
        self.finish(span_id, None);
    }

    /// Marks `span_id` failed with `description`, moving it out of the running set.
    pub fn fail_workunit(&self, span_id: SpanId, description: impl Into<String>) {
        self.finish(span_id, Some(description.into()));
    }

    fn finish(&self, span_id: SpanId, failure: Option<String>) {
        let mut inner = self.inner.lock();
        let Some((node, mut workunit)) = inner.running.remove(&span_id) else {
            log::warn!("no running workunit found for span {span_id}");
            return;
        };
        inner.graph.remove_node(node);

        let duration = match workunit.state {
            WorkunitState::Started { start_time } => start_time.elapsed(),
            _ => Duration::ZERO,
        };
        workunit.state = match failure {
            Some(description) => WorkunitState::Failed { duration, description },
            None => WorkunitState::Completed { duration },
        };

        inner.completed.push(workunit);
        // Keep the summary bounded; callers that want everything should read it incrementally.
        if inner.completed.len() > 10_000 {
            inner.completed.remove(0);
        }
    }

    /// Workunits currently in flight, in no particular order -- what `ui` renders live.
    pub fn running(&self) -> Vec<Workunit> {
        self.inner.lock().running.values().map(|(_, w)| w.clone()).collect()
    }

    /// Every workunit that has completed or failed since the store (or session) started.
    pub fn completed(&self) -> Vec<Workunit> {
        self.inner.lock().completed.clone()
    }

    /// Completed workunits whose final state is `Failed`, for the run summary.
    pub fn failures(&self) -> Vec<Workunit> {
        self.completed()
            .into_iter()
            .filter(|w| matches!(w.state, WorkunitState::Failed { .. }))
            .collect()
    }

    /// Discards all recorded state. Used between sessions that do not want to carry over
    /// progress history.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.graph.clear();
        inner.running.clear();
        inner.completed.clear();
    }
}

/// Runs `f`, starting a workunit before and completing/failing it after, based on whether `f`'s
/// result is `Ok`/`Err`. The common wrapper rule bodies and intrinsics use around their work.
pub async fn with_workunit<T, E, F>(
    store: &WorkunitStore,
    name: impl Into<String>,
    level: Level,
    parent: Option<SpanId>,
    f: F,
) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let span_id = store.start_workunit(name, level, parent);
    let result = f.await;
    match &result {
        Ok(_) => store.complete_workunit(span_id),
        Err(e) => store.fail_workunit(span_id, e.to_string()),
    }
    result
}
