// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The `graph::Node` implementation that ties the rule-graph solver to the memoizing graph
//! engine: a `NodeKey` names a product requested for a set of params, `producer_for` picks
//! exactly one rule or intrinsic to satisfy it, and running that body may itself issue further
//! `NodeKey` requests through `ExecutionContext::get`.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rule_graph::{ProducerId, TypeId};

use crate::core::Core;
use crate::session::Session;
use crate::value::{Params, Value};

/// This crate's error taxonomy: a rule-graph dispatch failure (no producer / ambiguous producers)
/// is its own flavor of engine error, since there is no separate "rule not applicable to this
/// subject type" distinction once dispatch is by `(TypeId, Params)` rather than by introspecting
/// a live value.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NodeError {
    #[error("no rule or intrinsic produces {product} given params {params}")]
    NoProducer { product: TypeId, params: String },
    #[error("ambiguous producers for {product} given params {params}")]
    Ambiguous { product: TypeId, params: String },
    #[error("{0}")]
    User(String),
    #[error("{0}")]
    Io(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
}

impl graph::NodeError for NodeError {
    /// A timeout or cancellation is a property of this particular run, not of the node's inputs,
    /// so it must not be memoized the way a `Completed` result is.
    fn is_deterministic(&self) -> bool {
        !matches!(self, NodeError::Timeout(_) | NodeError::Cancelled)
    }
}

impl From<store::StoreError> for NodeError {
    fn from(err: store::StoreError) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<process_execution::ProcessError> for NodeError {
    fn from(err: process_execution::ProcessError) -> Self {
        match err {
            process_execution::ProcessError::Timeout(d) => NodeError::Timeout(format!("{d:?}")),
            process_execution::ProcessError::Cancelled => NodeError::Cancelled,
            other => NodeError::Io(other.to_string()),
        }
    }
}

pub(crate) fn failure_to_node_error(failure: graph::Failure<NodeError>) -> NodeError {
    match failure {
        graph::Failure::Throw(e) => e,
        graph::Failure::Io(msg) => NodeError::Io(msg),
        graph::Failure::Cycle(path) => NodeError::User(format!("dependency cycle: {}", path.join(" -> "))),
        graph::Failure::Cancelled => NodeError::Cancelled,
    }
}

/// Names a request for `product`, given the typed inputs in `params` -- the unit of work the
/// graph engine memoizes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub product: TypeId,
    pub params: Params,
}

impl NodeKey {
    pub fn new(product: TypeId, params: Params) -> NodeKey {
        NodeKey { product, params }
    }
}

impl graph::Node for NodeKey {
    type Context = ExecutionContext;
    type Value = Value;
    type Error = NodeError;

    fn run(self, context: ExecutionContext) -> BoxFuture<'static, Result<Value, NodeError>> {
        async move {
            let available = self.params.type_ids();
            let producer = context
                .core
                .rule_graph
                .producer_for(self.product, &available)
                .ok_or_else(|| NodeError::NoProducer {
                    product: self.product,
                    params: self.params.to_string(),
                })?;

            match producer {
                ProducerId::Rule(id) => {
                    let body = context.core.rules.body(id).ok_or_else(|| {
                        NodeError::Io(format!("rule `{id}` declared but no body was registered"))
                    })?;
                    body(self.params, context).await
                }
                ProducerId::Intrinsic(id) => {
                    crate::intrinsics::run(id, self.params, context).await
                }
            }
        }
        .boxed()
    }

    fn display_name(&self) -> String {
        format!("{}{}", self.product, self.params)
    }
}

/// The per-request-stack execution context a running node's body is handed: it knows the shared
/// `Core`, the `Session` this run belongs to, the call-stack path so far (for cycle detection),
/// and accumulates the `(dep, value)` pairs it requests (so the graph can record them for later
/// clean-reuse checks).
#[derive(Clone)]
pub struct ExecutionContext {
    pub core: Arc<Core>,
    pub session: Session,
    path: Arc<Vec<NodeKey>>,
    recorded: Arc<Mutex<Vec<(NodeKey, Value)>>>,
}

impl ExecutionContext {
    pub fn root(core: Arc<Core>, session: Session) -> ExecutionContext {
        ExecutionContext {
            core,
            session,
            path: Arc::new(Vec::new()),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn for_node(&self, node: &NodeKey) -> ExecutionContext {
        let mut path = (*self.path).clone();
        path.push(node.clone());
        ExecutionContext {
            core: self.core.clone(),
            session: self.session.clone(),
            path: Arc::new(path),
            recorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience for rule bodies and intrinsics: request a single product for `params`, mapping
    /// graph-level failures down into this crate's `NodeError`.
    pub async fn get_one(&self, product: TypeId, params: Params) -> Result<Value, NodeError> {
        self.get(NodeKey::new(product, params))
            .await
            .map_err(failure_to_node_error)
    }
}

impl graph::NodeContext<NodeKey> for ExecutionContext {
    fn get(&self, dep: NodeKey) -> BoxFuture<'static, Result<Value, graph::Failure<NodeError>>> {
        let child_context = self.for_node(&dep);
        let graph = self.core.graph.clone();
        let path = self.path.clone();
        let recorded = self.recorded.clone();
        async move {
            let value = graph.request(dep.clone(), child_context, path).await?;
            recorded.lock().push((dep, value.clone()));
            Ok(value)
        }
        .boxed()
    }

    fn take_recorded_deps(&self) -> Vec<(NodeKey, Value)> {
        std::mem::take(&mut self.recorded.lock())
    }

    fn cancelled(&self) -> BoxFuture<'static, ()> {
        let session = self.session.clone();
        async move { session.cancelled().await }.boxed()
    }
}
