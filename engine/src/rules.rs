// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Plugin loading as static registration: rather than a backend registering rules at runtime via
//! a C-ABI callback into an embedded interpreter, a backend here is just a Rust function that
//! builds a `Rules` table at process startup and hands it to `rule_graph::GraphMaker`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use rule_graph::{Get, Intrinsic, Rule, TypeId};

use crate::node::{ExecutionContext, NodeError};
use crate::value::{Params, Value};

/// A rule body: given the params available at its call site and a context it can use to issue
/// `get` sub-requests, produces this rule's declared output product.
pub type RuleBody =
    Arc<dyn Fn(Params, ExecutionContext) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>;

/// The registry of rule bodies, keyed by the same `id` the corresponding `rule_graph::Rule`
/// carries. `rule_graph::GraphMaker::full_graph` has already checked that every `get` a body might
/// issue resolves to exactly one producer; this table only needs to hold the bodies themselves.
#[derive(Clone, Default)]
pub struct Rules {
    bodies: HashMap<&'static str, RuleBody>,
    declarations: Vec<Rule>,
    intrinsics: Vec<Intrinsic>,
}

impl Rules {
    pub fn new() -> Rules {
        Rules::default()
    }

    /// Registers a rule: `id` must be unique within this table and match the `id` of an intrinsic
    /// registered via `full_graph` wiring only if this is not also registered as an intrinsic.
    pub fn add_rule<F>(&mut self, id: &'static str, output: TypeId, inputs: Vec<TypeId>, gets: Vec<Get>, body: F)
    where
        F: Fn(Params, ExecutionContext) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync + 'static,
    {
        self.declarations.push(Rule { id, output, inputs, gets });
        self.bodies.insert(id, Arc::new(body));
    }

    /// Registers an intrinsic's declaration. Its body lives in
    /// `crate::intrinsics`, dispatched by id from `NodeKey::run` rather than through this table,
    /// since intrinsics are native and never call back into the rule graph solver for their own
    /// body the way a rule does -- only `rule_graph::GraphMaker` needs to know their shape.
    pub fn add_intrinsic(&mut self, id: &'static str, output: TypeId, inputs: Vec<TypeId>) {
        self.intrinsics.push(Intrinsic { id, output, inputs });
    }

    pub fn rule_declarations(&self) -> Vec<Rule> {
        self.declarations.clone()
    }

    pub fn intrinsic_declarations(&self) -> Vec<Intrinsic> {
        self.intrinsics.clone()
    }

    pub fn body(&self, id: &str) -> Option<RuleBody> {
        self.bodies.get(id).cloned()
    }
}
