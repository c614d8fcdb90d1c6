// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A rule body or intrinsic produces a `Value`: some concrete Rust type, erased behind `Any` and
//! tagged with the `rule_graph::TypeId` the solver already knows it by. There is no embedded
//! interpreter here, so unlike a reflection-based host a product's Rust type and its `TypeId`
//! name are two separate things a caller must keep in sync; `Value::new` and `downcast` are the
//! only places that happens.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use rule_graph::TypeId;

/// A type-erased product. Cloning is cheap: it bumps the `Arc` refcount rather than copying the
/// underlying value, which matters because the same completed node's value is handed to every
/// dependent that requested it via the graph engine's memoization.
#[derive(Clone)]
pub struct Value {
    type_id: TypeId,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Value {
    pub fn new<T: Any + Send + Sync>(type_id: TypeId, value: T) -> Value {
        Value { type_id, inner: Arc::new(value) }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Recovers the concrete type a producer stored. A mismatch is a registration bug (a rule or
    /// intrinsic claiming a `TypeId` it does not actually produce that type for) rather than
    /// something a well-formed rule graph should ever trigger at request time.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn expect<T: Any + Send + Sync>(&self) -> Arc<T> {
        self.downcast::<T>().unwrap_or_else(|| {
            panic!("value tagged {} did not hold the expected Rust type", self.type_id)
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.type_id)
    }
}

impl PartialEq for Value {
    /// Two `Value`s are equal if they are the same product instance (same `Arc` allocation).
    /// Structural equality is not available once the value is erased behind `Any`, and is not
    /// needed: the graph engine only ever compares a recomputed dependency's value against the
    /// one it recorded, and both come from the same memoized `Arc` unless something truly
    /// changed.
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        (Arc::as_ptr(&self.inner) as *const () as usize).hash(state);
    }
}

/// The bag of typed inputs available at a point in the rule graph, sorted and deduplicated by
/// `TypeId` the same way `rule_graph::RuleGraph::producer_for` expects its `available_params`
/// argument.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<(TypeId, ParamValue)>);

/// A hashable, equality-comparable stand-in for a param's value, used only to make `Params`
/// (and therefore `NodeKey`) usable as a `graph::Node` key. Unlike `Value`, a param's identity
/// for graph-keying purposes is its digest-like fingerprint, not its Rust type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParamValue(pub Value);

impl Params {
    pub fn new(mut params: Vec<(TypeId, Value)>) -> Params {
        params.sort_by_key(|(type_id, _)| *type_id);
        params.dedup_by_key(|(type_id, _)| *type_id);
        Params(params.into_iter().map(|(t, v)| (t, ParamValue(v))).collect())
    }

    pub fn type_ids(&self) -> Vec<TypeId> {
        self.0.iter().map(|(t, _)| *t).collect()
    }

    pub fn get(&self, type_id: TypeId) -> Option<&Value> {
        self.0.iter().find(|(t, _)| *t == type_id).map(|(_, v)| &v.0)
    }

    /// Returns a new `Params` with `value` inserted (or replacing an existing param of the same
    /// type), the way resolving a `Get(Output, Input)` extends the params available to the
    /// sub-request with its single input.
    pub fn with(&self, type_id: TypeId, value: Value) -> Params {
        let mut entries: Vec<(TypeId, Value)> =
            self.0.iter().map(|(t, v)| (*t, v.0.clone())).collect();
        entries.retain(|(t, _)| *t != type_id);
        entries.push((type_id, value));
        Params::new(entries)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|(t, _)| t.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
