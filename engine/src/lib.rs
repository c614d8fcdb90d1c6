// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! The engine crate wires the rule-graph solver to the memoizing graph by giving it a concrete
//! `graph::Node`: `node::NodeKey`. `Core` (process-lifetime state), `Session` (per-invocation
//! state and invalidation), the native `intrinsics`, and `scheduler::Scheduler` build on top of
//! that single node type.

pub mod core;
pub mod global_options;
pub mod intrinsics;
pub mod node;
pub mod rules;
pub mod scheduler;
pub mod session;
pub mod value;

pub use crate::core::{Core, CoreError};
pub use crate::node::{ExecutionContext, NodeError, NodeKey};
pub use crate::rules::{RuleBody, Rules};
pub use crate::scheduler::{RootResult, Scheduler};
pub use crate::session::Session;
pub use crate::value::{Params, Value};

use std::collections::HashSet;
use std::path::PathBuf;

use fs::PathGlobs;

/// Whether a filesystem change at any of `changed` (build-root-relative paths) could have
/// affected `node`'s result, used by `Session::drain_and_invalidate` to decide
/// which completed graph nodes to mark dirty without re-walking the whole tree. A `NodeKey` is
/// sensitive to a change only through a `PathGlobs` value in its params: everything else a node
/// depends on (another node's output, a `Process`, a `Digest`) is itself invalidated
/// transitively once the `PathGlobs` node it was built from re-runs, so checking the params
/// directly is enough -- there is no need to inspect the node's recorded dependencies here.
pub fn node_matches_paths(node: &NodeKey, changed: &HashSet<PathBuf>) -> bool {
    let Some(globs_value) = node.params.get(intrinsics::type_path_globs()) else {
        return false;
    };
    let Some(globs) = globs_value.downcast::<PathGlobs>() else {
        return false;
    };
    let Ok(prepared) = (*globs).clone().parse() else {
        return false;
    };
    changed.iter().any(|path| prepared.is_match(path))
}
