// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The GLOBAL scope's option schema: the handful of settings `Core` itself needs to come up, as
//! opposed to the much larger set of per-goal and per-backend scopes that `cli` resolves but
//! never looks inside -- those are opaque `options::ScopeValues` that rule bodies query for
//! themselves.

use std::path::PathBuf;

use options::{OptionDef, OptionKind, OptionValue, ScopeSchema, ScopeValues};

pub fn schema() -> ScopeSchema {
    ScopeSchema::new()
        .register(OptionDef::new(
            "pants-workdir",
            OptionKind::String,
            OptionValue::String(".pants.d".to_string()),
        ))
        .register(OptionDef::new(
            "local-store-dir",
            OptionKind::String,
            OptionValue::String(".pants.d/lmdb_store".to_string()),
        ))
        .register(OptionDef::new(
            "named-caches-dir",
            OptionKind::String,
            OptionValue::String(".pants.d/named_caches".to_string()),
        ))
        .register(OptionDef::new(
            "process-execution-local-parallelism",
            OptionKind::Int,
            OptionValue::Int(num_cpus::get() as i64),
        ))
        .register(OptionDef::new(
            "process-execution-cache-memory-max",
            OptionKind::Int,
            OptionValue::Int(4096),
        ))
        .register(OptionDef::new(
            "remote-execution",
            OptionKind::Bool,
            OptionValue::Bool(false),
        ))
        .register(OptionDef::new("keep-going", OptionKind::Bool, OptionValue::Bool(false)))
        .register(OptionDef::new(
            "dynamic-ui",
            OptionKind::Bool,
            OptionValue::Bool(true),
        ))
}

/// Resolved GLOBAL-scope settings, typed the way `Core::new` wants them rather than as the raw
/// `OptionValue`s `options::OptionsParser::resolve` hands back.
pub struct ExecutionOptions {
    pub build_root: PathBuf,
    pub local_store_dir: PathBuf,
    pub named_caches_dir: PathBuf,
    pub local_parallelism: usize,
    pub process_cache_memory_max: usize,
    pub remote_execution: bool,
    pub keep_going: bool,
    pub dynamic_ui: bool,
}

impl ExecutionOptions {
    pub fn from_scope_values(build_root: PathBuf, values: &ScopeValues) -> Result<ExecutionOptions, String> {
        let string_opt = |name: &str| match values.get(name) {
            Some(OptionValue::String(s)) => Ok(s.clone()),
            other => Err(format!("expected a string for `{name}`, got {other:?}")),
        };
        let int_opt = |name: &str| match values.get(name) {
            Some(OptionValue::Int(i)) => Ok(*i),
            other => Err(format!("expected an int for `{name}`, got {other:?}")),
        };
        let bool_opt = |name: &str| match values.get(name) {
            Some(OptionValue::Bool(b)) => Ok(*b),
            other => Err(format!("expected a bool for `{name}`, got {other:?}")),
        };

        Ok(ExecutionOptions {
            local_store_dir: build_root.join(string_opt("local-store-dir")?),
            named_caches_dir: build_root.join(string_opt("named-caches-dir")?),
            local_parallelism: int_opt("process-execution-local-parallelism")? as usize,
            process_cache_memory_max: int_opt("process-execution-cache-memory-max")? as usize,
            remote_execution: bool_opt("remote-execution")?,
            keep_going: bool_opt("keep-going")?,
            dynamic_ui: bool_opt("dynamic-ui")?,
            build_root,
        })
    }
}
