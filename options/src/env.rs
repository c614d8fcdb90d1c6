// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parses the `SCOPE_OPTION` environment variable convention out of a process environment
//! snapshot into a `(scope, option) -> raw string` layer, for every scope a schema registry
//! knows about.

use std::collections::BTreeMap;

use crate::scope::Scope;

/// `env_vars` is an iterator over `(name, value)` pairs -- callers pass `std::env::vars()` in
/// production and a fixture map in tests, so this never reads the process environment itself.
pub fn parse_layer<'a>(
    env_vars: impl IntoIterator<Item = (String, String)>,
    scopes: impl IntoIterator<Item = &'a Scope>,
) -> BTreeMap<(String, String), String> {
    let scopes: Vec<&Scope> = scopes.into_iter().collect();
    let mut layer = BTreeMap::new();
    for (key, value) in env_vars {
        for scope in &scopes {
            let prefix = format!("{}_", scope.env_prefix());
            if let Some(option_part) = key.strip_prefix(&prefix) {
                let option_name = option_part.to_lowercase();
                layer.insert((scope.name().to_owned(), option_name), value.clone());
                break;
            }
        }
    }
    layer
}
