// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// The recognised option types. `Dict` and `List` are kept as `BTreeMap`/`Vec` of
/// strings rather than arbitrary JSON: every value that reaches this layer came from a CLI flag,
/// an environment variable, or a TOML scalar/array, none of which carry richer structure than
/// that without a backend-specific parser sitting in front of this crate.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<String>),
    Dict(BTreeMap<String, String>),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(x) => write!(f, "{x}"),
            OptionValue::String(s) => write!(f, "{s}"),
            OptionValue::List(items) => write!(f, "[{}]", items.join(", ")),
            OptionValue::Dict(entries) => {
                let rendered: Vec<String> = entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", rendered.join(", "))
            }
        }
    }
}

/// The declared shape of an option, independent of any value: what CLI backends use to validate
/// and typecheck a raw string before it becomes an [`OptionValue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptionKind {
    Bool,
    Int,
    Float,
    String,
    List,
    Dict,
}

impl OptionKind {
    /// Parses a raw string (as it would arrive from the CLI, an env var, or a TOML scalar) into
    /// a value of this kind. Lists and dicts use the same comma-separated / `k=v,k=v` convention
    /// the CLI's `--scope-option=value` form implies.
    pub fn parse(self, raw: &str) -> Result<OptionValue, String> {
        match self {
            OptionKind::Bool => match raw {
                "true" | "1" => Ok(OptionValue::Bool(true)),
                "false" | "0" => Ok(OptionValue::Bool(false)),
                other => Err(format!("not a bool: {other:?}")),
            },
            OptionKind::Int => raw
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|e| format!("not an int: {e}")),
            OptionKind::Float => raw
                .parse::<f64>()
                .map(OptionValue::Float)
                .map_err(|e| format!("not a float: {e}")),
            OptionKind::String => Ok(OptionValue::String(raw.to_owned())),
            OptionKind::List => Ok(OptionValue::List(
                raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect(),
            )),
            OptionKind::Dict => {
                let mut dict = BTreeMap::new();
                for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (k, v) = pair
                        .split_once('=')
                        .ok_or_else(|| format!("dict entry {pair:?} is not of the form key=value"))?;
                    dict.insert(k.to_owned(), v.to_owned());
                }
                Ok(OptionValue::Dict(dict))
            }
        }
    }
}
