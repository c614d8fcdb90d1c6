// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Loads a TOML config file, its top-level tables named after scopes, into one layer of
//! [`crate::RawSources::config_layers`]. Values are flattened to strings so the same
//! [`crate::value::OptionKind::parse`] path used for CLI flags and environment variables also
//! handles config-file values -- one parser, three sources.

use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as TOML: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("section [{section}] must be a table of option names to values")]
    NotATable { section: String },
}

/// Parses `contents` (the text of one TOML config file) into a `(scope, option) -> raw string`
/// layer. A top-level `[GLOBAL]` section (or bare keys, which are equivalent) feeds the `GLOBAL`
/// scope; any other top-level table name is a scope name.
pub fn parse_layer(contents: &str) -> Result<BTreeMap<(String, String), String>, ConfigError> {
    let document: toml::Value = contents.parse().map_err(|source| ConfigError::Parse {
        path: "<in-memory>".to_owned(),
        source,
    })?;
    let mut layer = BTreeMap::new();
    let table = document.as_table().ok_or_else(|| ConfigError::NotATable {
        section: "<root>".to_owned(),
    })?;
    for (scope_name, section) in table {
        let section_table = section.as_table().ok_or_else(|| ConfigError::NotATable {
            section: scope_name.clone(),
        })?;
        for (option_name, value) in section_table {
            layer.insert((scope_name.clone(), option_name.clone()), render_scalar(value));
        }
    }
    Ok(layer)
}

pub fn load_layer(path: &Path) -> Result<BTreeMap<(String, String), String>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_layer(&contents)
}

/// Renders a TOML value back to the same comma-separated string convention
/// [`crate::value::OptionKind::parse`] expects from the CLI and environment, so one value layer
/// never needs scope-schema knowledge to be constructed.
fn render_scalar(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Array(items) => items.iter().map(render_scalar).collect::<Vec<_>>().join(","),
        toml::Value::Table(entries) => entries
            .iter()
            .map(|(k, v)| format!("{k}={}", render_scalar(v)))
            .collect::<Vec<_>>()
            .join(","),
        toml::Value::Datetime(dt) => dt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_scoped_sections() {
        let layer = parse_layer(
            r#"
            [black]
            args = ["-l", "120"]

            [GLOBAL]
            pants_workdir = ".pants.d"
            "#,
        )
        .unwrap();
        assert_eq!(
            layer.get(&("black".to_string(), "args".to_string())),
            Some(&"-l,120".to_string())
        );
        assert_eq!(
            layer.get(&("GLOBAL".to_string(), "pants_workdir".to_string())),
            Some(&".pants.d".to_string())
        );
    }

    #[test]
    fn rejects_a_scalar_section() {
        let err = parse_layer("black = 1").unwrap_err();
        assert!(matches!(err, ConfigError::NotATable { .. }));
    }
}
