// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Resolves typed, hierarchical option values from defaults, config files, environment
//! variables, and the CLI, and exposes a stable fingerprint per scope so the graph engine can
//! invalidate rules whose behaviour depends on a scope's effective values.

pub mod config;
pub mod env;
pub mod scope;
pub mod value;

pub use crate::scope::Scope;
pub use crate::value::{OptionKind, OptionValue};

use std::collections::BTreeMap;
use std::fmt;

use hashing::Digest;
use indexmap::IndexMap;

/// One recognised option within a scope: its name, type, default, and whether it should be
/// excluded from the scope's fingerprint -- e.g. a `--colors` display hint that doesn't change
/// what a rule produces, only how results are rendered.
#[derive(Clone, Debug)]
pub struct OptionDef {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: OptionValue,
    pub fingerprintable: bool,
    pub removed: Option<&'static str>,
}

impl OptionDef {
    pub fn new(name: &'static str, kind: OptionKind, default: OptionValue) -> OptionDef {
        OptionDef {
            name,
            kind,
            default,
            fingerprintable: true,
            removed: None,
        }
    }

    pub fn non_fingerprintable(mut self) -> OptionDef {
        self.fingerprintable = false;
        self
    }

    pub fn removed(mut self, reason: &'static str) -> OptionDef {
        self.removed = Some(reason);
        self
    }
}

/// A backend's declaration of the options a scope recognises, registered once at startup
/// (mirroring the rule registry's one-time solve).
#[derive(Clone, Debug, Default)]
pub struct ScopeSchema {
    options: IndexMap<&'static str, OptionDef>,
}

impl ScopeSchema {
    pub fn new() -> ScopeSchema {
        ScopeSchema::default()
    }

    pub fn register(mut self, def: OptionDef) -> ScopeSchema {
        self.options.insert(def.name, def);
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OptionsError {
    #[error("[{scope}] unrecognized option: {name}")]
    Unrecognized { scope: String, name: String },
    #[error("[{scope}] {name}: {message}")]
    TypeMismatch {
        scope: String,
        name: String,
        message: String,
    },
    #[error("[{scope}] {name} was removed: {reason}")]
    Removed {
        scope: String,
        name: String,
        reason: String,
    },
}

/// A single raw value observed at one precedence tier, prior to resolution. Config files are
/// supplied already split into priority order (highest first): a backend-level config overriding
/// a repo-level one overriding a user-level one, for instance.
#[derive(Clone, Debug, Default)]
pub struct RawSources {
    pub cli: BTreeMap<(String, String), String>,
    pub env: BTreeMap<(String, String), String>,
    /// Config layers, highest priority first.
    pub config_layers: Vec<BTreeMap<(String, String), String>>,
}

impl RawSources {
    fn lookup(&self, scope: &str, name: &str) -> Option<&str> {
        let key = (scope.to_owned(), name.to_owned());
        if let Some(v) = self.cli.get(&key) {
            return Some(v);
        }
        if let Some(v) = self.env.get(&key) {
            return Some(v);
        }
        for layer in &self.config_layers {
            if let Some(v) = layer.get(&key) {
                return Some(v);
            }
        }
        None
    }
}

/// The resolved, typed values for one scope, plus the scope's stable fingerprint.
#[derive(Clone, Debug)]
pub struct ScopeValues {
    pub scope: Scope,
    values: BTreeMap<&'static str, OptionValue>,
    fingerprint: Digest,
}

impl ScopeValues {
    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn fingerprint(&self) -> Digest {
        self.fingerprint
    }
}

/// Resolves [`ScopeSchema`]s against [`RawSources`] for a single session. One `OptionsParser` is
/// built per CLI invocation and threaded explicitly through the session -- there is no
/// process-global mutable option state anywhere else in the engine.
pub struct OptionsParser {
    sources: RawSources,
}

impl OptionsParser {
    pub fn new(sources: RawSources) -> OptionsParser {
        OptionsParser { sources }
    }

    /// Resolves every option in `schema` for `scope`, in CLI > env > highest-priority config >
    /// lower config > default order.
    pub fn resolve(&self, scope: Scope, schema: &ScopeSchema) -> Result<ScopeValues, OptionsError> {
        let mut values = BTreeMap::new();
        for def in schema.options.values() {
            if let Some(reason) = def.removed {
                if self.sources.lookup(scope.name(), def.name).is_some() {
                    return Err(OptionsError::Removed {
                        scope: scope.name().to_owned(),
                        name: def.name.to_owned(),
                        reason: reason.to_owned(),
                    });
                }
                continue;
            }
            let resolved = match self.sources.lookup(scope.name(), def.name) {
                Some(raw) => def.kind.parse(raw).map_err(|message| OptionsError::TypeMismatch {
                    scope: scope.name().to_owned(),
                    name: def.name.to_owned(),
                    message,
                })?,
                None => def.default.clone(),
            };
            values.insert(def.name, resolved);
        }
        // An option supplied that the schema never declared is a fatal error, not a silently
        // ignored typo.
        self.check_for_unrecognized(&scope, schema)?;

        let fingerprint = Self::fingerprint_of(schema, &values);
        Ok(ScopeValues {
            scope,
            values,
            fingerprint,
        })
    }

    fn check_for_unrecognized(&self, scope: &Scope, schema: &ScopeSchema) -> Result<(), OptionsError> {
        let recognized: std::collections::HashSet<&str> = schema.options.keys().copied().collect();
        for (s, name) in self
            .sources
            .cli
            .keys()
            .chain(self.sources.env.keys())
            .chain(self.sources.config_layers.iter().flat_map(|l| l.keys()))
        {
            if s == scope.name() && !recognized.contains(name.as_str()) {
                return Err(OptionsError::Unrecognized {
                    scope: scope.name().to_owned(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// A stable hash of the scope's effective, fingerprintable values. Two resolutions with the
    /// same fingerprint are guaranteed to have produced the same values for every
    /// `fingerprintable` option, which is precisely what lets the graph engine key an
    /// option-dependent node on this digest rather than the whole `ScopeValues`.
    fn fingerprint_of(schema: &ScopeSchema, values: &BTreeMap<&'static str, OptionValue>) -> Digest {
        let mut canonical = String::new();
        for def in schema.options.values() {
            if !def.fingerprintable {
                continue;
            }
            if let Some(value) = values.get(def.name) {
                canonical.push_str(def.name);
                canonical.push('=');
                canonical.push_str(&value.to_string());
                canonical.push('\n');
            }
        }
        Digest::of_bytes(canonical.as_bytes())
    }
}

impl fmt::Debug for OptionsParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsParser").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ScopeSchema {
        ScopeSchema::new()
            .register(OptionDef::new("args", OptionKind::List, OptionValue::List(vec![])))
            .register(OptionDef::new(
                "colors",
                OptionKind::Bool,
                OptionValue::Bool(true),
            ).non_fingerprintable())
    }

    fn key(scope: &str, name: &str) -> (String, String) {
        (scope.to_owned(), name.to_owned())
    }

    #[test]
    fn defaults_apply_when_nothing_overrides_them() {
        let parser = OptionsParser::new(RawSources::default());
        let resolved = parser.resolve(Scope::named("black"), &schema()).unwrap();
        assert_eq!(resolved.get("args"), Some(&OptionValue::List(vec![])));
    }

    #[test]
    fn cli_beats_env_beats_config() {
        let mut sources = RawSources::default();
        sources
            .config_layers
            .push(BTreeMap::from([(key("black", "args"), "from-config".to_string())]));
        sources.env.insert(key("black", "args"), "from-env".to_string());
        sources.cli.insert(key("black", "args"), "from-cli".to_string());

        let parser = OptionsParser::new(sources);
        let resolved = parser.resolve(Scope::named("black"), &schema()).unwrap();
        assert_eq!(
            resolved.get("args"),
            Some(&OptionValue::List(vec!["from-cli".to_string()]))
        );
    }

    #[test]
    fn unrecognized_option_is_fatal() {
        let mut sources = RawSources::default();
        sources.cli.insert(key("black", "bogus"), "x".to_string());
        let parser = OptionsParser::new(sources);
        let err = parser.resolve(Scope::named("black"), &schema()).unwrap_err();
        assert_eq!(
            err,
            OptionsError::Unrecognized {
                scope: "black".to_string(),
                name: "bogus".to_string()
            }
        );
    }

    #[test]
    fn changing_a_fingerprintable_option_changes_the_fingerprint() {
        let parser_a = OptionsParser::new(RawSources::default());
        let base = parser_a.resolve(Scope::named("black"), &schema()).unwrap();

        let mut sources = RawSources::default();
        sources.cli.insert(key("black", "args"), "-l=120".to_string());
        let parser_b = OptionsParser::new(sources);
        let changed = parser_b.resolve(Scope::named("black"), &schema()).unwrap();

        assert_ne!(base.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn changing_a_non_fingerprintable_option_does_not_change_the_fingerprint() {
        let parser_a = OptionsParser::new(RawSources::default());
        let base = parser_a.resolve(Scope::named("black"), &schema()).unwrap();

        let mut sources = RawSources::default();
        sources.cli.insert(key("black", "colors"), "false".to_string());
        let parser_b = OptionsParser::new(sources);
        let changed = parser_b.resolve(Scope::named("black"), &schema()).unwrap();

        assert_eq!(base.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn removed_option_is_fatal_when_supplied() {
        let schema = ScopeSchema::new().register(
            OptionDef::new("legacy_flag", OptionKind::Bool, OptionValue::Bool(false))
                .removed("use --new-flag instead"),
        );
        let mut sources = RawSources::default();
        sources.cli.insert(key("black", "legacy_flag"), "true".to_string());
        let parser = OptionsParser::new(sources);
        assert!(matches!(
            parser.resolve(Scope::named("black"), &schema),
            Err(OptionsError::Removed { .. })
        ));
    }
}
