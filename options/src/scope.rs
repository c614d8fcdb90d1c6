// Copyright 2021 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

/// A named section of the option system. `Global` is the implicit scope every invocation has
/// regardless of which backends are loaded; everything else (`python`, `black`, `docker`, ...)
/// is a backend-declared scope name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Scope {
    Global,
    Named(String),
}

impl Scope {
    pub fn named(name: &str) -> Scope {
        match name {
            "" | "GLOBAL" | "global" => Scope::Global,
            other => Scope::Named(other.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Scope::Global => "GLOBAL",
            Scope::Named(name) => name.as_str(),
        }
    }

    /// The `SCOPE_OPTION` environment variable prefix for this scope.
    pub fn env_prefix(&self) -> String {
        self.name().to_uppercase().replace('-', "_")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
