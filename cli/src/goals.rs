// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The core-reserved goals: `help`, `export`, `generate-lockfiles`, `dependees`. Everything else
//! is a backend goal (`test`, `lint`, `fmt`, `run`, `package`, `check`, ...) and this binary loads
//! no backends, so dispatching to one is always a clean user-facing error rather than a panic.

use std::sync::Arc;

use engine::{Core, Params, Scheduler, Session, Value};
use fs::{GlobMatchErrorBehavior, PathGlobs};

use crate::spec::TargetSpec;

/// A goal's outcome, independent of the process exit code computed from it in `main` (which
/// also accounts for session cancellation).
pub enum GoalOutcome {
    Success(Option<String>),
    UserError(String),
}

/// Splits raw target specs into file addresses the core can resolve on its own (via the
/// `PathGlobs -> Snapshot` intrinsic) and address-style specs that need a target graph a backend
/// would supply. Returns an error message naming the address-style specs if any are present,
/// since no goal in this core can do anything useful with them.
fn partition_file_specs(raw_specs: &[String]) -> Result<Vec<(String, bool)>, String> {
    let mut files = Vec::new();
    let mut needs_backend = Vec::new();
    for raw in raw_specs {
        let (spec, excluded) = TargetSpec::parse(raw).map_err(|e| format!("invalid target spec `{raw}`: {e}"))?;
        match spec.as_file_glob() {
            Some(path) => files.push((path, excluded)),
            None => needs_backend.push(spec.to_string()),
        }
    }
    if !needs_backend.is_empty() {
        return Err(format!(
            "resolving {} against a target graph requires a backend that supplies one (BUILD-file parsing, \
             dependency inference, ...); no backend is registered in this build. Only file-address specs \
             (`path/to/file.ext`) can be captured directly by the core.",
            needs_backend.join(", ")
        ));
    }
    Ok(files)
}

/// `export`, core-reserved: captures a `Snapshot` of each named file through the graph engine
/// and prints its content digest -- the core-only analogue of a full IDE/BSP artifact export,
/// since emitting IDE-consumable artifacts from a target graph is a backend concern.
pub async fn export(raw_specs: &[String], core: &Arc<Core>, session: &Session) -> GoalOutcome {
    let files = match partition_file_specs(raw_specs) {
        Ok(files) => files,
        Err(message) => return GoalOutcome::UserError(message),
    };
    let includes: Vec<String> = files
        .into_iter()
        .filter(|(_, excluded)| !excluded)
        .map(|(path, _)| path)
        .collect();
    if includes.is_empty() {
        return GoalOutcome::UserError("export requires at least one file target spec".to_string());
    }

    let snapshot_product = engine::intrinsics::type_snapshot();
    let globs_type = engine::intrinsics::type_path_globs();
    let roots = includes
        .iter()
        .map(|path| {
            let mut globs = PathGlobs::new(vec![path.clone()]);
            globs.missing = GlobMatchErrorBehavior::Error;
            let params = Params::new(vec![(globs_type, Value::new(globs_type, globs))]);
            (snapshot_product, params)
        })
        .collect();

    let scheduler = Scheduler::new(core.clone());
    let results = scheduler.execute(session, roots).await;

    let mut failures = Vec::new();
    let mut lines = Vec::new();
    for (path, root) in includes.iter().zip(results.into_iter()) {
        match root.result {
            Ok(value) => {
                let snapshot = value.expect::<store::Snapshot>();
                lines.push(format!("{path}: {} ({} file(s))", snapshot.digest, snapshot.paths.len()));
            }
            Err(e) => failures.push(format!("{path}: {e}")),
        }
    }

    if failures.is_empty() {
        GoalOutcome::Success(Some(lines.join("\n")))
    } else {
        let mut message = failures.join("\n");
        if !lines.is_empty() {
            message = format!("{}\n\nsucceeded before the failure:\n{}", message, lines.join("\n"));
        }
        GoalOutcome::UserError(message)
    }
}

/// `generate-lockfiles`, core-reserved. The core treats a resolve's lockfile digest as the sole
/// fingerprint input for a process cache key; generating one is itself the business of a
/// per-language backend that knows how to invoke a resolver. With none registered, there is
/// nothing to do.
pub fn generate_lockfiles() -> GoalOutcome {
    GoalOutcome::Success(Some(
        "no resolves are configured; lockfile generation is provided by language backends, none of which \
         are registered in this build"
            .to_string(),
    ))
}

/// `dependees`, core-reserved: reports which targets depend on the given specs. This
/// fundamentally requires a target graph and a backend's dependency-inference rules, which this
/// core never loads, so it is always a clean user error here rather than a partial answer.
pub fn dependees(raw_specs: &[String]) -> GoalOutcome {
    for raw in raw_specs {
        if let Err(e) = TargetSpec::parse(raw) {
            return GoalOutcome::UserError(format!("invalid target spec `{raw}`: {e}"));
        }
    }
    GoalOutcome::UserError(
        "dependees requires a target graph and dependency-inference rules, both supplied by a backend; \
         no backend is registered in this build"
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_separates_file_and_address_specs() {
        let files = partition_file_specs(&["a/b.py".to_string()]).unwrap();
        assert_eq!(files, vec![("a/b.py".to_string(), false)]);

        let err = partition_file_specs(&["a/b:lib".to_string()]).unwrap_err();
        assert!(err.contains("a/b:lib"));
    }

    #[test]
    fn dependees_always_requires_a_backend() {
        match dependees(&["a/b.py".to_string()]) {
            GoalOutcome::UserError(message) => assert!(message.contains("backend")),
            GoalOutcome::Success(_) => panic!("dependees has no core-only implementation"),
        }
    }

    #[test]
    fn dependees_surfaces_a_parse_error_before_the_backend_error() {
        match dependees(&["".to_string()]) {
            GoalOutcome::UserError(message) => assert!(message.contains("invalid target spec")),
            GoalOutcome::Success(_) => panic!("empty spec should not parse"),
        }
    }
}
