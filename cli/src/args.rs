// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Argument parsing: `tool [global-options…] GOAL [target-spec…]`. Global options are the
//! GLOBAL scope's recognised settings (`engine::global_options::schema`) surfaced as real flags
//! rather than a generic `--scope-option=value` escape hatch, since the core only ever resolves
//! that one scope itself -- a backend's own scopes are opaque to this binary, so there is
//! nothing here for them to plug into yet.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "engine",
    about = "Monorepo build orchestrator core: graph engine, rule dispatch, content store, sandboxed process execution.",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Root of the workspace this invocation operates against; defaults to the current directory.
    #[arg(long, global = true)]
    pub build_root: Option<PathBuf>,

    /// Log level: error, warn, info, debug, or trace.
    #[arg(long, global = true, default_value = "info")]
    pub level: String,

    /// Where the content store's on-disk state lives, relative to `--build-root`.
    #[arg(long = "local-store-dir", global = true)]
    pub local_store_dir: Option<String>,

    /// Where append-only named caches are mounted from, relative to `--build-root`.
    #[arg(long = "named-caches-dir", global = true)]
    pub named_caches_dir: Option<String>,

    /// Bound on concurrent local process sandboxes.
    #[arg(long = "process-execution-local-parallelism", global = true)]
    pub local_parallelism: Option<i64>,

    /// In-memory ceiling (MiB) for the process-result cache's hot tier.
    #[arg(long = "process-execution-cache-memory-max", global = true)]
    pub process_cache_memory_max: Option<i64>,

    /// Route process execution through the (fake, in-memory) remote execution strategy instead
    /// of the local sandboxer.
    #[arg(long = "remote-execution", global = true)]
    pub remote_execution: bool,

    /// Run every requested root to completion even if one fails, rather than cancelling the rest
    /// on the first deterministic failure.
    #[arg(long = "keep-going", global = true)]
    pub keep_going: bool,

    /// Disable the live progress-bar UI in favor of plain, line-oriented logging.
    #[arg(long = "no-dynamic-ui", global = true)]
    pub no_dynamic_ui: bool,

    /// Disable the filesystem watcher; invalidation then only ever happens at the start of a
    /// fresh process, never mid-session.
    #[arg(long = "no-watch", global = true)]
    pub no_watch: bool,

    /// A TOML config file layer; repeat for several, highest priority first.
    #[arg(long = "config", global = true, action = clap::ArgAction::Append)]
    pub config: Vec<PathBuf>,

    /// The goal to run: one of the core-reserved goals (`help`, `export`, `generate-lockfiles`,
    /// `dependees`), or a backend-registered goal (`test`, `lint`, `fmt`, ...) -- none of which
    /// are loaded in this build, since backends are out of scope for the core.
    pub goal: String,

    /// Target specs: `path/to:name`, `path/to:`, `path/to::`, `path/to/file.ext`, or
    /// `-path/to::` to exclude.
    pub specs: Vec<String>,
}
