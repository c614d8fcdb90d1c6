// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The external interface: argument parsing, goal dispatch, exit codes. Builds one `Core`
//! (shared, process-lifetime state) and one `Session` per invocation, wires the file watcher's
//! invalidation stream and a Ctrl-C handler into that session, and maps the goal's outcome onto
//! the reserved exit codes: `0` success, `1` user error, `2` usage error, `137` cancelled.

mod args;
mod goals;
mod spec;

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use engine::global_options::{self, ExecutionOptions};
use engine::{Core, Rules, Session};
use options::{OptionsParser, RawSources, Scope};
use ui::{ConsoleUI, StragglerLogger};
use watch::{IgnorePatterns, InvalidationWatcher};

use crate::args::Cli;
use crate::goals::GoalOutcome;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USER_ERROR: i32 = 1;
const EXIT_USAGE_ERROR: i32 = 2;
const EXIT_CANCELLED: i32 = 137;

fn main() {
    let cli = Cli::parse();
    let exit_code = run(cli);
    std::process::exit(exit_code);
}

/// Not `#[tokio::main]` directly: `run` needs to build its own owned runtime so it can shut it
/// down deliberately (draining tail tasks) before `main` calls `std::process::exit`, which would
/// otherwise skip async cleanup entirely.
fn run(cli: Cli) -> i32 {
    let level = match logging::parse_level(&cli.level) {
        Ok(level) => level,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_USAGE_ERROR;
        }
    };
    logging::init(level);

    let executor = match task_executor::Executor::new_owned(num_cpus::get(), num_cpus::get() * 4) {
        Ok(executor) => executor,
        Err(message) => {
            eprintln!("failed to start the task runtime: {message}");
            return EXIT_USAGE_ERROR;
        }
    };

    let code = executor.block_on(run_async(cli));
    executor.shutdown(Duration::from_secs(5));
    code
}

async fn run_async(cli: Cli) -> i32 {
    if cli.goal == "help" {
        Cli::command().print_long_help().ok();
        println!();
        return EXIT_SUCCESS;
    }

    let build_root = match cli.build_root.clone() {
        Some(root) => root,
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(e) => {
                eprintln!("failed to determine the current directory: {e}");
                return EXIT_USAGE_ERROR;
            }
        },
    };

    let options = match resolve_options(&cli, build_root.clone()) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_USAGE_ERROR;
        }
    };

    let watcher = if cli.no_watch {
        None
    } else {
        match InvalidationWatcher::new(IgnorePatterns::default()) {
            Ok(watcher) => {
                if let Err(e) = watcher.watch(&build_root) {
                    log::warn!("failed to watch {}: {e}", build_root.display());
                }
                Some(watcher)
            }
            Err(e) => {
                log::warn!("failed to start the file watcher, invalidation will be start-of-process only: {e}");
                None
            }
        }
    };

    let mut rules = Rules::new();
    engine::intrinsics::register(&mut rules);
    let root_products = vec![engine::intrinsics::type_snapshot()];
    let root_param_types = engine::intrinsics::root_param_types();

    let core = match Core::new(rules, &root_products, root_param_types, options, watcher) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            eprintln!("failed to initialize the engine core: {e}");
            return EXIT_USER_ERROR;
        }
    };

    let session = Session::new(core.clone());
    session.drain_and_invalidate();

    let cancel_session = session.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("received interrupt, cancelling in-flight work");
            cancel_session.cancel();
        }
    });

    let (ui_stop_tx, mut ui_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let ui_dynamic_ui = core.options.dynamic_ui && std::io::stdout().is_terminal();
    let ui_workunits = core.workunit_store.clone();
    let ui_task = tokio::spawn(async move {
        let console = ConsoleUI::new(ui_workunits.clone());
        let stragglers = StragglerLogger::new(ui_workunits);
        let mut interval = tokio::time::interval(ui::render_interval());
        loop {
            tokio::select! {
                _ = &mut ui_stop_rx => break,
                _ = interval.tick() => {
                    if ui_dynamic_ui {
                        console.render();
                    } else {
                        stragglers.log_stragglers();
                    }
                }
            }
        }
        console.teardown();
    });

    let outcome = match cli.goal.as_str() {
        "export" => goals::export(&cli.specs, &core, &session).await,
        "generate-lockfiles" => goals::generate_lockfiles(),
        "dependees" => goals::dependees(&cli.specs),
        other => GoalOutcome::UserError(format!(
            "goal `{other}` is not recognized by the core; it must be registered by a backend, and no \
             backends are loaded in this build"
        )),
    };

    let _ = ui_stop_tx.send(());
    let _ = ui_task.await;
    signal_task.abort();
    session.finish();

    if session.is_cancelled() {
        eprintln!("cancelled");
        return EXIT_CANCELLED;
    }

    match outcome {
        GoalOutcome::Success(message) => {
            if let Some(message) = message {
                println!("{message}");
            }
            EXIT_SUCCESS
        }
        GoalOutcome::UserError(message) => {
            eprintln!("{message}");
            EXIT_USER_ERROR
        }
    }
}

/// Builds the GLOBAL scope's effective options from CLI flags, the process environment, and any
/// `--config` layers, in that resolution order, then types them into `ExecutionOptions`.
fn resolve_options(cli: &Cli, build_root: PathBuf) -> Result<ExecutionOptions, String> {
    let mut cli_values: BTreeMap<(String, String), String> = BTreeMap::new();
    let global = |name: &str| ("GLOBAL".to_string(), name.to_string());

    if let Some(dir) = &cli.local_store_dir {
        cli_values.insert(global("local-store-dir"), dir.clone());
    }
    if let Some(dir) = &cli.named_caches_dir {
        cli_values.insert(global("named-caches-dir"), dir.clone());
    }
    if let Some(n) = cli.local_parallelism {
        cli_values.insert(global("process-execution-local-parallelism"), n.to_string());
    }
    if let Some(n) = cli.process_cache_memory_max {
        cli_values.insert(global("process-execution-cache-memory-max"), n.to_string());
    }
    if cli.remote_execution {
        cli_values.insert(global("remote-execution"), "true".to_string());
    }
    if cli.keep_going {
        cli_values.insert(global("keep-going"), "true".to_string());
    }
    if cli.no_dynamic_ui {
        cli_values.insert(global("dynamic-ui"), "false".to_string());
    }

    let env_layer = options::env::parse_layer(std::env::vars(), &[Scope::Global]);

    let mut config_layers = Vec::with_capacity(cli.config.len());
    for path in &cli.config {
        let layer = options::config::load_layer(path).map_err(|e| e.to_string())?;
        config_layers.push(layer);
    }

    let sources = RawSources {
        cli: cli_values,
        env: env_layer,
        config_layers,
    };
    let parser = OptionsParser::new(sources);
    let values = parser
        .resolve(Scope::Global, &global_options::schema())
        .map_err(|e| e.to_string())?;
    ExecutionOptions::from_scope_values(build_root, &values)
}
