// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `Core` is the long-lived state shared (via `Arc`) by every `Session` that runs against this
//! process: the content store, the memoizing graph, the solved rule dispatch table, the task
//! executor, and the layered process-execution strategy. A `Session` borrows `Core` for the
//! duration of one invocation; nothing here is reset between invocations except by explicit
//! invalidation.

use std::path::PathBuf;
use std::sync::Arc;

use process_execution::{KeepSandboxes, NamedCaches, ProcessExecutionStrategy};
use rule_graph::{GraphMaker, RuleGraph, TypeId};

use crate::global_options::ExecutionOptions;
use crate::node::NodeKey;
use crate::rules::Rules;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("failed to solve the rule graph:\n{}", .0.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n"))]
    RuleGraph(Vec<rule_graph::Diagnostic>),
    #[error("{0}")]
    Io(String),
}

pub struct Core {
    pub build_root: PathBuf,
    pub store: store::Store,
    pub graph: Arc<graph::Graph<NodeKey>>,
    pub rule_graph: RuleGraph,
    pub rules: Rules,
    pub executor: task_executor::Executor,
    pub workunit_store: workunit_store::WorkunitStore,
    pub command_runner: Arc<dyn process_execution::CommandRunner>,
    pub named_caches: NamedCaches,
    pub watcher: Option<Arc<watch::InvalidationWatcher>>,
    pub options: ExecutionOptions,
    /// Shared by the `DownloadFile` intrinsic; a plain `reqwest::Client` rather
    /// than anything store-specific, since the file being downloaded is not yet content-addressed
    /// until its digest has been verified.
    pub http_client: reqwest::Client,
}

impl Core {
    /// Builds the shared engine state: solves the rule graph over every product any registered
    /// rule or intrinsic could be asked to produce, then assembles the layered process-execution
    /// stack -- local sandboxing wrapped in a concurrency bound, further wrapped in process-result
    /// caching (checked first regardless of strategy), with the remote strategy (when requested)
    /// substituting for local execution underneath that same cache.
    pub fn new(
        rules: Rules,
        root_products: &[TypeId],
        root_param_types: Vec<TypeId>,
        options: ExecutionOptions,
        watcher: Option<Arc<watch::InvalidationWatcher>>,
    ) -> Result<Core, CoreError> {
        let rule_decls = rules.rule_declarations();
        let intrinsic_decls = rules.intrinsic_declarations();
        let maker = GraphMaker::new(&rule_decls, &intrinsic_decls, root_param_types);
        let rule_graph = maker
            .full_graph(root_products)
            .map_err(CoreError::RuleGraph)?;

        let store = store::Store::local_only(&options.local_store_dir)
            .map_err(|e| CoreError::Io(e.to_string()))?;

        let executor = task_executor::Executor::new();
        let workunit_store = workunit_store::WorkunitStore::new();

        let named_caches =
            NamedCaches::new(options.named_caches_dir.clone()).map_err(|e| CoreError::Io(e.to_string()))?;

        let sandbox_base = options.build_root.join(".pants.d").join("process-execution");
        let local_runner = process_execution::local::CommandRunner::new(
            store.clone(),
            sandbox_base,
            named_caches.clone(),
            KeepSandboxes::OnFailure,
        )
        .map_err(|e| CoreError::Io(e.to_string()))?;

        let bounded: Arc<dyn process_execution::CommandRunner> = Arc::new(
            process_execution::bounded::CommandRunner::new(Arc::new(local_runner), options.local_parallelism.max(1)),
        );

        let strategy: Arc<dyn process_execution::CommandRunner> = if options.remote_execution {
            Arc::new(process_execution::remote::CommandRunner::new(
                bounded,
                Arc::new(process_execution::remote::FakeActionCache::new()),
            ))
        } else {
            bounded
        };

        let process_cache = cache::ProcessCache::new(
            options.local_store_dir.join("process-cache"),
            options.process_cache_memory_max,
        )
        .map_err(|e| CoreError::Io(e.to_string()))?;
        let command_runner: Arc<dyn process_execution::CommandRunner> =
            Arc::new(process_execution::cached::CommandRunner::new(strategy, process_cache));

        let _ = ProcessExecutionStrategy::Local;

        Ok(Core {
            build_root: options.build_root.clone(),
            store,
            graph: Arc::new(graph::Graph::new()),
            rule_graph,
            rules,
            executor,
            workunit_store,
            command_runner,
            named_caches,
            watcher,
            options,
            http_client: reqwest::Client::new(),
        })
    }
}
