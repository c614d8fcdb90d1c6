// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Translates a goal's root product requests into `NodeKey`s and drives them to completion
//! against the shared graph, applying the `--keep-going` propagation policy.

use std::sync::Arc;

use rule_graph::TypeId;

use crate::core::Core;
use crate::node::{failure_to_node_error, ExecutionContext, NodeError, NodeKey};
use crate::session::Session;
use crate::value::{Params, Value};

/// One root request's outcome: which product/params it was for, and what it resolved to.
pub struct RootResult {
    pub node: NodeKey,
    pub result: Result<Value, NodeError>,
}

pub struct Scheduler {
    core: Arc<Core>,
}

impl Scheduler {
    pub fn new(core: Arc<Core>) -> Scheduler {
        Scheduler { core }
    }

    /// Runs every `(product, params)` root concurrently to completion. Under `keep_going = false`
    /// (the default), the first deterministic failure cancels the session, so every other
    /// still-running root observes `NodeError::Cancelled` rather than continuing to do work whose
    /// result will be discarded; under `keep_going = true`, every root runs through regardless of
    /// its siblings' outcomes and the caller sees every failure.
    pub async fn execute(&self, session: &Session, roots: Vec<(TypeId, Params)>) -> Vec<RootResult> {
        let keep_going = self.core.options.keep_going;
        let graph = self.core.graph.clone();

        let runs = roots.into_iter().map(|(product, params)| {
            let node = NodeKey::new(product, params);
            let context = ExecutionContext::root(self.core.clone(), session.clone());
            let graph = graph.clone();
            let session = session.clone();
            let node_for_request = node.clone();
            async move {
                let result = graph
                    .request(node_for_request, context, Arc::new(Vec::new()))
                    .await
                    .map_err(failure_to_node_error);
                if !keep_going {
                    if let Err(ref e) = result {
                        if graph::NodeError::is_deterministic(e) {
                            session.cancel();
                        }
                    }
                }
                RootResult { node, result }
            }
        });

        futures::future::join_all(runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_options::ExecutionOptions;
    use crate::rules::Rules;
    use futures::future::FutureExt;
    use rule_graph::Get;
    use std::path::PathBuf;

    fn string_type() -> TypeId {
        TypeId("String")
    }
    fn upper_type() -> TypeId {
        TypeId("Upper")
    }

    fn test_core(keep_going: bool) -> Arc<Core> {
        let mut rules = Rules::new();
        rules.add_rule(
            "upper",
            upper_type(),
            vec![string_type()],
            vec![],
            |params, _ctx| {
                async move {
                    let s = params.get(string_type()).unwrap().expect::<String>();
                    Ok(Value::new(upper_type(), s.to_uppercase()))
                }
                .boxed()
            },
        );
        let _ = Get { product: upper_type(), input: string_type() };

        let options = ExecutionOptions {
            build_root: PathBuf::from("/tmp"),
            local_store_dir: PathBuf::from("/tmp/.store-scheduler-test"),
            named_caches_dir: PathBuf::from("/tmp/.caches-scheduler-test"),
            local_parallelism: 1,
            process_cache_memory_max: 16,
            remote_execution: false,
            keep_going,
            dynamic_ui: false,
        };
        Arc::new(Core::new(rules, &[upper_type()], vec![string_type()], options, None).unwrap())
    }

    #[tokio::test]
    async fn runs_every_root_concurrently_and_reports_keep_going_failures() {
        let core = test_core(true);
        let scheduler = Scheduler::new(core.clone());
        let session = Session::new(core);

        let roots = vec![(upper_type(), Params::new(vec![(string_type(), Value::new(string_type(), "hi".to_string()))]))];
        let results = scheduler.execute(&session, roots).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].result.is_ok());
    }
}
