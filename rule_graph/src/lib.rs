// Copyright 2017 Monorepo Build Engine Contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! At startup, accepts rule declarations from backends and checks that every declared
//! `get(output_type, input_type)` edge is satisfiable by exactly one other rule or intrinsic. The
//! solver runs once per process; a request against an unsolved or ambiguous edge is a bug caught
//! here rather than a runtime surprise in the graph engine.
//!
//! Tagged-variant dispatch: types are identified by a `TypeId` name rather than by reflecting on
//! a runtime value, so the whole registry is a plain, inspectable map the solver can run over
//! exhaustively.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

/// A product or input type, identified by name. Equality and hashing are by name: two `TypeId`s
/// naming the same Rust type from different call sites are the same node in the rule graph.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct TypeId(pub &'static str);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sub-request a rule body may issue during its execution. Resolving a `Get` picks exactly one
/// producer whose output matches `product` and whose own declared inputs are satisfied by
/// `input` alone -- matching the common "single input subject" shape of a `Get(Output, Input)`
/// call.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Get {
    pub product: TypeId,
    pub input: TypeId,
}

/// A declaratively registered rule: `(output_type, input_types[], gets[], body_id)`.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: &'static str,
    pub output: TypeId,
    pub inputs: Vec<TypeId>,
    pub gets: Vec<Get>,
}

/// A native graph node registered the same way a `Rule` is, minus a body to solve
/// recursively: intrinsics terminate the solver's recursion.
#[derive(Clone, Debug)]
pub struct Intrinsic {
    pub id: &'static str,
    pub output: TypeId,
    pub inputs: Vec<TypeId>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProducerId<'r> {
    Rule(&'r str),
    Intrinsic(&'r str),
}

impl fmt::Display for ProducerId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerId::Rule(id) => write!(f, "rule {id}"),
            ProducerId::Intrinsic(id) => write!(f, "intrinsic {id}"),
        }
    }
}

trait Producer {
    fn id(&self) -> &'static str;
    fn output(&self) -> TypeId;
    fn inputs(&self) -> &[TypeId];
}

impl Producer for Rule {
    fn id(&self) -> &'static str {
        self.id
    }
    fn output(&self) -> TypeId {
        self.output
    }
    fn inputs(&self) -> &[TypeId] {
        &self.inputs
    }
}

impl Producer for Intrinsic {
    fn id(&self) -> &'static str {
        self.id
    }
    fn output(&self) -> TypeId {
        self.output
    }
    fn inputs(&self) -> &[TypeId] {
        &self.inputs
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    pub output: TypeId,
    pub available_params: Vec<TypeId>,
    pub reason: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no rule produces {} from params {:?}: {}",
            self.output, self.available_params, self.reason
        )
    }
}

/// The solved, static dispatch table: for every product reached from a root request, the set of
/// `(required_inputs, producer)` entries that can produce it, keyed by the minimal params each
/// producer itself declared rather than by whatever superset of params happened to be in scope at
/// the point the solver reached it. A lookup is therefore a subset test -- `required_inputs ⊆
/// available_params` -- which lets a root request carry only the params its own producer actually
/// needs instead of the full declared `root_param_types` union.
#[derive(Debug, Default)]
pub struct RuleGraph {
    edges: HashMap<TypeId, Vec<(Vec<TypeId>, &'static str)>>,
    producer_kind: HashMap<&'static str, bool>, // true == intrinsic
}

impl RuleGraph {
    /// Returns the id of whatever produces `output` given `available_params`, if the graph was
    /// able to solve that edge. `available_params` only needs to be a superset of the producer's
    /// own declared inputs, not an exact match.
    pub fn producer_for(&self, output: TypeId, available_params: &[TypeId]) -> Option<ProducerId<'_>> {
        let mut sorted = available_params.to_vec();
        sorted.sort();
        sorted.dedup();
        let candidates = self.edges.get(&output)?;
        let id = candidates
            .iter()
            .find(|(required, _)| required.iter().all(|t| sorted.contains(t)))
            .map(|(_, id)| *id)?;
        Some(if self.producer_kind[id] {
            ProducerId::Intrinsic(id)
        } else {
            ProducerId::Rule(id)
        })
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

/// Builds a [`RuleGraph`] from a fixed set of rules and intrinsics. The solver is run once per
/// process at startup (`full_graph`), not per request.
pub struct GraphMaker<'r> {
    rules_by_output: HashMap<TypeId, Vec<&'r Rule>>,
    intrinsics_by_output: HashMap<TypeId, Vec<&'r Intrinsic>>,
    root_param_types: BTreeSet<TypeId>,
}

enum Candidate<'r> {
    Rule(&'r Rule),
    Intrinsic(&'r Intrinsic),
}

impl<'r> Candidate<'r> {
    fn id(&self) -> &'static str {
        match self {
            Candidate::Rule(r) => r.id,
            Candidate::Intrinsic(i) => i.id,
        }
    }

    fn is_intrinsic(&self) -> bool {
        matches!(self, Candidate::Intrinsic(_))
    }

    fn gets(&self) -> &[Get] {
        match self {
            Candidate::Rule(r) => &r.gets,
            Candidate::Intrinsic(_) => &[],
        }
    }
}

impl<'r> GraphMaker<'r> {
    pub fn new(rules: &'r [Rule], intrinsics: &'r [Intrinsic], root_param_types: Vec<TypeId>) -> GraphMaker<'r> {
        let mut rules_by_output: HashMap<TypeId, Vec<&Rule>> = HashMap::new();
        for rule in rules {
            rules_by_output.entry(rule.output).or_default().push(rule);
        }
        let mut intrinsics_by_output: HashMap<TypeId, Vec<&Intrinsic>> = HashMap::new();
        for intrinsic in intrinsics {
            intrinsics_by_output.entry(intrinsic.output).or_default().push(intrinsic);
        }
        GraphMaker {
            rules_by_output,
            intrinsics_by_output,
            root_param_types: root_param_types.into_iter().collect(),
        }
    }

    /// Solves for every `root_products` entry reachable from the declared root param types,
    /// recursively resolving each producer's own `gets`. Returns every diagnostic encountered,
    /// with a readable message for any edge whose producer count isn't exactly one, rather than
    /// stopping at the first one, so a backend author sees every unsatisfiable edge in a single
    /// run.
    pub fn full_graph(&self, root_products: &[TypeId]) -> Result<RuleGraph, Vec<Diagnostic>> {
        let mut graph = RuleGraph::default();
        let mut diagnostics = Vec::new();
        let mut visited: std::collections::HashSet<(TypeId, Vec<TypeId>)> = std::collections::HashSet::new();
        let mut queue: VecDeque<(TypeId, Vec<TypeId>)> = VecDeque::new();

        let root_params: Vec<TypeId> = self.root_param_types.iter().copied().collect();
        for &product in root_products {
            queue.push_back((product, root_params.clone()));
        }

        while let Some((output, available)) = queue.pop_front() {
            let mut sorted_available = available.clone();
            sorted_available.sort();
            sorted_available.dedup();
            let key = (output, sorted_available.clone());
            if !visited.insert(key.clone()) {
                continue;
            }

            let candidates = self.candidates_for(output, &sorted_available);
            match candidates.len() {
                1 => {
                    let chosen = &candidates[0];
                    let mut required = chosen.inputs().to_vec();
                    required.sort();
                    required.dedup();
                    let entries = graph.edges.entry(output).or_default();
                    if !entries.iter().any(|(r, id)| *r == required && *id == chosen.id()) {
                        entries.push((required, chosen.id()));
                    }
                    graph.producer_kind.insert(chosen.id(), chosen.is_intrinsic());
                    for get in chosen.gets() {
                        queue.push_back((get.product, vec![get.input]));
                    }
                }
                0 => diagnostics.push(Diagnostic {
                    output,
                    available_params: sorted_available,
                    reason: "no rule or intrinsic produces this type from these params".to_string(),
                }),
                n => diagnostics.push(Diagnostic {
                    output,
                    available_params: sorted_available,
                    reason: format!("ambiguous: {n} candidates can produce this type"),
                }),
            }
        }

        if diagnostics.is_empty() {
            Ok(graph)
        } else {
            Err(diagnostics)
        }
    }

    fn candidates_for(&self, output: TypeId, available: &[TypeId]) -> Vec<Candidate<'r>> {
        let mut candidates = Vec::new();
        if let Some(rules) = self.rules_by_output.get(&output) {
            for rule in rules {
                if rule.inputs.iter().all(|i| available.contains(i)) {
                    candidates.push(Candidate::Rule(rule));
                }
            }
        }
        if let Some(intrinsics) = self.intrinsics_by_output.get(&output) {
            for intrinsic in intrinsics {
                if intrinsic.inputs.iter().all(|i| available.contains(i)) {
                    candidates.push(Candidate::Intrinsic(intrinsic));
                }
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: TypeId = TypeId("Subject");
    const SOURCES: TypeId = TypeId("Sources");
    const COMPILED: TypeId = TypeId("Compiled");
    const FORMATTED: TypeId = TypeId("Formatted");

    fn rule(id: &'static str, output: TypeId, inputs: Vec<TypeId>, gets: Vec<Get>) -> Rule {
        Rule { id, output, inputs, gets }
    }

    #[test]
    fn solves_a_simple_chain() {
        let rules = vec![
            rule("compile", COMPILED, vec![], vec![Get { product: SOURCES, input: SUBJECT }]),
            rule("read_sources", SOURCES, vec![SUBJECT], vec![]),
        ];
        let maker = GraphMaker::new(&rules, &[], vec![SUBJECT]);
        let graph = maker.full_graph(&[COMPILED]).unwrap();
        assert!(matches!(
            graph.producer_for(COMPILED, &[SUBJECT]),
            Some(ProducerId::Rule("compile"))
        ));
        assert!(matches!(
            graph.producer_for(SOURCES, &[SUBJECT]),
            Some(ProducerId::Rule("read_sources"))
        ));
    }

    #[test]
    fn intrinsics_satisfy_gets_like_rules() {
        let rules = vec![rule("format", FORMATTED, vec![], vec![Get { product: SOURCES, input: SUBJECT }])];
        let intrinsics = vec![Intrinsic {
            id: "read_file",
            output: SOURCES,
            inputs: vec![SUBJECT],
        }];
        let maker = GraphMaker::new(&rules, &intrinsics, vec![SUBJECT]);
        let graph = maker.full_graph(&[FORMATTED]).unwrap();
        assert!(matches!(
            graph.producer_for(SOURCES, &[SUBJECT]),
            Some(ProducerId::Intrinsic("read_file"))
        ));
    }

    #[test]
    fn ambiguous_producers_are_reported() {
        let rules = vec![
            rule("a", SOURCES, vec![SUBJECT], vec![]),
            rule("b", SOURCES, vec![SUBJECT], vec![]),
            rule("needs_sources", COMPILED, vec![], vec![Get { product: SOURCES, input: SUBJECT }]),
        ];
        let maker = GraphMaker::new(&rules, &[], vec![SUBJECT]);
        let diagnostics = maker.full_graph(&[COMPILED]).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].reason.contains("ambiguous"));
    }

    #[test]
    fn missing_producer_is_reported() {
        let rules = vec![rule("needs_sources", COMPILED, vec![], vec![Get { product: SOURCES, input: SUBJECT }])];
        let maker = GraphMaker::new(&rules, &[], vec![SUBJECT]);
        let diagnostics = maker.full_graph(&[COMPILED]).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].output, SOURCES);
    }

    #[test]
    fn root_rule_requiring_an_undeclared_param_is_unfulfillable() {
        let rules = vec![rule("needs_subject", COMPILED, vec![SUBJECT], vec![])];
        let maker = GraphMaker::new(&rules, &[], vec![]);
        let diagnostics = maker.full_graph(&[COMPILED]).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
    }
}
