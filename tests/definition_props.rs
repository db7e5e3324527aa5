//! Structural properties of graphs built from arbitrary verb sequences.

use forkflow::{Definition, Graph, NodeId, StepType, Transition};
use proptest::prelude::*;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
enum Verb {
    Chain(usize),
    Divide(Vec<usize>),
    DivideWith(Vec<usize>, usize),
    Combine(usize),
    Expand(usize),
    Collapse(usize),
}

const NAMES: [&str; 4] = ["Alpha", "Beta", "Gamma", "Delta"];

fn named(index: usize) -> StepType {
    StepType::named(NAMES[index % NAMES.len()])
}

fn verb() -> impl Strategy<Value = Verb> {
    let name = 0..NAMES.len();
    prop_oneof![
        name.clone().prop_map(Verb::Chain),
        prop::collection::vec(name.clone(), 1..4).prop_map(Verb::Divide),
        (prop::collection::vec(name.clone(), 1..4), name.clone())
            .prop_map(|(to, extra)| Verb::DivideWith(to, extra)),
        name.clone().prop_map(Verb::Combine),
        name.clone().prop_map(Verb::Expand),
        name.prop_map(Verb::Collapse),
    ]
}

/// Apply each verb, skipping those the builder rejects in the current state.
fn build(start: usize, verbs: &[Verb]) -> Graph {
    let mut definition = Definition::new().start(named(start)).unwrap();
    for verb in verbs {
        let attempt = definition.clone();
        let next = match verb {
            Verb::Chain(n) => attempt.chain(named(*n)),
            Verb::Divide(to) => {
                let to: Vec<StepType> = to.iter().copied().map(named).collect();
                attempt.divide(&to)
            }
            Verb::DivideWith(to, extra) => {
                let to: Vec<StepType> = to.iter().copied().map(named).collect();
                attempt.divide_with(&to, |branches| {
                    branches.chain(0, named(*extra))?;
                    Ok(())
                })
            }
            Verb::Combine(n) => attempt.combine(named(*n)),
            Verb::Expand(n) => attempt.expand(named(*n)),
            Verb::Collapse(n) => attempt.collapse(named(*n)),
        };
        if let Ok(next) = next {
            definition = next;
        }
    }
    definition.complete().unwrap()
}

fn reachable(graph: &Graph, from: &NodeId) -> HashSet<NodeId> {
    let mut seen = HashSet::from([from.clone()]);
    let mut queue = VecDeque::from([from.clone()]);
    while let Some(id) = queue.pop_front() {
        for next in &graph.edges[&id].to {
            if seen.insert(next.clone()) {
                queue.push_back(next.clone());
            }
        }
    }
    seen
}

proptest! {
    #[test]
    fn built_graphs_are_well_formed(
        start in 0..NAMES.len(),
        verbs in prop::collection::vec(verb(), 0..12),
    ) {
        let graph = build(start, &verbs);
        prop_assert!(graph.validate().is_ok());

        let starts: Vec<_> = graph
            .edges
            .values()
            .filter(|n| n.transition == Transition::Start)
            .collect();
        prop_assert_eq!(starts.len(), 1);

        let (start_id, _) = graph.start().unwrap();
        prop_assert_eq!(start_id.stage(), 0);
        prop_assert_eq!(reachable(&graph, start_id).len(), graph.nodes.len());
        prop_assert_eq!(graph.nodes.len(), graph.edges.len());
    }

    #[test]
    fn edges_always_move_to_later_stages(
        start in 0..NAMES.len(),
        verbs in prop::collection::vec(verb(), 0..12),
    ) {
        let graph = build(start, &verbs);
        for (id, node) in &graph.edges {
            for next in &node.to {
                prop_assert!(next.stage() > id.stage(), "{} -> {}", id, next);
            }
            prop_assert_eq!(node.step_type.as_str(), id.as_str().split('.').next().unwrap());
        }
    }

    #[test]
    fn join_cohorts_point_back_at_their_sources(
        start in 0..NAMES.len(),
        verbs in prop::collection::vec(verb(), 0..12),
    ) {
        let graph = build(start, &verbs);
        for (id, node) in &graph.edges {
            if matches!(node.transition, Transition::Combine | Transition::Collapse) {
                prop_assert!(!node.from.is_empty());
                for source in &node.from {
                    prop_assert!(graph.edges[source].to.contains(id));
                }
            }
        }
    }

    #[test]
    fn encoding_is_stable(
        start in 0..NAMES.len(),
        verbs in prop::collection::vec(verb(), 0..12),
    ) {
        let graph = build(start, &verbs);
        let decoded = Graph::from_json(&graph.to_json().unwrap()).unwrap();
        prop_assert_eq!(graph.hash().unwrap(), decoded.hash().unwrap());
        prop_assert_eq!(graph, decoded);
    }
}
