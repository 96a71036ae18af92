//! Property tests for dependency ordering.

use proptest::prelude::*;
use resync_core::{EntityGraph, SyncError};
use std::collections::HashMap;

/// Node count plus `(dependent, dependency)` pairs, always pointing from a
/// later node to an earlier one so the graph stays acyclic.
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..12).prop_flat_map(|n| {
        let edges = prop::collection::vec((0..n, 0..n), 0..(n * 2))
            .prop_map(|pairs| {
                pairs
                    .into_iter()
                    .filter(|(a, b)| a != b)
                    .map(|(a, b)| (a.max(b), a.min(b)))
                    .collect::<Vec<_>>()
            });
        (Just(n), edges)
    })
}

fn name(i: usize) -> String {
    format!("e{i}")
}

fn build(n: usize, edges: &[(usize, usize)]) -> EntityGraph<usize> {
    let mut graph = EntityGraph::new();
    for i in 0..n {
        graph.add_node(name(i), i).unwrap();
    }
    for &(child, parent) in edges {
        graph.add_dependency(&name(child), &name(parent)).unwrap();
    }
    graph
}

proptest! {
    #[test]
    fn dependencies_precede_dependents((n, edges) in dag_strategy()) {
        let order = build(n, &edges).into_ordered().unwrap();
        prop_assert_eq!(order.len(), n);

        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
        prop_assert_eq!(position.len(), n);
        for (child, parent) in edges {
            prop_assert!(position[&parent] < position[&child]);
        }
    }

    #[test]
    fn closing_a_path_is_a_cycle((n, edges) in dag_strategy()) {
        let mut graph = build(n, &edges);
        for (child, parent) in edges {
            let err = graph.add_dependency(&name(parent), &name(child)).unwrap_err();
            let is_cycle = matches!(err, SyncError::DependencyCycle { .. });
            prop_assert!(is_cycle);
        }
        prop_assert!(graph.into_ordered().is_ok());
    }

    #[test]
    fn include_keeps_every_ancestor((n, edges) in dag_strategy(), pick in 0usize..12) {
        let graph = build(n, &edges);
        let key = name(pick % n);
        let filtered = graph.filter_to_keys_and_ancestors(&[key.clone()]);

        prop_assert!(filtered.contains(&key));
        for ancestor in graph.ancestors(&key) {
            prop_assert!(filtered.contains(ancestor));
        }
        for node in filtered.nodes() {
            for parent in graph.parents(node.id()) {
                prop_assert!(filtered.contains(parent));
            }
        }
    }

    #[test]
    fn exclude_drops_every_descendant((n, edges) in dag_strategy(), pick in 0usize..12) {
        let graph = build(n, &edges);
        let key = name(pick % n);
        let filtered = graph.exclude_with_descendants(&[key.clone()]);

        prop_assert!(!filtered.contains(&key));
        for descendant in graph.descendants(&key) {
            prop_assert!(!filtered.contains(descendant));
        }
        prop_assert_eq!(filtered.len() + graph.descendants(&key).len() + 1, n);
    }
}
