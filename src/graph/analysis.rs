//! Feature Graph Analysis
//!
//! Topological ordering and cycle detection. A cycle is reported as one
//! concrete edge inside a strongly connected component, so the rejection
//! message can point at something the schema author can fix.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashSet;

use super::FeatureGraph;
use crate::schema::{DependencyEdge, FeatureRef};

/// Features ordered so every prerequisite precedes its dependents
///
/// Returns one cycle edge when the graph is not acyclic.
pub fn topological_order(graph: &FeatureGraph) -> Result<Vec<FeatureRef>, DependencyEdge> {
    match toposort(&graph.graph, None) {
        Ok(order) => Ok(order.into_iter().map(|idx| graph.graph[idx].clone()).collect()),
        Err(cycle) => Err(cycle_edge_through(graph, cycle.node_id())
            .or_else(|| find_cycle_edge(graph))
            .unwrap_or_else(|| {
                let feature = graph.graph[cycle.node_id()].clone();
                DependencyEdge {
                    dependent: feature.clone(),
                    prerequisite: feature,
                }
            })),
    }
}

/// One edge that lies on a dependency cycle, if any cycle exists
pub fn find_cycle_edge(graph: &FeatureGraph) -> Option<DependencyEdge> {
    tarjan_scc(&graph.graph).into_iter().find_map(|component| {
        let first = *component.first()?;
        cycle_edge_through(graph, first)
    })
}

/// An edge leaving `node` that stays inside its strongly connected component
fn cycle_edge_through(graph: &FeatureGraph, node: NodeIndex) -> Option<DependencyEdge> {
    let component: HashSet<NodeIndex> = tarjan_scc(&graph.graph)
        .into_iter()
        .find(|c| c.contains(&node))?
        .into_iter()
        .collect();

    graph
        .graph
        .edges_directed(node, Direction::Outgoing)
        .filter(|e| component.contains(&e.target()))
        // a singleton component only counts when it loops on itself
        .find(|e| component.len() > 1 || e.target() == node)
        .map(|e| DependencyEdge {
            dependent: graph.graph[e.target()].clone(),
            prerequisite: graph.graph[e.source()].clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(dep: &str, pre: &str) -> DependencyEdge {
        DependencyEdge {
            dependent: FeatureRef::new("m", dep),
            prerequisite: FeatureRef::new("m", pre),
        }
    }

    #[test]
    fn test_prerequisites_come_first() {
        let mut graph = FeatureGraph::new();
        graph.extend([edge("c", "b"), edge("b", "a"), edge("d", "a")]);

        let order = topological_order(&graph).unwrap();
        let pos = |name: &str| order.iter().position(|f| f.feature == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("a") < pos("d"));
    }

    #[test]
    fn test_cycle_reports_edge_on_cycle() {
        let mut graph = FeatureGraph::new();
        graph.extend([edge("b", "a"), edge("c", "b"), edge("a", "c"), edge("d", "a")]);

        let cycle = topological_order(&graph).unwrap_err();
        let members = ["a", "b", "c"];
        assert!(members.contains(&cycle.dependent.feature.as_str()));
        assert!(members.contains(&cycle.prerequisite.feature.as_str()));
        assert!(find_cycle_edge(&graph).is_some());
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut graph = FeatureGraph::new();
        graph.add_edge(edge("a", "a"));
        assert_eq!(find_cycle_edge(&graph), Some(edge("a", "a")));
        assert!(topological_order(&graph).is_err());
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle_edge() {
        let mut graph = FeatureGraph::new();
        graph.extend([edge("b", "a"), edge("c", "a")]);
        assert_eq!(find_cycle_edge(&graph), None);
    }
}
