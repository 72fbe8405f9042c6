//! Feature Dependency Graph
//!
//! Directed graph over fully qualified features, built with petgraph.
//! Edges point from a prerequisite to the feature that requires it, so a
//! topological order lists prerequisites first.
//!
//! Shared between:
//! - the dependency resolver (cycle rejection before a change is queued)
//! - the change applier (ordering install-time feature enables)
//! - the CLI (`graph` subcommand, DOT export)

pub mod analysis;

pub use analysis::{find_cycle_edge, topological_order};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

use crate::schema::{DependencyEdge, FeatureRef, ModuleSet};

/// Dependency graph between features
#[derive(Debug, Clone, Default)]
pub struct FeatureGraph {
    pub(crate) graph: DiGraph<FeatureRef, ()>,
    index: HashMap<FeatureRef, NodeIndex>,
}

impl FeatureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of every feature and edge declared by the installed modules
    pub fn from_modules(modules: &ModuleSet) -> Self {
        let mut graph = Self::new();
        for module in modules.iter() {
            for feature in &module.features {
                graph.add_feature(module.feature_ref(&feature.name));
            }
        }
        graph.extend(modules.edges());
        graph
    }

    /// Add a feature node, returning the existing node if already present
    pub fn add_feature(&mut self, feature: FeatureRef) -> NodeIndex {
        if let Some(idx) = self.index.get(&feature) {
            return *idx;
        }
        let idx = self.graph.add_node(feature.clone());
        self.index.insert(feature, idx);
        idx
    }

    pub fn add_edge(&mut self, edge: DependencyEdge) {
        let from = self.add_feature(edge.prerequisite);
        let to = self.add_feature(edge.dependent);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn feature_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, feature: &FeatureRef) -> bool {
        self.index.contains_key(feature)
    }

    /// Features that directly require `feature`
    pub fn dependents_of(&self, feature: &FeatureRef) -> Vec<&FeatureRef> {
        self.neighbors(feature, Direction::Outgoing)
    }

    /// Features directly required by `feature`
    pub fn prerequisites_of(&self, feature: &FeatureRef) -> Vec<&FeatureRef> {
        self.neighbors(feature, Direction::Incoming)
    }

    fn neighbors(&self, feature: &FeatureRef, dir: Direction) -> Vec<&FeatureRef> {
        let Some(&idx) = self.index.get(feature) else {
            return Vec::new();
        };
        let mut out: Vec<&FeatureRef> = self
            .graph
            .edges_directed(idx, dir)
            .map(|e| match dir {
                Direction::Outgoing => &self.graph[e.target()],
                Direction::Incoming => &self.graph[e.source()],
            })
            .collect();
        out.sort();
        out
    }

    /// Render the graph in Graphviz DOT format, one cluster per module
    pub fn to_dot(&self) -> String {
        let mut by_module: HashMap<&str, Vec<&FeatureRef>> = HashMap::new();
        for feature in self.graph.node_indices().map(|idx| &self.graph[idx]) {
            by_module.entry(feature.module.as_str()).or_default().push(feature);
        }
        let mut modules: Vec<_> = by_module.into_iter().collect();
        modules.sort_by(|a, b| a.0.cmp(b.0));

        let mut dot = String::from("digraph features {\n    rankdir=LR;\n");
        for (i, (module, mut features)) in modules.into_iter().enumerate() {
            features.sort();
            dot.push_str(&format!(
                "    subgraph cluster_{} {{\n        label=\"{}\";\n",
                i, module
            ));
            for feature in features {
                dot.push_str(&format!("        \"{}\";\n", feature));
            }
            dot.push_str("    }\n");
        }
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_references()
            .map(|e| (self.graph[e.source()].to_string(), self.graph[e.target()].to_string()))
            .collect();
        edges.sort();
        for (from, to) in edges {
            dot.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }
        dot.push_str("}\n");
        dot
    }
}

impl Extend<DependencyEdge> for FeatureGraph {
    fn extend<I: IntoIterator<Item = DependencyEdge>>(&mut self, iter: I) {
        for edge in iter {
            self.add_edge(edge);
        }
    }
}
