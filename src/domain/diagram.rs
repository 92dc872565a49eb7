//! Before/after component graphs derived from relationship edges.
//!
//! Both graphs always share one node set. A node with no edge in one of the
//! graphs is kept there as a ghost so the two pictures line up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use serde::Serialize;

use super::types::{RelationKind, RelationshipEdge};

/// Name of the node that absorbs collapsed low-fan-out components.
pub const AGGREGATE_NODE: &str = "other changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum NodeStyle {
    Present,
    Ghost,
    Aggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EdgeStyle {
    Solid,
    /// Dependency deleted by this change, drawn in the before graph
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DiagramEdge {
    pub source: String,
    pub target: String,
    pub style: EdgeStyle,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Graph {
    pub nodes: BTreeMap<String, NodeStyle>,
    /// Sorted and free of duplicates
    pub edges: Vec<DiagramEdge>,
}

impl Graph {
    pub fn is_ghost(&self, name: &str) -> bool {
        self.nodes.get(name) == Some(&NodeStyle::Ghost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DiagramSpec {
    pub before: Graph,
    pub after: Graph,
    /// Components folded into the aggregate node, alphabetical
    pub collapsed: Vec<String>,
}

impl DiagramSpec {
    pub fn is_empty(&self) -> bool {
        self.before.nodes.is_empty()
    }

    pub fn render_before(&self) -> String {
        render_mermaid(&self.before)
    }

    pub fn render_after(&self) -> String {
        render_mermaid(&self.after)
    }
}

/// Build both graphs, folding nodes beyond `max_nodes` into the aggregate.
pub fn synthesize(edges: &[RelationshipEdge], max_nodes: usize) -> DiagramSpec {
    let (edges, collapsed) = collapse(edges, max_nodes);

    let mut before_edges = BTreeSet::new();
    let mut after_edges = BTreeSet::new();
    for edge in &edges {
        let solid = DiagramEdge {
            source: edge.source.clone(),
            target: edge.target.clone(),
            style: EdgeStyle::Solid,
        };
        match edge.kind {
            RelationKind::Both => {
                before_edges.insert(solid.clone());
                after_edges.insert(solid);
            }
            RelationKind::BeforeOnly => {
                before_edges.insert(solid);
            }
            RelationKind::AfterOnly => {
                after_edges.insert(solid);
            }
            RelationKind::Removed => {
                before_edges.insert(DiagramEdge {
                    style: EdgeStyle::Removed,
                    ..solid
                });
            }
        }
    }

    let all_nodes: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();

    DiagramSpec {
        before: build_graph(&all_nodes, before_edges),
        after: build_graph(&all_nodes, after_edges),
        collapsed,
    }
}

fn build_graph(all_nodes: &BTreeSet<&str>, edges: BTreeSet<DiagramEdge>) -> Graph {
    let touched: BTreeSet<&str> = edges
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();

    let nodes = all_nodes
        .iter()
        .map(|name| {
            let style = if !touched.contains(name) {
                NodeStyle::Ghost
            } else if *name == AGGREGATE_NODE {
                NodeStyle::Aggregate
            } else {
                NodeStyle::Present
            };
            (name.to_string(), style)
        })
        .collect();

    Graph {
        nodes,
        edges: edges.into_iter().collect(),
    }
}

/// Fold the lowest-fan-out nodes (ties: alphabetical) into the aggregate
/// node until at most `max_nodes` distinct nodes remain.
fn collapse(edges: &[RelationshipEdge], max_nodes: usize) -> (Vec<RelationshipEdge>, Vec<String>) {
    let mut fan_out: BTreeMap<&str, usize> = BTreeMap::new();
    for edge in edges {
        *fan_out.entry(edge.source.as_str()).or_default() += 1;
        if edge.target != edge.source {
            *fan_out.entry(edge.target.as_str()).or_default() += 1;
        }
    }

    if fan_out.len() <= max_nodes {
        return (edges.to_vec(), Vec::new());
    }

    let keep = max_nodes.saturating_sub(1).max(1);
    let mut ranked: Vec<(&str, usize)> = fan_out.into_iter().collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    let excess = ranked.len() - keep;
    let mut collapsed: Vec<String> = ranked[..excess].iter().map(|(n, _)| n.to_string()).collect();
    collapsed.sort();

    let folded = |name: &str| -> String {
        if collapsed.binary_search_by(|c| c.as_str().cmp(name)).is_ok() {
            AGGREGATE_NODE.to_string()
        } else {
            name.to_string()
        }
    };

    let mut rewritten: Vec<RelationshipEdge> = Vec::new();
    for edge in edges {
        let source = folded(&edge.source);
        let target = folded(&edge.target);
        if source == AGGREGATE_NODE && target == AGGREGATE_NODE {
            continue;
        }
        let edge = RelationshipEdge {
            source,
            target,
            kind: edge.kind,
        };
        if !rewritten.contains(&edge) {
            rewritten.push(edge);
        }
    }

    (rewritten, collapsed)
}

fn render_mermaid(graph: &Graph) -> String {
    let ids: BTreeMap<&str, String> = graph
        .nodes
        .keys()
        .enumerate()
        .map(|(i, name)| (name.as_str(), format!("n{}", i)))
        .collect();

    let mut out = String::from("flowchart LR\n");
    for (name, style) in &graph.nodes {
        let label = name.replace('"', "#quot;");
        let id = &ids[name.as_str()];
        let _ = match style {
            NodeStyle::Present => writeln!(out, "    {}[\"{}\"]", id, label),
            NodeStyle::Ghost => writeln!(out, "    {}[\"{}\"]:::ghost", id, label),
            NodeStyle::Aggregate => writeln!(out, "    {}[/\"{}\"/]:::aggregate", id, label),
        };
    }
    for edge in &graph.edges {
        let (source, target) = (&ids[edge.source.as_str()], &ids[edge.target.as_str()]);
        let _ = match edge.style {
            EdgeStyle::Solid => writeln!(out, "    {} --> {}", source, target),
            EdgeStyle::Removed => writeln!(out, "    {} -. removed .-x {}", source, target),
        };
    }
    out.push_str("    classDef ghost stroke-dasharray: 4 4,opacity:0.5;\n");
    out.push_str("    classDef aggregate stroke-dasharray: 2 2;\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: &str, target: &str, kind: RelationKind) -> RelationshipEdge {
        RelationshipEdge {
            source: source.to_string(),
            target: target.to_string(),
            kind,
        }
    }

    #[test]
    fn after_only_edge_leaves_ghost_in_before_graph() {
        let spec = synthesize(
            &[
                edge("PaymentService", "PaymentRepository", RelationKind::Both),
                edge("PaymentService", "RefundGateway", RelationKind::AfterOnly),
            ],
            12,
        );
        assert_eq!(spec.after.nodes["RefundGateway"], NodeStyle::Present);
        assert!(spec.before.is_ghost("RefundGateway"));
        assert_eq!(spec.before.edges.len(), 1);
        assert_eq!(spec.after.edges.len(), 2);
    }

    #[test]
    fn before_only_edge_leaves_ghost_in_after_graph() {
        let spec = synthesize(&[edge("Billing", "LegacyLedger", RelationKind::BeforeOnly)], 12);
        assert!(spec.after.is_ghost("Billing"));
        assert!(spec.after.is_ghost("LegacyLedger"));
        assert!(spec.after.edges.is_empty());
        assert_eq!(spec.before.nodes["LegacyLedger"], NodeStyle::Present);
    }

    #[test]
    fn both_graphs_share_one_node_set() {
        let spec = synthesize(
            &[
                edge("A", "B", RelationKind::Both),
                edge("B", "C", RelationKind::BeforeOnly),
                edge("C", "D", RelationKind::AfterOnly),
                edge("D", "E", RelationKind::Removed),
            ],
            12,
        );
        let before: Vec<_> = spec.before.nodes.keys().collect();
        let after: Vec<_> = spec.after.nodes.keys().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn removed_edges_are_drawn_with_a_marker() {
        let spec = synthesize(&[edge("Api", "Cache", RelationKind::Removed)], 12);
        assert_eq!(spec.before.edges[0].style, EdgeStyle::Removed);
        assert!(spec.after.edges.is_empty());
        assert!(spec.render_before().contains("-. removed .-x"));
        assert!(spec.render_after().contains(":::ghost"));
    }

    #[test]
    fn collapse_folds_lowest_fan_out_alphabetically() {
        let edges = [
            edge("Hub", "A", RelationKind::Both),
            edge("Hub", "B", RelationKind::Both),
            edge("Hub", "C", RelationKind::AfterOnly),
            edge("Hub", "D", RelationKind::AfterOnly),
            edge("A", "B", RelationKind::Both),
        ];
        let spec = synthesize(&edges, 4);

        // Hub 4, A 2, B 2, C 1, D 1: C and D go first
        assert_eq!(spec.collapsed, ["C", "D"]);
        assert_eq!(spec.after.nodes.len(), 4);
        assert_eq!(spec.after.nodes[AGGREGATE_NODE], NodeStyle::Aggregate);
        assert!(spec.before.is_ghost(AGGREGATE_NODE));
        let into_aggregate = spec
            .after
            .edges
            .iter()
            .filter(|e| e.target == AGGREGATE_NODE)
            .count();
        assert_eq!(into_aggregate, 1);
    }

    #[test]
    fn synthesis_and_rendering_are_deterministic() {
        let edges = [
            edge("Z", "Y", RelationKind::AfterOnly),
            edge("A", "Y", RelationKind::Both),
            edge("M", "A", RelationKind::Removed),
        ];
        let first = synthesize(&edges, 12);
        let second = synthesize(&edges, 12);
        assert_eq!(first, second);
        assert_eq!(first.render_before(), second.render_before());
        assert_eq!(first.render_after(), second.render_after());
    }

    #[test]
    fn labels_are_quoted_for_mermaid() {
        let spec = synthesize(&[edge("Svc \"v2\"", "Db", RelationKind::Both)], 12);
        assert!(spec.render_after().contains("Svc #quot;v2#quot;"));
    }
}
