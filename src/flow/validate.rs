//! Structural validation of flow graphs.
//!
//! Runs before a graph is walked: on flow load for the main graph and on
//! directive entry for subflows and called flows.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::{ErrorCode, ErrorInfo};
use crate::flow::model::FlowGraph;

/// Structural defects detected in a graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("entry node `{entry}` is not part of the graph")]
    #[diagnostic(
        code(runloom::flow::missing_entry),
        help("Declare a node with id `{entry}` or point entryNodeId at an existing node.")
    )]
    MissingEntry { entry: String },

    #[error("edge `{edge}` references unknown node `{node}`")]
    #[diagnostic(
        code(runloom::flow::dangling_edge),
        help("Every edge endpoint must reference a node declared in the same graph.")
    )]
    DanglingEdge { edge: String, node: String },

    #[error("duplicate node id `{node}`")]
    #[diagnostic(code(runloom::flow::duplicate_node))]
    DuplicateNode { node: String },

    #[error("graph contains a cycle through `{node}`")]
    #[diagnostic(
        code(runloom::flow::cycle),
        help("Flow graphs must be acyclic; use a `while` directive for loops.")
    )]
    Cycle { node: String },
}

impl From<GraphError> for ErrorInfo {
    fn from(err: GraphError) -> Self {
        let code = match &err {
            GraphError::Cycle { .. } => ErrorCode::DagCycle,
            _ => ErrorCode::DagInvalid,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

/// Validate one graph: entry exists, edges reference declared nodes, node ids
/// are unique, and the edge relation is acyclic (Kahn's algorithm).
pub fn validate_graph(graph: &FlowGraph) -> Result<(), GraphError> {
    let mut indegree: FxHashMap<&str, usize> = FxHashMap::default();
    for node in &graph.nodes {
        if indegree.insert(node.id.as_str(), 0).is_some() {
            return Err(GraphError::DuplicateNode {
                node: node.id.clone(),
            });
        }
    }

    if !indegree.contains_key(graph.entry_node_id.as_str()) {
        return Err(GraphError::MissingEntry {
            entry: graph.entry_node_id.clone(),
        });
    }

    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !indegree.contains_key(endpoint.as_str()) {
                return Err(GraphError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
        if let Some(d) = indegree.get_mut(edge.target.as_str()) {
            *d += 1;
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();
    let mut visited = 0usize;
    while let Some(id) = ready.pop() {
        visited += 1;
        for edge in graph.edges.iter().filter(|e| e.source == id) {
            let d = indegree
                .get_mut(edge.target.as_str())
                .map(|d| {
                    *d -= 1;
                    *d
                })
                .unwrap_or(0);
            if d == 0 {
                ready.push(edge.target.as_str());
            }
        }
    }

    if visited != graph.nodes.len() {
        // Any node left with positive indegree sits on a cycle; report the
        // lexicographically first for a stable message.
        let mut on_cycle: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        on_cycle.sort_unstable();
        return Err(GraphError::Cycle {
            node: on_cycle.first().map(|s| (*s).to_string()).unwrap_or_default(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::{Edge, Node};

    fn node(id: &str) -> Node {
        Node::new(id, "test")
    }

    #[test]
    fn accepts_a_linear_chain() {
        let graph = FlowGraph::new("a")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"));
        assert!(validate_graph(&graph).is_ok());
    }

    #[test]
    fn rejects_missing_entry() {
        let graph = FlowGraph::new("nope").with_node(node("a"));
        assert!(matches!(
            validate_graph(&graph),
            Err(GraphError::MissingEntry { .. })
        ));
    }

    #[test]
    fn rejects_dangling_edge() {
        let graph = FlowGraph::new("a")
            .with_node(node("a"))
            .with_edge(Edge::new("a", "ghost"));
        assert!(matches!(
            validate_graph(&graph),
            Err(GraphError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let graph = FlowGraph::new("a").with_node(node("a")).with_node(node("a"));
        assert!(matches!(
            validate_graph(&graph),
            Err(GraphError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn detects_cycles() {
        let graph = FlowGraph::new("a")
            .with_node(node("a"))
            .with_node(node("b"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let err = validate_graph(&graph).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
        let info: ErrorInfo = err.into();
        assert_eq!(info.code, ErrorCode::DagCycle);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let graph = FlowGraph::new("a")
            .with_node(node("a"))
            .with_edge(Edge::new("a", "a"));
        assert!(matches!(
            validate_graph(&graph),
            Err(GraphError::Cycle { .. })
        ));
    }
}
