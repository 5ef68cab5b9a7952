//! The flow graph model: flows, nodes, edges, and named subflows.
//!
//! Flows are immutable once saved. The walker treats the main graph and each
//! subflow identically; a subflow is just a named [`FlowGraph`] invocable via
//! a control directive.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::policy::NodePolicy;
use crate::types::{FlowId, NodeId};

/// Schema version stamped on every persisted flow. Non-matching versions
/// require external migration before load.
pub const FLOW_SCHEMA_VERSION: u32 = 1;

/// Canonical edge labels. The vocabulary is open: plugins may route over
/// their own labels, which round-trip as [`EdgeLabel::Custom`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    Default,
    OnError,
    True,
    False,
    Custom(String),
}

impl EdgeLabel {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EdgeLabel::Default => "default",
            EdgeLabel::OnError => "onError",
            EdgeLabel::True => "true",
            EdgeLabel::False => "false",
            EdgeLabel::Custom(s) => s,
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "default" => EdgeLabel::Default,
            "onError" => EdgeLabel::OnError,
            "true" => EdgeLabel::True,
            "false" => EdgeLabel::False,
            other => EdgeLabel::Custom(other.to_string()),
        }
    }
}

impl Serialize for EdgeLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EdgeLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EdgeLabel::parse(&s))
    }
}

impl std::fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed action node. `config` is opaque to the engine and interpreted by
/// the plugin registered for `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<NodePolicy>,
    #[serde(default)]
    pub config: Value,
    /// Editor canvas coordinates; ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
}

impl Node {
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            disabled: false,
            policy: None,
            config: Value::Null,
            position: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: NodePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Directed edge between two nodes of the same graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

impl Edge {
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
            label: None,
        }
    }

    #[must_use]
    pub fn labeled(source: impl Into<NodeId>, target: impl Into<NodeId>, label: EdgeLabel) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{source}-{label}->{target}"),
            source,
            target,
            label: Some(label),
        }
    }

    /// Effective label: an unlabeled edge is a `default` edge.
    #[must_use]
    pub fn effective_label(&self) -> &EdgeLabel {
        self.label.as_ref().unwrap_or(&EdgeLabel::Default)
    }
}

/// One graph: an entry node, a set of nodes, and directed edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowGraph {
    pub entry_node_id: NodeId,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowGraph {
    #[must_use]
    pub fn new(entry_node_id: impl Into<NodeId>) -> Self {
        Self {
            entry_node_id: entry_node_id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// First outgoing edge of `node_id` carrying `label`. Storage does not
    /// enforce uniqueness; the first match is the canonical one.
    #[must_use]
    pub fn edge_out(&self, node_id: &str, label: &EdgeLabel) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.source == node_id && e.effective_label() == label)
    }

    /// Labels present on outgoing edges of `node_id`, in declaration order.
    #[must_use]
    pub fn out_labels(&self, node_id: &str) -> Vec<EdgeLabel> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id)
            .map(|e| e.effective_label().clone())
            .collect()
    }
}

/// A named, versioned workflow definition. Immutable once saved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub schema_version: u32,
    #[serde(flatten)]
    pub graph: FlowGraph,
    /// Named subflows invocable from control directives.
    #[serde(default)]
    pub subflows: FxHashMap<String, FlowGraph>,
    /// Defaults applied to `vars` for keys the run's args do not set.
    #[serde(default)]
    pub var_defaults: FxHashMap<String, Value>,
    /// Flow-level default node policy; lowest precedence in the merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_node_policy: Option<NodePolicy>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl Flow {
    #[must_use]
    pub fn new(id: impl Into<FlowId>, name: impl Into<String>, graph: FlowGraph) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schema_version: FLOW_SCHEMA_VERSION,
            graph,
            subflows: FxHashMap::default(),
            var_defaults: FxHashMap::default(),
            default_node_policy: None,
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_subflow(mut self, name: impl Into<String>, graph: FlowGraph) -> Self {
        self.subflows.insert(name.into(), graph);
        self
    }

    #[must_use]
    pub fn with_var_default(mut self, name: impl Into<String>, value: Value) -> Self {
        self.var_defaults.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_default_node_policy(mut self, policy: NodePolicy) -> Self {
        self.default_node_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn subflow(&self, name: &str) -> Option<&FlowGraph> {
        self.subflows.get(name)
    }
}
