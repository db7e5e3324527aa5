//! Compiled node/edge representation of a pipeline definition.
//!
//! A [`Graph`] is what the [`Definition`](crate::Definition) builder produces
//! and what the advancer walks. It is persisted verbatim (as JSON) on every
//! pipeline at trigger time together with its [`Graph::hash`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// How a node is reached from its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The entry node of the graph.
    Start,
    /// One-to-one successor.
    Chain,
    /// Static fan-out: one step per listed sibling.
    Divide,
    /// Static join of a previous divide.
    Combine,
    /// Dynamic fan-out: one step per element of the predecessor's output.
    Expand,
    /// Dynamic join of a previous expand.
    Collapse,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Chain => "chain",
            Self::Divide => "divide",
            Self::Combine => "combine",
            Self::Expand => "expand",
            Self::Collapse => "collapse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "chain" => Some(Self::Chain),
            "divide" => Some(Self::Divide),
            "combine" => Some(Self::Combine),
            "expand" => Some(Self::Expand),
            "collapse" => Some(Self::Collapse),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a node: `"<StepType>.<stage>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(step_type: &str, stage: usize) -> Self {
        Self(format!("{step_type}.{stage}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stage encoded in the identifier.
    pub fn stage(&self) -> usize {
        self.0
            .rsplit_once('.')
            .and_then(|(_, stage)| stage.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Edge entry keyed by the node it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Successor nodes, in the order they were declared.
    pub to: Vec<NodeId>,
    /// Transition through which this node is reached.
    #[serde(rename = "type")]
    pub transition: Transition,
    pub step_type: String,
    /// Join cohort of a combine/collapse node, in branch order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<NodeId>,
}

/// A compiled pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    /// Node identifiers in creation order.
    pub nodes: Vec<NodeId>,
    pub edges: BTreeMap<NodeId, Node>,
    /// Step type invoked when a pipeline of this graph halts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_halt: Option<String>,
}

/// Structural defect found by [`Graph::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphDefect {
    #[error("edge from '{from}' targets unknown node '{to}'")]
    DanglingTarget { from: NodeId, to: NodeId },

    #[error("node '{0}' is listed but has no edge entry")]
    MissingEntry(NodeId),

    #[error("expected exactly one start node, found {0}")]
    StartCount(usize),
}

impl Graph {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.edges.get(id)
    }

    /// The unique start node.
    pub fn start(&self) -> Option<(&NodeId, &Node)> {
        self.edges
            .iter()
            .find(|(_, node)| node.transition == Transition::Start)
    }

    /// Nodes with an edge into `target`: the recorded join cohort for
    /// combine/collapse nodes, creation order otherwise.
    pub fn sources_of(&self, target: &NodeId) -> Vec<&NodeId> {
        if let Some(node) = self.edges.get(target) {
            if !node.from.is_empty() {
                return node.from.iter().collect();
            }
        }
        self.nodes
            .iter()
            .filter(|id| {
                self.edges
                    .get(*id)
                    .is_some_and(|node| node.to.contains(target))
            })
            .collect()
    }

    /// Every step type referenced by the graph, including the halt handler.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = Vec::new();
        for id in &self.nodes {
            if let Some(node) = self.edges.get(id) {
                if !types.contains(&node.step_type.as_str()) {
                    types.push(&node.step_type);
                }
            }
        }
        if let Some(handler) = &self.on_halt {
            if !types.contains(&handler.as_str()) {
                types.push(handler);
            }
        }
        types
    }

    pub fn validate(&self) -> Result<(), GraphDefect> {
        for id in &self.nodes {
            if !self.edges.contains_key(id) {
                return Err(GraphDefect::MissingEntry(id.clone()));
            }
        }
        for (from, node) in &self.edges {
            if let Some(to) = node.to.iter().find(|to| !self.edges.contains_key(*to)) {
                return Err(GraphDefect::DanglingTarget {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            if let Some(source) = node.from.iter().find(|s| !self.edges.contains_key(*s)) {
                return Err(GraphDefect::DanglingTarget {
                    from: source.clone(),
                    to: from.clone(),
                });
            }
        }
        let starts = self
            .edges
            .values()
            .filter(|node| node.transition == Transition::Start)
            .count();
        if starts != 1 {
            return Err(GraphDefect::StartCount(starts));
        }
        Ok(())
    }

    /// Canonical JSON encoding, as persisted on pipelines.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Hex SHA-256 of the canonical encoding.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        Ok(hash_definition(&self.to_json()?))
    }
}

/// Hex SHA-256 of a serialized definition.
pub fn hash_definition(json: &str) -> String {
    hex::encode(Sha256::digest(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> Graph {
        let a = NodeId::new("A", 0);
        let b = NodeId::new("B", 1);
        let mut edges = BTreeMap::new();
        edges.insert(
            a.clone(),
            Node {
                to: vec![b.clone()],
                transition: Transition::Start,
                step_type: "A".into(),
                from: vec![],
            },
        );
        edges.insert(
            b.clone(),
            Node {
                to: vec![],
                transition: Transition::Chain,
                step_type: "B".into(),
                from: vec![],
            },
        );
        Graph {
            nodes: vec![a, b],
            edges,
            on_halt: None,
        }
    }

    #[test]
    fn test_node_id_stage() {
        assert_eq!(NodeId::new("Fetch", 3).as_str(), "Fetch.3");
        assert_eq!(NodeId::new("Fetch", 3).stage(), 3);
    }

    #[test]
    fn test_validate_detects_dangling_target() {
        let mut graph = two_node_graph();
        graph
            .edges
            .get_mut(&NodeId::new("B", 1))
            .unwrap()
            .to
            .push(NodeId::new("C", 2));

        assert_eq!(
            graph.validate(),
            Err(GraphDefect::DanglingTarget {
                from: NodeId::new("B", 1),
                to: NodeId::new("C", 2),
            })
        );
    }

    #[test]
    fn test_validate_requires_single_start() {
        let mut graph = two_node_graph();
        graph.edges.get_mut(&NodeId::new("B", 1)).unwrap().transition = Transition::Start;
        assert_eq!(graph.validate(), Err(GraphDefect::StartCount(2)));
    }

    #[test]
    fn test_hash_round_trips_through_json() {
        let graph = two_node_graph();
        let json = graph.to_json().unwrap();
        let restored = Graph::from_json(&json).unwrap();

        assert_eq!(restored, graph);
        assert_eq!(restored.hash().unwrap(), hash_definition(&json));
        assert_eq!(graph.hash().unwrap().len(), 64);
    }

    #[test]
    fn test_sources_follow_creation_order() {
        let graph = two_node_graph();
        let sources = graph.sources_of(&NodeId::new("B", 1));
        assert_eq!(sources, vec![&NodeId::new("A", 0)]);
        assert!(graph.sources_of(&NodeId::new("A", 0)).is_empty());
    }

    #[test]
    fn test_transition_serializes_snake_case() {
        let json = serde_json::to_string(&Transition::Collapse).unwrap();
        assert_eq!(json, "\"collapse\"");
        assert_eq!(Transition::parse("divide"), Some(Transition::Divide));
    }
}
