//! TraceGraph: the record of every node created during an execution.
//!
//! [`TraceGraph`] is an explicit context object: the code that runs a traced
//! program owns one and passes it to every operator call. Nothing is global,
//! and concurrent executions use independent instances.
//!
//! # Storage
//!
//! Nodes live in a `StableGraph` with one edge per parent relation, pointing
//! from parent to child. The stable backing store keeps [`NodeId`]s valid when
//! [`clear_trace`](TraceGraph::clear_trace) drops the per-run part of the
//! graph and retains the parameters for the next execution.
//!
//! # Invariants
//!
//! - A node can only be created from nodes already in the graph, so the
//!   parent relation is acyclic and closed.
//! - A node's parent set never changes after creation.
//! - Feedback is empty after creation and after [`zero_feedback`](TraceGraph::zero_feedback).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use indexmap::IndexSet;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::feedback::FeedbackMap;
use crate::id::{NodeId, OpCallId};
use crate::node::{identifier_base, Node, NodeKind, Parents, Producer, Value};

fn default_recording() -> bool {
    true
}

/// The trace graph of one execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceGraph {
    graph: StableGraph<Node, (), Directed, u32>,
    /// Next free index per base name.
    name_counters: HashMap<String, u32>,
    next_call: u32,
    #[serde(default)]
    next_seq: u64,
    #[serde(default = "default_recording")]
    recording: bool,
}

impl Default for TraceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceGraph {
    /// Creates an empty graph with recording enabled.
    pub fn new() -> Self {
        TraceGraph {
            graph: StableGraph::new(),
            name_counters: HashMap::new(),
            next_call: 0,
            next_seq: 0,
            recording: true,
        }
    }

    // -----------------------------------------------------------------------
    // Node creation
    // -----------------------------------------------------------------------

    /// Adds a trainable parameter leaf.
    pub fn add_parameter(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        description: impl Into<String>,
    ) -> NodeId {
        self.insert_leaf(name, value.into(), NodeKind::Parameter, description.into())
    }

    /// Adds a leaf that is never updated.
    pub fn add_constant(&mut self, name: &str, value: impl Into<Value>) -> NodeId {
        self.insert_leaf(name, value.into(), NodeKind::Constant, String::new())
    }

    /// Adds the output of an operator invocation.
    ///
    /// Every parent must already be in the graph. Duplicate parents are kept
    /// once, in first-seen order. When recording is off the node is created
    /// without parents.
    pub fn add_message(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        description: impl Into<String>,
        parents: &[NodeId],
        producer: Producer,
    ) -> Result<NodeId, CoreError> {
        self.insert_derived(
            name,
            value.into(),
            NodeKind::Message,
            description.into(),
            parents,
            producer,
        )
    }

    /// Adds the captured failure of an operator invocation. The value is the
    /// failure description.
    pub fn add_exception(
        &mut self,
        name: &str,
        message: impl Into<String>,
        description: impl Into<String>,
        parents: &[NodeId],
        producer: Producer,
    ) -> Result<NodeId, CoreError> {
        self.insert_derived(
            name,
            Value::String(message.into()),
            NodeKind::Exception,
            description.into(),
            parents,
            producer,
        )
    }

    /// Allocates the identity of a new operator invocation.
    pub fn next_call_id(&mut self) -> OpCallId {
        let id = OpCallId(self.next_call);
        self.next_call += 1;
        id
    }

    fn insert_leaf(&mut self, name: &str, value: Value, kind: NodeKind, description: String) -> NodeId {
        let (name, index) = self.allocate_name(name);
        let node = Node {
            id: NodeId(0),
            name,
            index,
            value,
            kind,
            trainable: kind == NodeKind::Parameter,
            description,
            producer: None,
            parents: Parents::new(),
            seq: 0,
            feedback: FeedbackMap::new(),
        };
        self.add_node(node)
    }

    fn insert_derived(
        &mut self,
        name: &str,
        value: Value,
        kind: NodeKind,
        description: String,
        parents: &[NodeId],
        producer: Producer,
    ) -> Result<NodeId, CoreError> {
        let mut unique = Parents::new();
        if self.recording {
            for &parent in parents {
                if !self.contains(parent) {
                    return Err(CoreError::MissingParent {
                        node: name.to_string(),
                        parent,
                    });
                }
                if !unique.contains(&parent) {
                    unique.push(parent);
                }
            }
        }

        let (name, index) = self.allocate_name(name);
        let node = Node {
            id: NodeId(0),
            name,
            index,
            value,
            kind,
            trainable: false,
            description,
            producer: Some(producer),
            parents: unique.clone(),
            seq: 0,
            feedback: FeedbackMap::new(),
        };
        let id = self.add_node(node);
        for parent in unique {
            self.graph.add_edge(parent.into(), id.into(), ());
        }
        Ok(id)
    }

    fn add_node(&mut self, mut node: Node) -> NodeId {
        node.seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.graph.add_node(node);
        let id = NodeId::from(idx);
        if let Some(node) = self.graph.node_weight_mut(idx) {
            node.id = id;
        }
        id
    }

    fn allocate_name(&mut self, label: &str) -> (String, u32) {
        let base = identifier_base(label);
        let counter = self.name_counters.entry(base.clone()).or_insert(0);
        let index = *counter;
        *counter += 1;
        (base, index)
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    /// Looks up a node by ID.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id.into())
    }

    /// Looks up a node by ID, failing with [`CoreError::NodeNotFound`].
    pub fn get(&self, id: NodeId) -> Result<&Node, CoreError> {
        self.node(id).ok_or(CoreError::NodeNotFound { id })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.graph.node_indices().filter_map(|idx| self.graph.node_weight(idx))
    }

    /// Parents of a node in operator-input order.
    pub fn parents(&self, id: NodeId) -> Result<&[NodeId], CoreError> {
        self.get(id).map(|node| node.parents())
    }

    /// Nodes created directly from `id`, in id order.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, CoreError> {
        self.get(id)?;
        let mut children: Vec<NodeId> = self
            .graph
            .neighbors_directed(id.into(), Direction::Outgoing)
            .map(NodeId::from)
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    /// Trainable nodes in id order.
    pub fn parameters(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| node.is_trainable())
            .map(|node| node.id())
            .collect()
    }

    /// Finds a node by its identifier (e.g. `x0`).
    pub fn find_by_identifier(&self, identifier: &str) -> Option<NodeId> {
        self.nodes()
            .find(|node| node.identifier() == identifier)
            .map(|node| node.id())
    }

    /// Feedback accumulated on a node.
    pub fn feedback(&self, id: NodeId) -> Result<&FeedbackMap, CoreError> {
        self.get(id).map(|node| node.feedback())
    }

    pub(crate) fn feedback_mut(&mut self, id: NodeId) -> Result<&mut FeedbackMap, CoreError> {
        self.graph
            .node_weight_mut(id.into())
            .map(|node| &mut node.feedback)
            .ok_or(CoreError::NodeNotFound { id })
    }

    // -----------------------------------------------------------------------
    // Mutation of existing nodes
    // -----------------------------------------------------------------------

    /// Replaces a node's value, returning the old one. Structure is untouched.
    pub fn set_value(&mut self, id: NodeId, value: impl Into<Value>) -> Result<Value, CoreError> {
        let node = self
            .graph
            .node_weight_mut(id.into())
            .ok_or(CoreError::NodeNotFound { id })?;
        Ok(std::mem::replace(&mut node.value, value.into()))
    }

    /// Freezes or unfreezes a parameter.
    pub fn set_trainable(&mut self, id: NodeId, trainable: bool) -> Result<(), CoreError> {
        let node = self
            .graph
            .node_weight_mut(id.into())
            .ok_or(CoreError::NodeNotFound { id })?;
        if node.kind != NodeKind::Parameter {
            return Err(CoreError::NotAParameter {
                name: node.display_name(),
            });
        }
        node.trainable = trainable;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Every node reachable from `id` through the parent relation, excluding
    /// `id` itself, in discovery order.
    pub fn ancestors(&self, id: NodeId) -> Result<IndexSet<NodeId>, CoreError> {
        let mut seen = IndexSet::new();
        let mut stack: Vec<NodeId> = self.get(id)?.parents().to_vec();
        while let Some(current) = stack.pop() {
            if current == id {
                return Err(CoreError::CycleDetected { at: id });
            }
            if !seen.insert(current) {
                continue;
            }
            let node = self.node(current).ok_or(CoreError::MissingParent {
                node: id.to_string(),
                parent: current,
            })?;
            stack.extend(node.parents().iter().copied());
        }
        Ok(seen)
    }

    /// All nodes ordered so that every parent precedes its children. Ties
    /// go to the node created first.
    ///
    /// On a cycle, `at` is the lowest id that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, CoreError> {
        let mut pending: HashMap<NodeIndex<u32>, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
            .collect();
        let seq = |idx: NodeIndex<u32>| self.graph.node_weight(idx).map_or(0, |node| node.seq);
        let mut ready: BinaryHeap<Reverse<(u64, NodeIndex<u32>)>> = pending
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&idx, _)| Reverse((seq(idx), idx)))
            .collect();

        let mut order = Vec::with_capacity(pending.len());
        while let Some(Reverse((_, idx))) = ready.pop() {
            order.push(NodeId::from(idx));
            for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(count) = pending.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((seq(child), child)));
                    }
                }
            }
        }

        if order.len() < pending.len() {
            let at = pending
                .iter()
                .filter(|(_, &count)| count > 0)
                .map(|(&idx, _)| NodeId::from(idx))
                .min()
                .unwrap_or(NodeId(0));
            return Err(CoreError::CycleDetected { at });
        }
        Ok(order)
    }

    /// Checks the closure and acyclicity invariants, that edges and parent
    /// lists describe the same relation, and that identifiers are unique.
    ///
    /// Graphs built through the creation methods always pass; this is for
    /// graphs loaded from an export.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut identifiers = IndexSet::new();
        for idx in self.graph.node_indices() {
            let Some(node) = self.graph.node_weight(idx) else {
                continue;
            };
            let id = NodeId::from(idx);
            if node.id != id {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("node {} is stored at NodeId({})", node.display_name(), id),
                });
            }
            if node.kind.is_leaf() && !node.parents.is_empty() {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("leaf node {} has parents", node.display_name()),
                });
            }
            if node.trainable && node.kind != NodeKind::Parameter {
                return Err(CoreError::NotAParameter {
                    name: node.display_name(),
                });
            }
            for &parent in node.parents() {
                if !self.contains(parent) {
                    return Err(CoreError::MissingParent {
                        node: node.display_name(),
                        parent,
                    });
                }
                let parent_idx: NodeIndex<u32> = parent.into();
                if self.graph.find_edge(parent_idx, idx).is_none() {
                    return Err(CoreError::GraphInconsistency {
                        reason: format!(
                            "parent NodeId({}) of {} has no edge",
                            parent,
                            node.display_name()
                        ),
                    });
                }
            }
            let mut incoming = 0;
            for source in self.graph.neighbors_directed(idx, Direction::Incoming) {
                incoming += 1;
                if !node.parents.contains(&NodeId::from(source)) {
                    return Err(CoreError::GraphInconsistency {
                        reason: format!(
                            "edge from NodeId({}) into {} has no parent entry",
                            source.index(),
                            node.display_name()
                        ),
                    });
                }
            }
            if incoming != node.parents.len() {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("{} has duplicate parent edges", node.display_name()),
                });
            }
            if !identifiers.insert(node.identifier()) {
                return Err(CoreError::GraphInconsistency {
                    reason: format!("identifier {} is used twice", node.identifier()),
                });
            }
        }
        self.topological_order().map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Clears the feedback of every node. Structure and values are kept.
    pub fn zero_feedback(&mut self) {
        let indices: Vec<NodeIndex<u32>> = self.graph.node_indices().collect();
        for idx in indices {
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.feedback.clear();
            }
        }
    }

    /// Drops every node except parameters, whose ids stay valid.
    pub fn clear_trace(&mut self) {
        let doomed: Vec<NodeIndex<u32>> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .node_weight(idx)
                    .is_some_and(|node| node.kind != NodeKind::Parameter)
            })
            .collect();
        for idx in doomed {
            self.graph.remove_node(idx);
        }

        // Names restart after the highest index still in use.
        self.name_counters.clear();
        for node in self.graph.node_weights() {
            let next = self.name_counters.entry(node.name.clone()).or_insert(0);
            *next = (*next).max(node.index + 1);
        }
        tracing::debug!(retained = self.graph.node_count(), "cleared trace");
    }

    /// Turns parent recording on or off. While off, operator outputs are
    /// created without parents and are invisible to backward passes.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Direct identity membership of `node` in an explicitly flattened
/// collection of node ids.
///
/// Transitive reachability is the propagation engine's concern; this check
/// never walks parents.
pub fn contain<'a, I>(nodes: I, node: NodeId) -> bool
where
    I: IntoIterator<Item = &'a NodeId>,
{
    nodes.into_iter().any(|candidate| *candidate == node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer(graph: &mut TraceGraph, op: &str) -> Producer {
        Producer {
            call: graph.next_call_id(),
            op_name: op.to_string(),
        }
    }

    #[test]
    fn names_get_per_base_indices() {
        let mut graph = TraceGraph::new();
        let a = graph.add_parameter("x", "a", "");
        let b = graph.add_parameter("x", "b", "");
        let c = graph.add_constant("y", 1);

        assert_eq!(graph.get(a).unwrap().identifier(), "x0");
        assert_eq!(graph.get(b).unwrap().identifier(), "x1");
        assert_eq!(graph.get(b).unwrap().display_name(), "x:1");
        assert_eq!(graph.get(c).unwrap().identifier(), "y0");
        assert_eq!(graph.find_by_identifier("x1"), Some(b));
        assert_eq!(graph.find_by_identifier("z0"), None);
    }

    #[test]
    fn identifiers_never_collide() {
        let mut graph = TraceGraph::new();
        let xs: Vec<NodeId> = (0..11).map(|i| graph.add_parameter("x", i, "")).collect();
        let x1 = graph.add_parameter("x1", "other", "");

        assert_eq!(graph.get(xs[10]).unwrap().identifier(), "x10");
        assert_eq!(graph.get(x1).unwrap().identifier(), "x1_0");
        assert_eq!(graph.get(x1).unwrap().display_name(), "x1_:0");
        assert_eq!(graph.find_by_identifier("x10"), Some(xs[10]));
        assert_eq!(graph.find_by_identifier("x1_0"), Some(x1));

        let identifiers: IndexSet<String> = graph.nodes().map(|node| node.identifier()).collect();
        assert_eq!(identifiers.len(), graph.node_count());
    }

    #[test]
    fn message_requires_existing_parents() {
        let mut graph = TraceGraph::new();
        let p = producer(&mut graph, "add");
        let err = graph
            .add_message("sum", 3, "[add]", &[NodeId(5)], p)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::MissingParent {
                node: "sum".into(),
                parent: NodeId(5)
            }
        );
        assert!(graph.is_empty());
    }

    #[test]
    fn duplicate_parents_are_kept_once() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 2);
        let p = producer(&mut graph, "mul");
        let sq = graph.add_message("sq", 4, "[mul]", &[x, x], p).unwrap();
        assert_eq!(graph.parents(sq).unwrap(), &[x]);
        assert_eq!(graph.children(x).unwrap(), vec![sq]);
    }

    #[test]
    fn ancestors_and_topological_order() {
        let mut graph = TraceGraph::new();
        let a = graph.add_parameter("a", "A", "");
        let b = graph.add_parameter("b", "B", "");
        let unrelated = graph.add_constant("c", "C");
        let p = producer(&mut graph, "join");
        let ab = graph.add_message("join", "AB", "[join]", &[a, b], p).unwrap();
        let p = producer(&mut graph, "upper");
        let t = graph.add_message("upper", "ab", "[upper]", &[ab], p).unwrap();

        let ancestors = graph.ancestors(t).unwrap();
        assert_eq!(ancestors.len(), 3);
        assert!(ancestors.contains(&a) && ancestors.contains(&b) && ancestors.contains(&ab));
        assert!(!ancestors.contains(&unrelated));

        let order = graph.topological_order().unwrap();
        let pos = |id: NodeId| order.iter().position(|n| *n == id).unwrap();
        assert!(pos(a) < pos(ab));
        assert!(pos(b) < pos(ab));
        assert!(pos(ab) < pos(t));
        assert_eq!(order, vec![a, b, unrelated, ab, t]);
    }

    #[test]
    fn parameters_and_trainable_flag() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", "prompt", "system prompt");
        let c = graph.add_constant("c", 0);
        assert_eq!(graph.parameters(), vec![w]);

        graph.set_trainable(w, false).unwrap();
        assert!(graph.parameters().is_empty());
        assert!(matches!(
            graph.set_trainable(c, true),
            Err(CoreError::NotAParameter { .. })
        ));
    }

    #[test]
    fn clear_trace_retains_parameter_ids() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", "v1", "");
        let x = graph.add_constant("x", "input");
        let p = producer(&mut graph, "call");
        let y = graph.add_message("call", "out", "[call]", &[w, x], p).unwrap();

        graph.clear_trace();
        assert!(graph.contains(w));
        assert!(!graph.contains(x));
        assert!(!graph.contains(y));
        assert!(graph.children(w).unwrap().is_empty());
        assert_eq!(graph.get(w).unwrap().value(), &Value::from("v1"));

        let x = graph.add_constant("x", "again");
        let w2 = graph.add_parameter("w", "v2", "");
        assert_eq!(graph.get(x).unwrap().identifier(), "x0");
        assert_eq!(graph.get(w2).unwrap().identifier(), "w1");
    }

    #[test]
    fn topological_ties_follow_creation_order() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", 1, "");
        graph.add_constant("tmp", 0);
        graph.add_constant("tmp", 1);
        graph.clear_trace();

        // New nodes reuse the freed slots; order still follows creation.
        let a = graph.add_constant("a", 1);
        let b = graph.add_constant("b", 2);
        let p = producer(&mut graph, "sum");
        let s = graph.add_message("sum", 3, "[sum]", &[w, a, b], p).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![w, a, b, s]);
    }

    #[test]
    fn recording_off_creates_parentless_nodes() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", 1, "");
        graph.set_recording(false);
        let p = producer(&mut graph, "inc");
        let y = graph.add_message("inc", 2, "[inc]", &[w], p).unwrap();
        assert!(graph.get(y).unwrap().is_root());
        assert!(graph.ancestors(y).unwrap().is_empty());
        graph.set_recording(true);
        assert!(graph.is_recording());
    }

    #[test]
    fn set_value_returns_old_value() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", "old", "");
        let old = graph.set_value(w, "new").unwrap();
        assert_eq!(old, Value::from("old"));
        assert_eq!(graph.get(w).unwrap().value(), &Value::from("new"));
        assert!(matches!(
            graph.set_value(NodeId(99), "x"),
            Err(CoreError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn export_roundtrip_validates() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", "v", "");
        let p = producer(&mut graph, "id");
        graph.add_message("id", "v", "[id]", &[w], p).unwrap();

        let json = serde_json::to_string(&graph).unwrap();
        let loaded: TraceGraph = serde_json::from_str(&json).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.node_count(), 2);
        assert_eq!(loaded.parameters(), vec![w]);
    }

    #[test]
    fn validate_rejects_edges_without_parent_entries() {
        let mut graph = TraceGraph::new();
        let w = graph.add_parameter("w", "v", "");
        let c = graph.add_constant("c", 1);
        let p = producer(&mut graph, "id");
        let m = graph.add_message("id", "v", "[id]", &[w], p).unwrap();
        let exported = serde_json::to_value(&graph).unwrap();

        // c -> m: ordered by the edges, invisible to backward passes.
        let mut extra = exported.clone();
        extra["graph"]["edges"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!([c.0, m.0, null]));
        let loaded: TraceGraph = serde_json::from_value(extra).unwrap();
        assert!(matches!(loaded.validate(), Err(CoreError::GraphInconsistency { .. })));

        // m -> w closes a cycle that exists only in the edges.
        let mut back = exported;
        back["graph"]["edges"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!([m.0, w.0, null]));
        let loaded: TraceGraph = serde_json::from_value(back).unwrap();
        assert!(matches!(loaded.validate(), Err(CoreError::GraphInconsistency { .. })));
    }

    #[test]
    fn contain_is_direct_membership() {
        let flattened = vec![NodeId(1), NodeId(4)];
        assert!(contain(&flattened, NodeId(4)));
        assert!(!contain(&flattened, NodeId(2)));
        assert!(!contain(&Vec::<NodeId>::new(), NodeId(1)));
    }
}
