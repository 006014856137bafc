//! Trace graph vertices.
//!
//! A [`Node`] holds a value, its provenance (the operator invocation that
//! produced it and the parents it was derived from) and a feedback
//! accumulator filled by backward passes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::feedback::FeedbackMap;
use crate::id::{NodeId, OpCallId};

/// Payload of a node: text, number or structured value.
pub type Value = serde_json::Value;

/// Parent list. Most operators take a handful of inputs.
pub type Parents = SmallVec<[NodeId; 4]>;

/// What kind of vertex a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A leaf the optimizer may rewrite.
    Parameter,
    /// A leaf that is never updated (program inputs, literals).
    Constant,
    /// The output of an operator invocation.
    Message,
    /// The captured failure of an operator invocation.
    Exception,
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Parameter | NodeKind::Constant)
    }
}

/// The operator invocation that created a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Producer {
    pub call: OpCallId,
    pub op_name: String,
}

/// A vertex of the trace graph.
///
/// The parent set is fixed at creation. Only [`NodeKind::Parameter`] nodes
/// can be trainable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) index: u32,
    pub(crate) value: Value,
    pub(crate) kind: NodeKind,
    pub(crate) trainable: bool,
    pub(crate) description: String,
    pub(crate) producer: Option<Producer>,
    pub(crate) parents: Parents,
    /// Creation sequence number; breaks ties in topological order.
    #[serde(default)]
    pub(crate) seq: u64,
    #[serde(skip, default)]
    pub(crate) feedback: FeedbackMap,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Base name, e.g. `x`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-name counter distinguishing nodes that share a base name.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Display name, e.g. `x:0`.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.name, self.index)
    }

    /// Identifier used in prompts and parsed updates, e.g. `x0`.
    pub fn identifier(&self) -> String {
        format!("{}{}", self.name, self.index)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn producer(&self) -> Option<&Producer> {
        self.producer.as_ref()
    }

    /// Parents in the order the operator received them.
    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn feedback(&self) -> &FeedbackMap {
        &self.feedback
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Turns an arbitrary label into an identifier-safe base name.
///
/// Non-alphanumeric characters become `_`; a leading digit gets a `_` prefix
/// so `base + index` always reads as one identifier. A trailing digit gets a
/// `_` suffix: otherwise `x` at index 10 and `x1` at index 0 would both be
/// `x10`.
pub(crate) fn identifier_base(label: &str) -> String {
    let mut base: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if base.is_empty() {
        base.push_str("node");
    }
    if base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        base.push('_');
    }
    base
}

/// Renders a value the way it appears in prompts: strings unquoted,
/// everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
