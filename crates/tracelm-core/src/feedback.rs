//! Feedback payloads and per-node feedback accumulation.
//!
//! A node's [`FeedbackMap`] is keyed by the *originating source*: the
//! terminal node a backward pass was seeded at. Entries are only ever added
//! to, never overwritten, so a node that is reached through several routes
//! keeps one entry per source together with the set of child nodes the
//! feedback arrived through. Collapsing the entries into one payload is the
//! job of a [`FeedbackAggregator`], which the optimizer applies when it
//! builds its request.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// A feedback payload: a free-form judgment, a scalar score, or a
/// structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Feedback {
    Text(String),
    Score(f64),
    Structured(serde_json::Value),
}

impl Feedback {
    /// Returns the text of a `Text` payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Feedback::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns `true` for an empty text payload or a null structured payload.
    pub fn is_empty(&self) -> bool {
        match self {
            Feedback::Text(text) => text.trim().is_empty(),
            Feedback::Score(_) => false,
            Feedback::Structured(value) => value.is_null(),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feedback::Text(text) => f.write_str(text),
            Feedback::Score(score) => write!(f, "{}", score),
            Feedback::Structured(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for Feedback {
    fn from(text: &str) -> Self {
        Feedback::Text(text.to_string())
    }
}

impl From<String> for Feedback {
    fn from(text: String) -> Self {
        Feedback::Text(text)
    }
}

impl From<f64> for Feedback {
    fn from(score: f64) -> Self {
        Feedback::Score(score)
    }
}

/// Feedback that originated at one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackEntry {
    payloads: Vec<Feedback>,
    routes: IndexSet<NodeId>,
}

impl FeedbackEntry {
    /// Distinct payloads delivered by this source, in arrival order.
    pub fn payloads(&self) -> &[Feedback] {
        &self.payloads
    }

    /// Child nodes this feedback arrived through. Empty on the seeded node.
    pub fn routes(&self) -> &IndexSet<NodeId> {
        &self.routes
    }

    fn push_payload(&mut self, payload: &Feedback) -> bool {
        if self.payloads.contains(payload) {
            return false;
        }
        self.payloads.push(payload.clone());
        true
    }
}

/// Feedback accumulated on one node, keyed by originating source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackMap {
    entries: IndexMap<NodeId, FeedbackEntry>,
}

impl FeedbackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct sources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, source: NodeId) -> Option<&FeedbackEntry> {
        self.entries.get(&source)
    }

    /// Sources in the order they first reached this node.
    pub fn sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &FeedbackEntry)> + '_ {
        self.entries.iter().map(|(source, entry)| (*source, entry))
    }

    /// Every payload held by this node, grouped by source.
    pub fn payloads(&self) -> impl Iterator<Item = &Feedback> + '_ {
        self.entries.values().flat_map(|entry| entry.payloads.iter())
    }

    /// Deposits a payload originating at `source` itself (the seed of a pass).
    ///
    /// Returns `true` if the map changed.
    pub fn seed(&mut self, source: NodeId, payload: Feedback) -> bool {
        self.entries
            .entry(source)
            .or_default()
            .push_payload(&payload)
    }

    /// Merges every entry of `child` into this map, recording `via` as the
    /// route. Existing entries are extended, never replaced.
    ///
    /// Returns `true` if the map changed.
    pub fn merge_from(&mut self, child: &FeedbackMap, via: NodeId) -> bool {
        let mut changed = false;
        for (source, incoming) in &child.entries {
            let entry = self.entries.entry(*source).or_default();
            for payload in &incoming.payloads {
                changed |= entry.push_payload(payload);
            }
            changed |= entry.routes.insert(via);
        }
        changed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Combines the payloads accumulated on a node into one payload.
///
/// The combination policy is a product decision; any
/// `Fn(&[&Feedback]) -> Feedback` closure can stand in for this trait.
pub trait FeedbackAggregator {
    fn combine(&self, payloads: &[&Feedback]) -> Feedback;

    /// Convenience: combines every payload of a feedback map.
    fn combine_map(&self, map: &FeedbackMap) -> Option<Feedback> {
        if map.is_empty() {
            return None;
        }
        let payloads: Vec<&Feedback> = map.payloads().collect();
        Some(self.combine(&payloads))
    }
}

impl<F> FeedbackAggregator for F
where
    F: Fn(&[&Feedback]) -> Feedback,
{
    fn combine(&self, payloads: &[&Feedback]) -> Feedback {
        self(payloads)
    }
}

/// Default aggregation: scores are summed when every payload is a score,
/// otherwise payloads are rendered and joined with `separator`.
#[derive(Debug, Clone)]
pub struct ConcatAggregator {
    pub separator: String,
}

impl Default for ConcatAggregator {
    fn default() -> Self {
        ConcatAggregator {
            separator: "\n\n".to_string(),
        }
    }
}

impl ConcatAggregator {
    pub fn with_separator(separator: impl Into<String>) -> Self {
        ConcatAggregator {
            separator: separator.into(),
        }
    }
}

impl FeedbackAggregator for ConcatAggregator {
    fn combine(&self, payloads: &[&Feedback]) -> Feedback {
        match payloads {
            [] => Feedback::Text(String::new()),
            [single] => (*single).clone(),
            _ => {
                let scores: Option<Vec<f64>> = payloads
                    .iter()
                    .map(|p| match p {
                        Feedback::Score(s) => Some(*s),
                        _ => None,
                    })
                    .collect();
                if let Some(scores) = scores {
                    return Feedback::Score(scores.iter().sum());
                }
                let parts: Vec<String> = payloads
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| p.to_string())
                    .collect();
                Feedback::Text(parts.join(&self.separator))
            }
        }
    }
}
