//! Backward feedback propagation.
//!
//! [`backward`] walks the trace graph in reverse topological order from a
//! terminal node and deposits the terminal's feedback on every ancestor:
//!
//! 1. Reset every node's feedback (unless [`BackwardOptions::retain_feedback`]).
//! 2. Seed the terminal with the caller's payload, keyed by the terminal.
//! 3. Visit the terminal and its ancestors, children before parents. A
//!    visited node with feedback merges all of its entries into each parent,
//!    keyed by originating source and tagged with the child as the route.
//!
//! Because every child in scope is visited before its parents, one pass
//! reaches the fixpoint. A failed execution is not a separate path: its
//! exception node is simply the terminal.

use indexmap::IndexMap;

use crate::error::CoreError;
use crate::feedback::{Feedback, FeedbackAggregator};
use crate::graph::TraceGraph;
use crate::id::NodeId;
use crate::node::Parents;

/// Options for one backward pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardOptions {
    /// Keep feedback from earlier passes instead of zeroing the graph first.
    /// Used to accumulate several terminals before one optimizer step.
    pub retain_feedback: bool,
}

/// What a backward pass touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardReport {
    pub terminal: NodeId,
    /// The terminal followed by its ancestors, in visiting order.
    pub visited: Vec<NodeId>,
    /// Trainable nodes that received feedback in this pass.
    pub reached_parameters: Vec<NodeId>,
}

/// Propagates `feedback` from `terminal` to every ancestor of `terminal`.
///
/// Fails with [`CoreError::NodeNotFound`] for an unknown terminal,
/// [`CoreError::MissingParent`] if the closure invariant is broken and
/// [`CoreError::CycleDetected`] if the parent relation has a cycle. On error
/// no feedback is deposited beyond the optional reset.
pub fn backward(
    graph: &mut TraceGraph,
    terminal: NodeId,
    feedback: impl Into<Feedback>,
    options: BackwardOptions,
) -> Result<BackwardReport, CoreError> {
    graph.get(terminal)?;
    if !options.retain_feedback {
        graph.zero_feedback();
    }

    let scope = graph.ancestors(terminal)?;
    let order = graph.topological_order()?;
    let visited: Vec<NodeId> = order
        .into_iter()
        .rev()
        .filter(|id| *id == terminal || scope.contains(id))
        .collect();

    graph.feedback_mut(terminal)?.seed(terminal, feedback.into());

    let mut reached_parameters = Vec::new();
    for &id in &visited {
        let node = graph.get(id)?;
        if node.is_trainable() && !node.feedback().is_empty() {
            reached_parameters.push(id);
        }
        if node.feedback().is_empty() || node.parents().is_empty() {
            continue;
        }
        let incoming = node.feedback().clone();
        let parents: Parents = node.parents.clone();
        for parent in parents {
            graph.feedback_mut(parent)?.merge_from(&incoming, id);
        }
    }

    tracing::debug!(
        terminal = %terminal,
        visited = visited.len(),
        parameters = reached_parameters.len(),
        "backward pass complete"
    );

    Ok(BackwardReport {
        terminal,
        visited,
        reached_parameters,
    })
}

/// Trainable node → merged feedback, built once per optimizer step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationResult {
    feedback: IndexMap<NodeId, Feedback>,
}

impl PropagationResult {
    /// Collapses the feedback of every trainable node with `aggregator`.
    /// Parameters without feedback are left out.
    pub fn collect<A>(graph: &TraceGraph, aggregator: &A) -> Self
    where
        A: FeedbackAggregator + ?Sized,
    {
        let feedback = graph
            .nodes()
            .filter(|node| node.is_trainable())
            .filter_map(|node| {
                aggregator
                    .combine_map(node.feedback())
                    .map(|merged| (node.id(), merged))
            })
            .collect();
        PropagationResult { feedback }
    }

    pub fn get(&self, id: NodeId) -> Option<&Feedback> {
        self.feedback.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Feedback)> + '_ {
        self.feedback.iter().map(|(id, fb)| (*id, fb))
    }

    pub fn len(&self) -> usize {
        self.feedback.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feedback.is_empty()
    }
}
