//! Core error types for tracelm-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! structural failure modes of the trace graph and the operator adapter.

use thiserror::Error;

use crate::id::NodeId;

/// Structural errors produced by the trace graph.
///
/// Every variant indicates a defect in how the graph was built (or in an
/// exported graph that was loaded back); none of them is recoverable by
/// retrying the same call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A node id was not found in the graph.
    #[error("node not found: NodeId({id})")]
    NodeNotFound { id: NodeId },

    /// A node was created from (or references) a parent that is not in the graph.
    #[error("missing parent: node {node} references NodeId({parent}) which is not in the graph")]
    MissingParent { node: String, parent: NodeId },

    /// A cycle was found in the parent relation.
    #[error("cycle detected in trace graph at NodeId({at})")]
    CycleDetected { at: NodeId },

    /// An operator read nodes that were not declared as its inputs.
    #[error("operator '{op}' used nodes not declared as inputs: {missing:?}")]
    MissingInputs { op: String, missing: Vec<String> },

    /// Only parameter nodes carry a trainable flag.
    #[error("node {name} is not a parameter and cannot be trainable")]
    NotAParameter { name: String },

    /// An input index passed to an operator context was out of range.
    #[error("operator '{op}' has {count} input(s), index {index} is out of range")]
    InputOutOfRange {
        op: String,
        index: usize,
        count: usize,
    },

    /// Catch-all for invariants violated by a loaded graph.
    #[error("graph inconsistency: {reason}")]
    GraphInconsistency { reason: String },
}

/// Errors an operator callable can return from inside [`Bundle::call`](crate::bundle::Bundle::call).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    /// The callable misused its context (unknown node, bad input index).
    /// Reported as a structural error, never captured.
    #[error(transparent)]
    Trace(#[from] CoreError),

    /// The computation itself failed.
    #[error("{0}")]
    Failed(String),
}

impl OpError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        OpError::Failed(message.to_string())
    }
}

impl From<String> for OpError {
    fn from(message: String) -> Self {
        OpError::Failed(message)
    }
}

impl From<&str> for OpError {
    fn from(message: &str) -> Self {
        OpError::Failed(message.to_string())
    }
}

/// A forward execution failure captured as an exception node.
///
/// The exception node is already registered in the graph with the failing
/// operator's inputs as parents, so it can be used directly as the terminal
/// of a backward pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("operator '{op}' failed: {message}")]
pub struct ExecutionFailure {
    /// The exception node carrying the failure description.
    pub node: NodeId,
    /// Operator name.
    pub op: String,
    /// The failure description reported by the callable.
    pub message: String,
}

/// Errors returned by [`Bundle::call`](crate::bundle::Bundle::call).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BundleError {
    /// The graph rejected the operator's inputs.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The callable failed and the failure was captured as an exception node.
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    /// The callable failed and the operator was configured not to capture it.
    #[error("operator '{op}' failed (uncaught): {message}")]
    Uncaught { op: String, message: String },
}

impl BundleError {
    /// Returns the captured failure, if this error carries one.
    pub fn execution_failure(&self) -> Option<&ExecutionFailure> {
        match self {
            BundleError::Execution(failure) => Some(failure),
            _ => None,
        }
    }
}
