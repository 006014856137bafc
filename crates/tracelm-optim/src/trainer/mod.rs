//! Minibatch training of traced agents.
//!
//! An [`Agent`] runs its computation on a [`TraceGraph`] and returns the
//! output node; a [`Guide`] scores the output and explains what is wrong.
//! [`MinibatchTrainer`] runs a batch, joins the outputs and the explanations
//! into one terminal and one feedback text, then lets the optimizer update
//! the agent's parameters.

pub mod loader;
pub mod minibatch;

use serde::{Deserialize, Serialize};
use tracelm_core::{BundleError, NodeId, TraceGraph, Value};

pub use loader::{DataLoader, Dataset};
pub use minibatch::{MinibatchTrainer, TrainingSummary};

/// A traced computation with trainable parameters.
///
/// The trainer clears every non-parameter node between runs, so constants
/// an agent reads must be created inside [`forward`](Agent::forward).
pub trait Agent {
    type Input;

    /// Runs on `input`, recording every operator on `graph`, and returns the
    /// output node. A captured operator failure is returned as
    /// [`BundleError::Execution`]; its exception node is judged like any
    /// other output.
    fn forward(&mut self, graph: &mut TraceGraph, input: &Self::Input) -> Result<NodeId, BundleError>;

    /// The parameter nodes the optimizer may rewrite.
    fn parameters(&self) -> Vec<NodeId>;
}

/// A guide's verdict on one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub score: f64,
    pub feedback: String,
}

impl Judgement {
    pub fn new(score: f64, feedback: impl Into<String>) -> Self {
        Judgement {
            score,
            feedback: feedback.into(),
        }
    }
}

/// Judges an agent's output for input `I` given side information `T`.
pub trait Guide<I, T> {
    fn judge(&self, input: &I, output: &Value, info: &T) -> Judgement;
}

impl<I, T, F> Guide<I, T> for F
where
    F: Fn(&I, &Value, &T) -> Judgement,
{
    fn judge(&self, input: &I, output: &Value, info: &T) -> Judgement {
        self(input, output, info)
    }
}
