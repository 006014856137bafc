//! The minibatch update loop.

use serde::Serialize;
use tracing::{debug, info, warn};

use tracelm_core::{concat_as_text, numbered_lines, value_text, BundleError, NodeId, TraceGraph, Value};

use crate::config::TrainerConfig;
use crate::error::OptimError;
use crate::llm::LlmProvider;
use crate::optimizer::Optimizer;
use crate::trainer::loader::{DataLoader, Dataset};
use crate::trainer::{Agent, Guide};

/// Scores gathered during [`MinibatchTrainer::train`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingSummary {
    /// Number of optimizer updates performed.
    pub iterations: usize,
    /// Score of every training instance, in visiting order.
    pub train_scores: Vec<f64>,
    /// `(iteration, mean test score)` for every evaluation.
    pub test_scores: Vec<(usize, f64)>,
    /// Updates whose provider call failed; training continued without them.
    pub failed_steps: usize,
}

struct Outcome {
    target: NodeId,
    score: f64,
    feedback: String,
}

/// Forwards each minibatch, joins outputs and feedback, and runs one
/// optimizer update per batch.
pub struct MinibatchTrainer<A, P> {
    agent: A,
    optimizer: Optimizer<P>,
    config: TrainerConfig,
    iterations: usize,
}

impl<A, P> MinibatchTrainer<A, P>
where
    A: Agent,
    P: LlmProvider,
{
    pub fn new(agent: A, optimizer: Optimizer<P>, config: TrainerConfig) -> Self {
        MinibatchTrainer {
            agent,
            optimizer,
            config,
            iterations: 0,
        }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn optimizer(&self) -> &Optimizer<P> {
        &self.optimizer
    }

    pub fn into_parts(self) -> (A, Optimizer<P>) {
        (self.agent, self.optimizer)
    }

    /// Trains on `train` for the configured number of epochs.
    ///
    /// When `test` is given and `eval_frequency > 0`, the agent is evaluated
    /// before training and after every `eval_frequency` updates. The per-run
    /// part of the trace is cleared after every update and evaluation.
    pub async fn train<T, G>(
        &mut self,
        graph: &mut TraceGraph,
        guide: &G,
        train: &Dataset<A::Input, T>,
        test: Option<&Dataset<A::Input, T>>,
    ) -> Result<TrainingSummary, OptimError>
    where
        G: Guide<A::Input, T>,
    {
        let eval_frequency = self.config.eval_frequency;
        let log_frequency = self.config.log_frequency.unwrap_or(eval_frequency);
        let mut summary = TrainingSummary::default();

        if let Some(test) = test.filter(|_| eval_frequency > 0) {
            let score = self.evaluate(graph, guide, test)?;
            summary.test_scores.push((self.iterations, score));
        }

        let loader = DataLoader::new(train, self.config.batch_size, self.config.shuffle_seed);
        for epoch in 0..self.config.num_epochs {
            for batch in loader.batches(epoch) {
                let mut targets = Vec::with_capacity(batch.len());
                let mut feedbacks = Vec::with_capacity(batch.len());
                for (input, info) in batch {
                    let outcome = self.forward_one(graph, guide, input, info)?;
                    targets.push(outcome.target);
                    feedbacks.push(outcome.feedback);
                    summary.train_scores.push(outcome.score);
                }

                let target = match concat_as_text(graph, &targets) {
                    Ok(target) => target,
                    Err(BundleError::Execution(failure)) => failure.node,
                    Err(err) => return Err(err.into()),
                };
                let feedback = numbered_lines(&feedbacks);

                if let Err(err) = self.update(graph, target, feedback).await {
                    match err {
                        OptimError::Provider(message) => {
                            warn!(iteration = self.iterations, %message, "update failed, continuing");
                            summary.failed_steps += 1;
                        }
                        other => return Err(other),
                    }
                }
                graph.clear_trace();
                self.iterations += 1;

                if let Some(test) = test.filter(|_| eval_frequency > 0 && self.iterations % eval_frequency == 0) {
                    let score = self.evaluate(graph, guide, test)?;
                    summary.test_scores.push((self.iterations, score));
                }

                if log_frequency > 0 && self.iterations % log_frequency == 0 {
                    info!(
                        epoch,
                        iteration = self.iterations,
                        train_score = mean(&summary.train_scores),
                        "training progress"
                    );
                    for id in self.agent.parameters() {
                        if let Ok(node) = graph.get(id) {
                            debug!(parameter = %node.identifier(), value = %value_text(node.value()));
                        }
                    }
                }
            }
        }

        summary.iterations = self.iterations;
        Ok(summary)
    }

    /// Resets feedback, propagates `feedback` from `target` and steps.
    pub async fn update(
        &mut self,
        graph: &mut TraceGraph,
        target: NodeId,
        feedback: String,
    ) -> Result<(), OptimError> {
        self.optimizer.zero_feedback(graph);
        self.optimizer.backward(graph, target, feedback)?;
        self.optimizer.step(graph).await?;
        Ok(())
    }

    /// Mean score over `dataset` without recording a trace. Instances whose
    /// forward pass fails score `min_score`.
    pub fn evaluate<T, G>(&mut self, graph: &mut TraceGraph, guide: &G, dataset: &Dataset<A::Input, T>) -> Result<f64, OptimError>
    where
        G: Guide<A::Input, T>,
    {
        let was_recording = graph.is_recording();
        graph.set_recording(false);

        let mut scores = Vec::with_capacity(dataset.len());
        let mut failure: Option<OptimError> = None;
        for (input, info) in dataset.iter() {
            match self.agent.forward(graph, input) {
                Ok(output) => match graph.get(output) {
                    Ok(node) => scores.push(guide.judge(input, node.value(), info).score),
                    Err(err) => {
                        failure = Some(err.into());
                        break;
                    }
                },
                Err(BundleError::Execution(_)) => scores.push(self.config.min_score),
                Err(err) => {
                    failure = Some(err.into());
                    break;
                }
            }
        }

        graph.set_recording(was_recording);
        graph.clear_trace();
        if let Some(err) = failure {
            return Err(err);
        }

        let score = mean(&scores);
        info!(iteration = self.iterations, test_score = score, "evaluation");
        Ok(score)
    }

    fn forward_one<T, G>(&mut self, graph: &mut TraceGraph, guide: &G, input: &A::Input, info: &T) -> Result<Outcome, OptimError>
    where
        G: Guide<A::Input, T>,
    {
        match self.agent.forward(graph, input) {
            Ok(target) => {
                let output = graph.get(target)?.value().clone();
                let judgement = guide.judge(input, &output, info);
                Ok(Outcome {
                    target,
                    score: judgement.score,
                    feedback: judgement.feedback,
                })
            }
            // The exception node is the output; the guide sees the failure text.
            Err(BundleError::Execution(failure)) => {
                debug!(op = %failure.op, node = %failure.node, "forward failed");
                let judgement = guide.judge(input, &Value::String(failure.message), info);
                Ok(Outcome {
                    target: failure.node,
                    score: judgement.score,
                    feedback: judgement.feedback,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 0.0, 0.5]), 0.5);
    }
}
