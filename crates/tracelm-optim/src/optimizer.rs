//! One optimization step: feedback in, new parameter values out.
//!
//! The optimizer owns no graph. Callers run a traced computation, seed
//! feedback with [`Optimizer::backward`] and then call [`Optimizer::step`],
//! which turns the feedback into a prompt, asks the provider for new values
//! and writes whatever part of the reply fits the parameters back into the
//! graph.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use tracelm_core::{
    backward, BackwardOptions, BackwardReport, ConcatAggregator, Feedback, FeedbackAggregator,
    NodeId, TraceGraph, Value,
};

use crate::config::OptimizerConfig;
use crate::context::ProblemContext;
use crate::error::OptimError;
use crate::llm::{LlmProvider, ProposalRequest};
use crate::parser::{parse_response, ParsedUpdate};
use crate::sanitize::escape_inner_quotes;

const EQUATION_FORMAT: &str = "Reply with one line per variable you want to change, in the form \
`name = new value`, using the names listed in #Variables. Wrap values that span several lines in \
triple quotes. Variables you do not mention keep their current value.";

const JSON_FORMAT: &str = "Reply with a JSON object of the form \
{\"reasoning\": \"...\", \"suggestion\": {\"name\": \"new value\"}}, using the names listed in \
#Variables. Variables you leave out keep their current value.";

/// A value written to a parameter by a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterChange {
    pub id: NodeId,
    pub identifier: String,
    pub before: Value,
    pub after: Value,
}

/// What applying a parsed update did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedUpdate {
    pub changes: Vec<ParameterChange>,
    /// Proposed names that are not parameters, or whose value did not fit.
    pub ignored: Vec<String>,
}

/// Log entry for one call to [`Optimizer::step`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: usize,
    pub feedback: String,
    pub reply: String,
    pub changes: Vec<ParameterChange>,
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MemoryEntry {
    variables: String,
    feedback: String,
}

/// LLM-backed optimizer over a fixed set of parameters.
pub struct Optimizer<P> {
    provider: P,
    parameters: Vec<NodeId>,
    config: OptimizerConfig,
    aggregator: Box<dyn FeedbackAggregator + Send + Sync>,
    memory: VecDeque<MemoryEntry>,
    log: Vec<StepRecord>,
}

impl<P: LlmProvider> Optimizer<P> {
    pub fn new(provider: P, parameters: Vec<NodeId>, config: OptimizerConfig) -> Self {
        let aggregator = Box::new(ConcatAggregator::with_separator(config.feedback_separator.clone()));
        Optimizer {
            provider,
            parameters,
            config,
            aggregator,
            memory: VecDeque::new(),
            log: Vec::new(),
        }
    }

    /// Replaces the feedback merge policy.
    pub fn with_aggregator(mut self, aggregator: impl FeedbackAggregator + Send + Sync + 'static) -> Self {
        self.aggregator = Box::new(aggregator);
        self
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Every step taken so far, oldest first.
    pub fn log(&self) -> &[StepRecord] {
        &self.log
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Clears all feedback on `graph` so the next step only sees fresh
    /// judgments.
    pub fn zero_feedback(&self, graph: &mut TraceGraph) {
        graph.zero_feedback();
    }

    /// Propagates `feedback` from `terminal`. Earlier feedback is kept, so
    /// several terminals can contribute to one step; call
    /// [`zero_feedback`](Self::zero_feedback) first to start over.
    pub fn backward(
        &self,
        graph: &mut TraceGraph,
        terminal: NodeId,
        feedback: impl Into<Feedback>,
    ) -> Result<BackwardReport, OptimError> {
        let options = BackwardOptions { retain_feedback: true };
        Ok(backward(graph, terminal, feedback, options)?)
    }

    // -----------------------------------------------------------------------
    // Step
    // -----------------------------------------------------------------------

    /// Builds the provider request for the feedback currently on `graph`.
    pub fn build_request(&self, graph: &TraceGraph) -> Result<(ProblemContext, ProposalRequest), OptimError> {
        let context =
            ProblemContext::from_graph(graph, &self.parameters, &self.config.objective, &*self.aggregator)?;

        let mut prompt = context.render();
        if !self.memory.is_empty() {
            prompt.push_str("\n\n#History");
            for (i, entry) in self.memory.iter().enumerate() {
                prompt.push_str(&format!(
                    "\nAttempt {}:\n{}\nFeedback: {}\n",
                    i + 1,
                    entry.variables,
                    entry.feedback
                ));
            }
        }
        prompt.push_str("\n\n");
        prompt.push_str(if self.config.json_mode { JSON_FORMAT } else { EQUATION_FORMAT });

        let request = ProposalRequest {
            system_prompt: None,
            user_prompt: prompt,
            json_mode: self.config.json_mode,
        };
        Ok((context, request))
    }

    /// Asks the provider for new values and applies them.
    ///
    /// A reply with nothing usable completes with no change. Provider
    /// failures are returned; retrying is up to the caller.
    pub async fn step(&mut self, graph: &mut TraceGraph) -> Result<StepRecord, OptimError> {
        let step = self.log.len();
        let (context, request) = self.build_request(graph)?;

        if context.is_empty() {
            info!(step, "no feedback reached the parameters, skipping provider call");
            let record = StepRecord {
                step,
                feedback: String::new(),
                reply: String::new(),
                changes: Vec::new(),
                ignored: Vec::new(),
            };
            self.log.push(record.clone());
            return Ok(record);
        }

        let reply = self.provider.propose(&request).await?;
        let update = parse_response(&reply, &self.config.sanitize);
        if update.is_empty() {
            warn!(step, "reply contained no parsable update");
        }
        let applied = self.apply_update(graph, update)?;

        if self.config.memory_size > 0 {
            self.memory.push_back(MemoryEntry {
                variables: context.variables_block(),
                feedback: context.feedback.clone(),
            });
            while self.memory.len() > self.config.memory_size {
                self.memory.pop_front();
            }
        }

        info!(
            step,
            changed = applied.changes.len(),
            ignored = applied.ignored.len(),
            "optimizer step"
        );
        let record = StepRecord {
            step,
            feedback: context.feedback,
            reply,
            changes: applied.changes,
            ignored: applied.ignored,
        };
        self.log.push(record.clone());
        Ok(record)
    }

    /// Writes the applicable part of `update` into the parameters.
    ///
    /// Names that are not identifiers of this optimizer's currently
    /// trainable parameters are ignored with a warning, as are values that
    /// cannot be cast to the parameter's current kind.
    pub fn apply_update(&self, graph: &mut TraceGraph, update: ParsedUpdate) -> Result<AppliedUpdate, OptimError> {
        let mut names: Vec<(String, NodeId)> = Vec::with_capacity(self.parameters.len());
        for &id in &self.parameters {
            let node = graph.get(id)?;
            if node.is_trainable() {
                names.push((node.identifier(), id));
            }
        }

        let (applicable, mut ignored) = update.restrict_to(names.iter().map(|(name, _)| name.as_str()));
        for name in &ignored {
            warn!(name = %name, "ignoring proposal for unknown parameter");
        }

        let mut changes = Vec::new();
        for (name, text) in applicable.iter() {
            let Some(&(_, id)) = names.iter().find(|(n, _)| n == name) else {
                continue;
            };
            let current = graph.get(id)?.value().clone();
            match cast_value(&current, text) {
                Some(new) if new == current => debug!(name, "proposal equals current value"),
                Some(new) => {
                    let before = graph.set_value(id, new.clone())?;
                    changes.push(ParameterChange {
                        id,
                        identifier: name.to_string(),
                        before,
                        after: new,
                    });
                }
                None => {
                    warn!(name, "proposal does not fit the parameter's current type");
                    ignored.push(name.to_string());
                }
            }
        }

        Ok(AppliedUpdate { changes, ignored })
    }
}

/// Converts proposed text to a value of the same JSON kind as `current`.
///
/// Strings take the text verbatim; numbers, booleans, arrays and objects
/// are parsed. `None` when the text does not fit. A `null` parameter
/// accepts any JSON, falling back to the text itself.
pub fn cast_value(current: &Value, text: &str) -> Option<Value> {
    let trimmed = text.trim();
    match current {
        Value::String(_) => Some(Value::String(text.to_string())),
        Value::Bool(_) => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Number(n) => {
            if !n.is_f64() {
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Some(Value::from(i));
                }
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        }
        Value::Array(_) | Value::Object(_) => {
            let parsed: Value = serde_json::from_str(trimmed)
                .or_else(|_| serde_json::from_str(&escape_inner_quotes(trimmed)))
                .ok()?;
            (std::mem::discriminant(&parsed) == std::mem::discriminant(current)).then_some(parsed)
        }
        Value::Null => Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(text.to_string()))),
    }
}
