//! The problem statement shown to the provider at each step.
//!
//! [`ProblemContext::from_graph`] looks at the nodes that received feedback
//! from the same terminals as the optimized parameters and lays them out as
//! a small program: the calls that were made, what each operator does, the
//! variables that may change, the fixed inputs, intermediate values, the
//! outputs that were judged and the merged feedback.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use tracelm_core::{value_text, CoreError, Feedback, FeedbackAggregator, NodeId, TraceGraph, Value};

/// One named value in a context section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub identifier: String,
    pub type_label: String,
    pub value: String,
    pub description: String,
}

impl ContextEntry {
    fn render(&self) -> String {
        format!("({}) {}={}", self.type_label, self.identifier, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProblemContext {
    pub instruction: String,
    /// `y0 = op(x0, x1)` lines in topological order.
    pub code: Vec<String>,
    /// Operator name → description.
    pub documentation: IndexMap<String, String>,
    pub variables: Vec<ContextEntry>,
    pub inputs: Vec<ContextEntry>,
    pub others: Vec<ContextEntry>,
    pub outputs: Vec<ContextEntry>,
    pub feedback: String,
}

impl ProblemContext {
    /// Builds the context for `parameters` from the feedback currently on
    /// the graph. Parameters without feedback contribute nothing, and frozen
    /// ones are shown as inputs.
    pub fn from_graph<A>(
        graph: &TraceGraph,
        parameters: &[NodeId],
        instruction: &str,
        aggregator: &A,
    ) -> Result<Self, CoreError>
    where
        A: FeedbackAggregator + ?Sized,
    {
        let mut trainable = Vec::with_capacity(parameters.len());
        for &param in parameters {
            let node = graph.get(param)?;
            if node.is_trainable() {
                trainable.push(param);
            }
        }

        let mut sources: IndexSet<NodeId> = IndexSet::new();
        let mut payloads: Vec<&Feedback> = Vec::new();
        for &param in &trainable {
            for (source, entry) in graph.feedback(param)?.iter() {
                if sources.insert(source) {
                    payloads.extend(entry.payloads());
                }
            }
        }

        let mut context = ProblemContext {
            instruction: instruction.to_string(),
            feedback: if payloads.is_empty() {
                String::new()
            } else {
                aggregator.combine(&payloads).to_string()
            },
            ..ProblemContext::default()
        };

        for id in graph.topological_order()? {
            let node = graph.get(id)?;
            if !node.feedback().sources().any(|s| sources.contains(&s)) {
                continue;
            }

            if let Some(producer) = node.producer() {
                let args: Vec<String> = node
                    .parents()
                    .iter()
                    .map(|&p| graph.get(p).map(|parent| parent.identifier()))
                    .collect::<Result<_, _>>()?;
                context.code.push(format!(
                    "{} = {}({})",
                    node.identifier(),
                    producer.op_name,
                    args.join(", ")
                ));
                context
                    .documentation
                    .entry(producer.op_name.clone())
                    .or_insert_with(|| node.description().to_string());
            }

            let entry = ContextEntry {
                identifier: node.identifier(),
                type_label: type_label(node.value()).to_string(),
                value: value_text(node.value()),
                description: node.description().to_string(),
            };
            if trainable.contains(&id) {
                context.variables.push(entry);
            } else if sources.contains(&id) {
                context.outputs.push(entry);
            } else if node.kind().is_leaf() {
                context.inputs.push(entry);
            } else {
                context.others.push(entry);
            }
        }

        Ok(context)
    }

    /// True when no parameter received feedback.
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// The `#Variables` block alone, used for step memory.
    pub fn variables_block(&self) -> String {
        self.variables
            .iter()
            .map(ContextEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Renders the sections as the user message body.
    pub fn render(&self) -> String {
        let mut out = String::new();
        push_section(&mut out, "#Instruction", &self.instruction);
        push_section(&mut out, "#Code", &self.code.join("\n"));
        let docs: Vec<String> = self
            .documentation
            .iter()
            .map(|(op, doc)| {
                if doc.starts_with('[') {
                    doc.clone()
                } else {
                    format!("[{}] {}", op, doc)
                }
            })
            .collect();
        push_section(&mut out, "#Documentation", &docs.join("\n"));
        push_section(&mut out, "#Variables", &self.variables_block());
        let constraints: Vec<String> = self
            .variables
            .iter()
            .filter(|v| !v.description.is_empty())
            .map(|v| format!("{}: {}", v.identifier, v.description))
            .collect();
        push_section(&mut out, "#Constraints", &constraints.join("\n"));
        push_section(&mut out, "#Inputs", &render_entries(&self.inputs));
        push_section(&mut out, "#Others", &render_entries(&self.others));
        push_section(&mut out, "#Outputs", &render_entries(&self.outputs));
        push_section(&mut out, "#Feedback", &self.feedback);
        out.trim_end().to_string()
    }
}

fn render_entries(entries: &[ContextEntry]) -> String {
    entries
        .iter()
        .map(ContextEntry::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Empty sections other than `#Variables` and `#Feedback` are omitted.
fn push_section(out: &mut String, title: &str, body: &str) {
    if body.is_empty() && !matches!(title, "#Variables" | "#Feedback") {
        return;
    }
    out.push_str(title);
    out.push('\n');
    out.push_str(body);
    out.push_str("\n\n");
}

/// Short type name of a value as shown in prompts.
pub fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
