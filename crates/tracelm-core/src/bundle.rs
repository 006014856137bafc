//! Operator adapter: turns a callable into a traced graph operator.
//!
//! A [`Bundle`] runs a callable against the values of its input nodes and
//! registers the result as a message node whose parents are the inputs. The
//! callable reads values through an [`OpContext`], which also records every
//! node it touches so that dependencies read from enclosing state cannot go
//! unnoticed: they either become parents too (when
//! [`Bundle::allow_external_dependencies`] is set) or the call is rejected
//! with [`CoreError::MissingInputs`].
//!
//! A callable that fails is captured as an exception node carrying the
//! failure description, returned as [`BundleError::Execution`]. That node is
//! the terminal a backward pass starts from when a run fails.

use indexmap::IndexSet;

use crate::error::{BundleError, CoreError, ExecutionFailure, OpError};
use crate::graph::{contain, TraceGraph};
use crate::id::NodeId;
use crate::node::{value_text, NodeKind, Producer, Value};

/// Read access to the graph for one operator invocation.
pub struct OpContext<'g> {
    graph: &'g TraceGraph,
    op: &'g str,
    inputs: &'g [NodeId],
    used: IndexSet<NodeId>,
}

impl<'g> OpContext<'g> {
    fn new(graph: &'g TraceGraph, op: &'g str, inputs: &'g [NodeId]) -> Self {
        OpContext {
            graph,
            op,
            inputs,
            used: IndexSet::new(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Value of the `index`-th declared input.
    pub fn input(&mut self, index: usize) -> Result<&'g Value, CoreError> {
        let id = *self.inputs.get(index).ok_or_else(|| CoreError::InputOutOfRange {
            op: self.op.to_string(),
            index,
            count: self.inputs.len(),
        })?;
        self.read(id)
    }

    /// Value of the `index`-th input rendered as text.
    pub fn input_text(&mut self, index: usize) -> Result<String, CoreError> {
        self.input(index).map(value_text)
    }

    /// Reads any node in the graph and records it as used by this operator.
    pub fn read(&mut self, id: NodeId) -> Result<&'g Value, CoreError> {
        let graph: &'g TraceGraph = self.graph;
        let node = graph.get(id)?;
        self.used.insert(id);
        Ok(node.value())
    }
}

/// A traced operator.
#[derive(Debug, Clone)]
pub struct Bundle {
    name: String,
    description: String,
    catch_execution_error: bool,
    allow_external_dependencies: bool,
}

impl Bundle {
    /// Creates an operator named `name` with description `[name]`, capturing
    /// execution failures and rejecting undeclared dependencies.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Bundle {
            description: format!("[{}]", name),
            name,
            catch_execution_error: true,
            allow_external_dependencies: false,
        }
    }

    /// Sets the operator documentation shown to the optimizer as
    /// `[name] doc`.
    pub fn describe(mut self, doc: impl AsRef<str>) -> Self {
        self.description = format!("[{}] {}", self.name, doc.as_ref().trim());
        self
    }

    pub fn catch_execution_error(mut self, catch: bool) -> Self {
        self.catch_execution_error = catch;
        self
    }

    pub fn allow_external_dependencies(mut self, allow: bool) -> Self {
        self.allow_external_dependencies = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Runs `f` and records its output in `graph`.
    ///
    /// Parents of the new node are `inputs` followed by any external
    /// dependencies the callable read.
    pub fn call<F>(&self, graph: &mut TraceGraph, inputs: &[NodeId], f: F) -> Result<NodeId, BundleError>
    where
        F: FnOnce(&mut OpContext<'_>) -> Result<Value, OpError>,
    {
        let outputs = self.invoke(graph, inputs, self.wiring(), 1, |ctx| f(ctx).map(|value| vec![value]))?;
        single(outputs, &self.name)
    }

    /// Runs an operator with `n_outputs` results and records each one as its
    /// own message node.
    ///
    /// All outputs share the parents and the [`OpCallId`](crate::id::OpCallId)
    /// of the call. Returning a different number of values is an execution
    /// failure.
    pub fn call_multi<F>(
        &self,
        graph: &mut TraceGraph,
        inputs: &[NodeId],
        n_outputs: usize,
        f: F,
    ) -> Result<Vec<NodeId>, BundleError>
    where
        F: FnOnce(&mut OpContext<'_>) -> Result<Vec<Value>, OpError>,
    {
        self.invoke(graph, inputs, self.wiring(), n_outputs, f)
    }

    /// Turns the operator's code into a trainable `__code` parameter.
    ///
    /// `code` is the initial source; its first line is kept as the signature
    /// the optimizer must preserve. `interpreter` evaluates the current code
    /// against the inputs on every call.
    pub fn trainable<I>(self, code: impl Into<String>, interpreter: I) -> TrainableBundle<I>
    where
        I: Fn(&str, &mut OpContext<'_>) -> Result<Value, OpError>,
    {
        TrainableBundle {
            bundle: self,
            code: code.into(),
            parameter: None,
            interpreter,
        }
    }

    fn wiring(&self) -> Wiring<'_> {
        Wiring {
            op_name: &self.name,
            description: &self.description,
            code: None,
        }
    }

    fn invoke<F>(
        &self,
        graph: &mut TraceGraph,
        inputs: &[NodeId],
        wiring: Wiring<'_>,
        n_outputs: usize,
        f: F,
    ) -> Result<Vec<NodeId>, BundleError>
    where
        F: FnOnce(&mut OpContext<'_>) -> Result<Vec<Value>, OpError>,
    {
        for &input in inputs {
            graph.get(input)?;
        }

        let (outcome, used) = {
            let mut ctx = OpContext::new(graph, &self.name, inputs);
            let outcome = f(&mut ctx);
            (outcome, ctx.used)
        };

        let external: Vec<NodeId> = used
            .into_iter()
            .filter(|id| !contain(inputs, *id) && Some(*id) != wiring.code)
            .collect();
        if !external.is_empty() && !self.allow_external_dependencies {
            let missing = external
                .iter()
                .filter_map(|id| graph.node(*id))
                .map(|node| node.display_name())
                .collect();
            return Err(CoreError::MissingInputs {
                op: self.name.clone(),
                missing,
            }
            .into());
        }

        let mut parents = inputs.to_vec();
        parents.extend(external);
        parents.extend(wiring.code);
        let producer = Producer {
            call: graph.next_call_id(),
            op_name: wiring.op_name.to_string(),
        };

        let message = match outcome {
            Ok(values) if values.len() == n_outputs => {
                let mut outputs = Vec::with_capacity(n_outputs);
                for value in values {
                    outputs.push(graph.add_message(
                        wiring.op_name,
                        value,
                        wiring.description,
                        &parents,
                        producer.clone(),
                    )?);
                }
                return Ok(outputs);
            }
            Ok(values) => format!("returned {} output(s), expected {}", values.len(), n_outputs),
            Err(OpError::Trace(err)) => return Err(err.into()),
            Err(OpError::Failed(message)) => message,
        };

        if !self.catch_execution_error {
            return Err(BundleError::Uncaught {
                op: wiring.op_name.to_string(),
                message,
            });
        }
        let description = format!("[exception] The operator {} raises an exception.", wiring.op_name);
        let node = graph.add_exception(
            &format!("exception_{}", wiring.op_name),
            message.clone(),
            description,
            &parents,
            producer,
        )?;
        tracing::debug!(op = %wiring.op_name, node = %node, "captured execution failure");
        Err(ExecutionFailure {
            node,
            op: wiring.op_name.to_string(),
            message,
        }
        .into())
    }

    /// Like [`call`](Self::call) for callables that only need the input
    /// values, in declaration order.
    pub fn call_values<F>(&self, graph: &mut TraceGraph, inputs: &[NodeId], f: F) -> Result<NodeId, BundleError>
    where
        F: FnOnce(&[&Value]) -> Result<Value, String>,
    {
        self.call(graph, inputs, |ctx| {
            let mut values = Vec::with_capacity(ctx.input_count());
            for index in 0..ctx.input_count() {
                values.push(ctx.input(index)?);
            }
            f(&values).map_err(OpError::Failed)
        })
    }
}

/// How the nodes of one invocation are named, documented and wired.
struct Wiring<'a> {
    op_name: &'a str,
    description: &'a str,
    /// Code parameter appended to the parents of every output.
    code: Option<NodeId>,
}

fn single(mut outputs: Vec<NodeId>, op: &str) -> Result<NodeId, BundleError> {
    match (outputs.pop(), outputs.is_empty()) {
        (Some(id), true) => Ok(id),
        _ => Err(CoreError::GraphInconsistency {
            reason: format!("operator '{}' did not produce exactly one node", op),
        }
        .into()),
    }
}

const EVAL_DESCRIPTION: &str = "[eval] This operator eval(__code, *args) evaluates the code block, where \
__code is the code (str) and *args are the inputs of the operator. The output is the result of the \
evaluation, i.e., __code(*args).";

/// An operator whose code is itself a parameter.
///
/// Every call records an `eval` node whose parents are the inputs followed
/// by the `__code` parameter, so feedback on the output reaches the code and
/// an optimizer step can rewrite it. The parameter is created on the first
/// call and reused afterwards, including after
/// [`TraceGraph::clear_trace`].
pub struct TrainableBundle<I> {
    bundle: Bundle,
    code: String,
    parameter: Option<NodeId>,
    interpreter: I,
}

impl<I> TrainableBundle<I>
where
    I: Fn(&str, &mut OpContext<'_>) -> Result<Value, OpError>,
{
    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    /// The `__code` parameter, once registered.
    pub fn parameter(&self) -> Option<NodeId> {
        self.parameter
    }

    /// Registers the `__code` parameter in `graph`, or returns the one
    /// registered by an earlier call.
    pub fn code_parameter(&mut self, graph: &mut TraceGraph) -> NodeId {
        if let Some(id) = self.parameter {
            if graph.node(id).is_some_and(|node| node.kind() == NodeKind::Parameter) {
                return id;
            }
        }
        let signature = self.code.lines().next().unwrap_or_default();
        let constraint = format!("The code should start with:\n{}", signature);
        let id = graph.add_parameter("__code", self.code.clone(), constraint);
        self.parameter = Some(id);
        id
    }

    /// Evaluates the current code against `inputs`.
    ///
    /// Failures are captured as `exception_eval` nodes that also have the
    /// code parameter as a parent.
    pub fn call(&mut self, graph: &mut TraceGraph, inputs: &[NodeId]) -> Result<NodeId, BundleError> {
        let code_id = self.code_parameter(graph);
        let code = value_text(graph.get(code_id)?.value());
        let interpreter = &self.interpreter;
        let wiring = Wiring {
            op_name: "eval",
            description: EVAL_DESCRIPTION,
            code: Some(code_id),
        };
        let outputs = self
            .bundle
            .invoke(graph, inputs, wiring, 1, |ctx| interpreter(code.as_str(), ctx).map(|value| vec![value]))?;
        single(outputs, "eval")
    }
}

/// Joins several nodes into one text node, one `ID [i]: value` line each.
///
/// Used to turn a minibatch of outputs into a single terminal.
pub fn concat_as_text(graph: &mut TraceGraph, items: &[NodeId]) -> Result<NodeId, BundleError> {
    Bundle::new("concat_list_as_str")
        .describe("Concatenate the items into a single string")
        .call_values(graph, items, |values| {
            Ok(Value::String(numbered_lines(values.iter().map(|v| value_text(v)))))
        })
}

/// Formats items as `ID [i]: item` lines, each ending in a newline.
pub fn numbered_lines<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| format!("ID [{}]: {}\n", i, item.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagate::{backward, BackwardOptions};

    #[test]
    fn call_records_inputs_as_parents() {
        let mut graph = TraceGraph::new();
        let a = graph.add_constant("a", 2);
        let b = graph.add_parameter("b", 3, "");
        let add = Bundle::new("add").describe("Adds two numbers.");

        let sum = add
            .call_values(&mut graph, &[a, b], |v| {
                let total = v[0].as_i64().unwrap_or(0) + v[1].as_i64().unwrap_or(0);
                Ok(Value::from(total))
            })
            .unwrap();

        let node = graph.get(sum).unwrap();
        assert_eq!(node.value(), &Value::from(5));
        assert_eq!(node.parents(), &[a, b]);
        assert_eq!(node.description(), "[add] Adds two numbers.");
        assert_eq!(node.producer().unwrap().op_name, "add");
        assert_eq!(node.kind(), NodeKind::Message);
    }

    #[test]
    fn failure_becomes_exception_node() {
        let mut graph = TraceGraph::new();
        let x = graph.add_parameter("x", "abc", "");
        let parse = Bundle::new("parse_int");

        let err = parse
            .call_values(&mut graph, &[x], |v| {
                v[0].as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .ok_or_else(|| "invalid digit found in string".to_string())
            })
            .unwrap_err();

        let failure = err.execution_failure().unwrap().clone();
        let node = graph.get(failure.node).unwrap();
        assert_eq!(node.kind(), NodeKind::Exception);
        assert_eq!(node.value(), &Value::from("invalid digit found in string"));
        assert_eq!(node.parents(), &[x]);
        assert_eq!(node.identifier(), "exception_parse_int0");
    }

    #[test]
    fn uncaught_failure_leaves_no_node() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 1);
        let err = Bundle::new("boom")
            .catch_execution_error(false)
            .call(&mut graph, &[x], |_| Err(OpError::failed("boom")))
            .unwrap_err();
        assert!(matches!(err, BundleError::Uncaught { .. }));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn undeclared_reads_are_rejected() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 1);
        let hidden = graph.add_parameter("hidden", 10, "");

        let err = Bundle::new("peek")
            .call(&mut graph, &[x], |ctx| {
                let a = ctx.input(0)?.as_i64().unwrap_or(0);
                let b = ctx.read(hidden)?.as_i64().unwrap_or(0);
                Ok(Value::from(a + b))
            })
            .unwrap_err();
        assert_eq!(
            err,
            BundleError::Core(CoreError::MissingInputs {
                op: "peek".into(),
                missing: vec!["hidden:0".into()],
            })
        );
    }

    #[test]
    fn allowed_external_dependencies_become_parents() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 1);
        let hidden = graph.add_parameter("hidden", 10, "");

        let y = Bundle::new("peek")
            .allow_external_dependencies(true)
            .call(&mut graph, &[x], |ctx| {
                let a = ctx.input(0)?.as_i64().unwrap_or(0);
                let b = ctx.read(hidden)?.as_i64().unwrap_or(0);
                Ok(Value::from(a + b))
            })
            .unwrap();
        assert_eq!(graph.parents(y).unwrap(), &[x, hidden]);
    }

    #[test]
    fn bad_input_index_is_structural() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 1);
        let err = Bundle::new("second")
            .call(&mut graph, &[x], |ctx| ctx.input(1).cloned().map_err(OpError::from))
            .unwrap_err();
        assert!(matches!(
            err,
            BundleError::Core(CoreError::InputOutOfRange { index: 1, count: 1, .. })
        ));
    }

    #[test]
    fn multi_output_nodes_share_one_call() {
        let mut graph = TraceGraph::new();
        let text = graph.add_constant("text", "key=value");
        let outputs = Bundle::new("split")
            .call_multi(&mut graph, &[text], 2, |ctx| {
                let raw = ctx.input_text(0)?;
                let (key, value) = raw.split_once('=').ok_or("no '=' in input")?;
                Ok(vec![Value::from(key), Value::from(value)])
            })
            .unwrap();

        assert_eq!(outputs.len(), 2);
        let first = graph.get(outputs[0]).unwrap();
        let second = graph.get(outputs[1]).unwrap();
        assert_eq!(first.value(), &Value::from("key"));
        assert_eq!(second.value(), &Value::from("value"));
        assert_eq!(first.identifier(), "split0");
        assert_eq!(second.identifier(), "split1");
        assert_eq!(first.parents(), &[text]);
        assert_eq!(second.parents(), &[text]);
        assert_eq!(first.producer().unwrap().call, second.producer().unwrap().call);
    }

    #[test]
    fn wrong_output_count_is_an_execution_failure() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 1);
        let err = Bundle::new("pair")
            .call_multi(&mut graph, &[x], 2, |_| Ok(vec![Value::from(1)]))
            .unwrap_err();
        let failure = err.execution_failure().unwrap();
        assert_eq!(failure.message, "returned 1 output(s), expected 2");
        assert_eq!(graph.get(failure.node).unwrap().parents(), &[x]);
    }

    fn evaluate(code: &str, ctx: &mut OpContext<'_>) -> Result<Value, OpError> {
        let n = ctx.input(0)?.as_i64().unwrap_or(0);
        match code.lines().nth(1).map(str::trim) {
            Some("x + 1") => Ok(Value::from(n + 1)),
            Some("x * 2") => Ok(Value::from(n * 2)),
            other => Err(OpError::failed(format!("cannot evaluate {:?}", other))),
        }
    }

    #[test]
    fn trainable_operator_exposes_its_code() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 3);
        let mut op = Bundle::new("transform").trainable("fn transform(x)\n    x + 1", evaluate);

        let y = op.call(&mut graph, &[x]).unwrap();
        let code = op.parameter().unwrap();
        let node = graph.get(y).unwrap();
        assert_eq!(node.value(), &Value::from(4));
        assert_eq!(node.parents(), &[x, code]);
        assert_eq!(node.identifier(), "eval0");
        assert!(node.description().starts_with("[eval]"));
        assert_eq!(graph.get(code).unwrap().identifier(), "__code0");
        assert_eq!(
            graph.get(code).unwrap().description(),
            "The code should start with:\nfn transform(x)"
        );
        assert_eq!(graph.parameters(), vec![code]);

        let report = backward(&mut graph, y, "should double", BackwardOptions::default()).unwrap();
        assert!(report.visited.contains(&code));
        assert!(!graph.feedback(code).unwrap().is_empty());

        // A rewritten code parameter drives the next run.
        graph.set_value(code, "fn transform(x)\n    x * 2").unwrap();
        graph.clear_trace();
        let x = graph.add_constant("x", 3);
        let y = op.call(&mut graph, &[x]).unwrap();
        assert_eq!(op.parameter(), Some(code));
        assert_eq!(graph.get(y).unwrap().value(), &Value::from(6));
        assert_eq!(graph.parameters(), vec![code]);
    }

    #[test]
    fn broken_code_fails_with_the_code_as_parent() {
        let mut graph = TraceGraph::new();
        let x = graph.add_constant("x", 3);
        let mut op = Bundle::new("transform").trainable("fn transform(x)\n    x ** 3", evaluate);

        let err = op.call(&mut graph, &[x]).unwrap_err();
        let failure = err.execution_failure().unwrap().clone();
        let code = op.parameter().unwrap();
        let node = graph.get(failure.node).unwrap();
        assert_eq!(node.identifier(), "exception_eval0");
        assert_eq!(node.parents(), &[x, code]);

        let report = backward(&mut graph, failure.node, "fix the code", BackwardOptions::default()).unwrap();
        assert!(report.visited.contains(&code));
    }

    #[test]
    fn concat_as_text_formats_ids() {
        let mut graph = TraceGraph::new();
        let a = graph.add_constant("a", "first");
        let b = graph.add_constant("b", 2);
        let joined = concat_as_text(&mut graph, &[a, b]).unwrap();
        assert_eq!(
            graph.get(joined).unwrap().value(),
            &Value::from("ID [0]: first\nID [1]: 2\n")
        );
        assert_eq!(graph.parents(joined).unwrap(), &[a, b]);
    }
}
