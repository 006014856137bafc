//! Integration tests for backward feedback propagation.

use proptest::prelude::*;

use tracelm_core::{
    backward, Bundle, BackwardOptions, ConcatAggregator, CoreError, Feedback, NodeId,
    PropagationResult, Producer, TraceGraph, Value,
};

fn op(graph: &mut TraceGraph, name: &str, parents: &[NodeId]) -> NodeId {
    let producer = Producer {
        call: graph.next_call_id(),
        op_name: name.to_string(),
    };
    graph
        .add_message(name, Value::from(name), format!("[{}]", name), parents, producer)
        .unwrap()
}

#[test]
fn feedback_reaches_both_parameters_of_a_shared_operator() {
    let mut graph = TraceGraph::new();
    let p1 = graph.add_parameter("p", "first", "");
    let p2 = graph.add_parameter("p", "second", "");
    let bystander = graph.add_parameter("q", "untouched", "");
    let a = op(&mut graph, "a", &[p1, p2]);
    let t = op(&mut graph, "t", &[a]);
    let side = op(&mut graph, "side", &[bystander]);

    backward(&mut graph, t, "bad", BackwardOptions::default()).unwrap();

    for id in [p1, p2, a, t] {
        let entry = graph.feedback(id).unwrap().get(t).unwrap();
        assert_eq!(entry.payloads(), &[Feedback::from("bad")]);
    }
    assert!(graph.feedback(bystander).unwrap().is_empty());
    assert!(graph.feedback(side).unwrap().is_empty());
}

#[test]
fn reconverging_paths_keep_every_route() {
    // p -> left -> t, p -> right -> t
    let mut graph = TraceGraph::new();
    let p = graph.add_parameter("p", "v", "");
    let left = op(&mut graph, "left", &[p]);
    let right = op(&mut graph, "right", &[p]);
    let t = op(&mut graph, "t", &[left, right]);

    backward(&mut graph, t, "mixed", BackwardOptions::default()).unwrap();

    let feedback = graph.feedback(p).unwrap();
    assert_eq!(feedback.len(), 1);
    let entry = feedback.get(t).unwrap();
    assert_eq!(entry.payloads().len(), 1);
    let mut routes: Vec<NodeId> = entry.routes().iter().copied().collect();
    routes.sort();
    assert_eq!(routes, vec![left, right]);
}

#[test]
fn siblings_do_not_exchange_feedback() {
    let mut graph = TraceGraph::new();
    let p = graph.add_parameter("p", "v", "");
    let a = op(&mut graph, "a", &[p]);
    let b = op(&mut graph, "b", &[p]);

    backward(&mut graph, a, "only a", BackwardOptions::default()).unwrap();
    assert!(graph.feedback(b).unwrap().is_empty());
    assert!(!graph.feedback(p).unwrap().is_empty());
}

#[test]
fn zero_feedback_prevents_leakage_between_steps() {
    let mut graph = TraceGraph::new();
    let p = graph.add_parameter("p", "v", "");
    let first = op(&mut graph, "first", &[p]);
    let second = op(&mut graph, "second", &[p]);

    backward(&mut graph, first, "old", BackwardOptions::default()).unwrap();
    let stale = graph.feedback(p).unwrap().clone();

    backward(&mut graph, second, "new", BackwardOptions::default()).unwrap();
    let fresh = graph.feedback(p).unwrap();
    assert_ne!(&stale, fresh);
    assert!(fresh.get(first).is_none());
    assert!(graph.feedback(first).unwrap().is_empty());

    let mut clean = TraceGraph::new();
    let cp = clean.add_parameter("p", "v", "");
    let _ = op(&mut clean, "first", &[cp]);
    let cs = op(&mut clean, "second", &[cp]);
    backward(&mut clean, cs, "new", BackwardOptions::default()).unwrap();
    assert_eq!(clean.feedback(cp).unwrap(), fresh);
}

#[test]
fn retained_passes_accumulate_one_entry_per_terminal() {
    let mut graph = TraceGraph::new();
    let p = graph.add_parameter("p", "v", "");
    let t1 = op(&mut graph, "t", &[p]);
    let t2 = op(&mut graph, "t", &[p]);

    backward(&mut graph, t1, "one", BackwardOptions::default()).unwrap();
    backward(&mut graph, t2, "two", BackwardOptions { retain_feedback: true }).unwrap();

    let sources: Vec<NodeId> = graph.feedback(p).unwrap().sources().collect();
    assert_eq!(sources, vec![t1, t2]);

    let result = PropagationResult::collect(&graph, &ConcatAggregator::with_separator("\n"));
    assert_eq!(result.get(p), Some(&Feedback::from("one\ntwo")));
}

#[test]
fn failed_execution_is_an_ordinary_terminal() {
    let mut graph = TraceGraph::new();
    let code = graph.add_parameter("code", "return 1 / 0", "function body");
    let arg = graph.add_constant("arg", 3);

    let err = Bundle::new("run")
        .call_values(&mut graph, &[code, arg], |_| Err("ZeroDivisionError: division by zero".into()))
        .unwrap_err();
    let failure = err.execution_failure().unwrap();

    backward(
        &mut graph,
        failure.node,
        format!("The program crashed: {}", failure.message),
        BackwardOptions::default(),
    )
    .unwrap();

    let result = PropagationResult::collect(&graph, &ConcatAggregator::default());
    assert_eq!(result.len(), 1);
    assert_eq!(
        result.get(code),
        Some(&Feedback::from("The program crashed: ZeroDivisionError: division by zero"))
    );
    // Constants are ancestors too, but never part of the result.
    assert!(!graph.feedback(arg).unwrap().is_empty());
}

#[test]
fn loaded_graph_with_cycle_aborts_the_pass() {
    let mut graph = TraceGraph::new();
    let p = graph.add_parameter("p", "v", "");
    let a = op(&mut graph, "a", &[p]);
    let _ = op(&mut graph, "b", &[a]);

    // Rewire the export so that `p` claims `b` as a parent.
    let mut json = serde_json::to_value(&graph).unwrap();
    let nodes = json["graph"]["nodes"].as_array_mut().unwrap();
    nodes[0]["kind"] = serde_json::json!("message");
    nodes[0]["trainable"] = serde_json::json!(false);
    nodes[0]["parents"] = serde_json::json!([2]);
    let edges = json["graph"]["edges"].as_array_mut().unwrap();
    edges.push(serde_json::json!([2, 0, null]));
    let loaded: TraceGraph = serde_json::from_value(json).unwrap();

    assert!(matches!(loaded.validate(), Err(CoreError::CycleDetected { .. })));
    let mut loaded = loaded;
    let err = backward(&mut loaded, NodeId(2), "bad", BackwardOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::CycleDetected { .. }));
}

/// Random DAG: node `i` takes node `j < i` as a parent when `mask[i][j]`.
fn dag_strategy() -> impl Strategy<Value = (Vec<Vec<bool>>, prop::sample::Index)> {
    (
        prop::collection::vec(prop::collection::vec(any::<bool>(), 16), 1..16),
        any::<prop::sample::Index>(),
    )
}

proptest! {
    #[test]
    fn propagation_reaches_exactly_the_ancestors((mask, pick) in dag_strategy()) {
        let n = mask.len();
        let mut graph = TraceGraph::new();
        let mut ids = Vec::with_capacity(n);
        let mut parents_of: Vec<Vec<usize>> = Vec::with_capacity(n);

        for i in 0..n {
            let parents: Vec<usize> = (0..i).filter(|&j| mask[i][j]).collect();
            let id = if parents.is_empty() {
                graph.add_parameter("p", i as i64, "")
            } else {
                let parent_ids: Vec<NodeId> = parents.iter().map(|&j| ids[j]).collect();
                op(&mut graph, "op", &parent_ids)
            };
            ids.push(id);
            parents_of.push(parents);
        }

        let terminal = pick.index(n);
        let mut expected = vec![false; n];
        let mut stack = vec![terminal];
        while let Some(i) = stack.pop() {
            if expected[i] {
                continue;
            }
            expected[i] = true;
            stack.extend(parents_of[i].iter().copied());
        }

        let report = backward(&mut graph, ids[terminal], "judgment", BackwardOptions::default()).unwrap();
        prop_assert_eq!(report.visited.len(), expected.iter().filter(|e| **e).count());

        for i in 0..n {
            let feedback = graph.feedback(ids[i]).unwrap();
            prop_assert_eq!(!feedback.is_empty(), expected[i]);
            if expected[i] {
                prop_assert!(feedback.get(ids[terminal]).is_some());
                prop_assert_eq!(feedback.len(), 1);
            }
        }
    }
}
