use super::condition::Condition;
use super::graph::{Edge, GraphDefinition, NodeConfig};
use super::step_executor::StepExecutor;
use crate::state::StateExt;
use crate::steps::StepRegistry;
use crate::types::{RunState, RunStatus, TraceEntry, ERROR_KEY, ITERATIONS_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn default_max_visits() -> usize {
    100
}

/// Engine limits and policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on node visits per run, across all nodes
    #[serde(default = "default_max_visits")]
    pub max_visits: usize,
    /// Per-handler time limit; unlimited when absent
    #[serde(
        rename = "step_timeout_secs",
        with = "optional_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub step_timeout: Option<Duration>,
    /// Treat a condition that cannot be evaluated as a run failure
    pub strict_conditions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_visits: default_max_visits(),
            step_timeout: None,
            strict_conditions: false,
        }
    }
}

/// `Option<Duration>` as fractional seconds
mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_f64(d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Receives each trace entry as soon as it is produced
pub trait TraceSink: Send + Sync {
    /// `next` is the node that will run after this one, if any.
    fn record(&self, entry: &TraceEntry, next: Option<&str>) -> anyhow::Result<()>;
}

/// Outcome of one traversal
#[derive(Debug, Clone, PartialEq)]
pub struct Traversal {
    pub final_state: RunState,
    pub trace: Vec<TraceEntry>,
    pub status: RunStatus,
    /// First failure seen during the run
    pub failure: Option<String>,
}

/// Walks a graph from its start node, one node at a time.
///
/// Each visit runs the node's handler, records a trace entry and then picks
/// the next node: a loop node revisits itself while its loop condition
/// holds and its iteration cap allows, otherwise the outgoing edge decides.
/// A node without an edge ends the run.
pub struct GraphEngine {
    steps: StepExecutor,
    config: EngineConfig,
}

impl GraphEngine {
    pub fn new(registry: Arc<StepRegistry>, config: EngineConfig) -> Self {
        Self {
            steps: StepExecutor::new(registry, config.step_timeout),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        self.steps.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn traverse(&self, graph: &GraphDefinition, initial_state: RunState) -> Traversal {
        self.traverse_with(graph, initial_state, None).await
    }

    /// Traverse `graph`, handing every trace entry to `sink` as it is made.
    ///
    /// Never fails: handler errors, bad conditions and runaway cycles all
    /// end up in the returned status and trace.
    pub async fn traverse_with(
        &self,
        graph: &GraphDefinition,
        initial_state: RunState,
        sink: Option<&dyn TraceSink>,
    ) -> Traversal {
        let mut state = initial_state;
        let mut trace = Vec::new();
        let mut failure: Option<String> = None;
        let mut current = Some(graph.start_node.clone());
        let mut visits = 0usize;

        while let Some(node) = current {
            if visits > self.config.max_visits {
                let message = format!("Maximum visit limit of {} exceeded", self.config.max_visits);
                tracing::warn!(node = %node, visits, "Visit ceiling reached, stopping run");
                state.insert(ERROR_KEY.to_string(), Value::String(message.clone()));
                failure.get_or_insert(message);
                break;
            }
            visits += 1;

            let config = graph.config_for(&node);
            let state_before = state.clone();
            let outcome = self.steps.execute(&node, &config, &mut state).await;
            if let Some(error) = &outcome.error {
                failure.get_or_insert_with(|| error.clone());
            }

            // Routing may write loop counters or a condition failure; the entry shows both.
            current = self.next_node(graph, &node, &config, &mut state, &mut failure);

            let entry = TraceEntry {
                node: node.clone(),
                timestamp: chrono::Utc::now(),
                state_before,
                state_after: state.clone(),
                output: outcome.output,
                error: outcome.error,
            };

            if let Some(sink) = sink {
                if let Err(e) = sink.record(&entry, current.as_deref()) {
                    tracing::warn!(node = %node, error = %e, "Failed to record trace entry");
                }
            }
            trace.push(entry);
        }

        let failure = failure.or_else(|| state.error_marker().map(str::to_string));
        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        tracing::debug!(steps = trace.len(), status = %status, "Traversal finished");

        Traversal {
            final_state: state,
            trace,
            status,
            failure,
        }
    }

    fn next_node(
        &self,
        graph: &GraphDefinition,
        node: &str,
        config: &NodeConfig,
        state: &mut RunState,
        failure: &mut Option<String>,
    ) -> Option<String> {
        if config.is_loop() {
            let iterations = loop_count(state, node);
            if iterations < u64::from(config.max_iterations) {
                if let Some(condition) = &config.loop_condition {
                    if self.decide(condition, state, failure) {
                        set_loop_count(state, node, iterations + 1);
                        return Some(node.to_string());
                    }
                }
            } else {
                tracing::debug!(node = %node, iterations, "Loop cap reached");
            }
        }

        match graph.edges.get(node)? {
            Edge::Direct(target) => Some(target.clone()),
            Edge::Conditional {
                condition,
                on_true,
                on_false,
            } => {
                if self.decide(condition, state, failure) {
                    on_true.clone()
                } else {
                    on_false.clone()
                }
            }
            Edge::Branches(guards) => guards
                .iter()
                .find(|(guard, _)| self.decide(guard, state, failure))
                .and_then(|(_, target)| target.clone()),
        }
    }

    fn decide(&self, condition: &Condition, state: &mut RunState, failure: &mut Option<String>) -> bool {
        if !self.config.strict_conditions {
            return condition.evaluate(state);
        }

        match condition.check(state) {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Condition '{}' failed: {}", condition, e);
                tracing::warn!(condition = %condition, error = %e, "Condition evaluation error");
                state.insert(ERROR_KEY.to_string(), Value::String(message.clone()));
                failure.get_or_insert(message);
                false
            }
        }
    }
}

fn loop_count(state: &RunState, node: &str) -> u64 {
    state
        .get(ITERATIONS_KEY)
        .and_then(|counters| counters.get(node))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn set_loop_count(state: &mut RunState, node: &str, count: u64) {
    let counters = state
        .entry(ITERATIONS_KEY)
        .or_insert_with(|| json!({}));
    if !counters.is_object() {
        *counters = json!({});
    }
    if let Value::Object(map) = counters {
        map.insert(node.to_string(), json!(count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::code_review::{code_review_graph, example_initial_state};
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn engine(registry: StepRegistry) -> GraphEngine {
        GraphEngine::new(Arc::new(registry), EngineConfig::default())
    }

    fn noop_registry(names: &[&str]) -> StepRegistry {
        let mut registry = StepRegistry::new();
        for name in names {
            registry.register_fn(*name, |_: &RunState| Ok(Value::Null));
        }
        registry
    }

    fn nodes(trace: &[TraceEntry]) -> Vec<&str> {
        trace.iter().map(|e| e.node.as_str()).collect()
    }

    #[tokio::test]
    async fn test_single_step_without_edge_completes() {
        let graph = GraphDefinition::new("only");
        let result = engine(noop_registry(&["only"])).traverse(&graph, RunState::new()).await;

        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.failure, None);
    }

    #[tokio::test]
    async fn test_null_target_terminates() {
        let graph: GraphDefinition = serde_json::from_value(json!({
            "nodes": ["a", "b"],
            "edges": {"a": {"condition": "True", "true": null, "false": "b"}},
            "start_node": "a"
        }))
        .unwrap();

        let result = engine(noop_registry(&["a", "b"])).traverse(&graph, RunState::new()).await;
        assert_eq!(nodes(&result.trace), vec!["a"]);
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_end_to_end_linear() {
        let mut registry = StepRegistry::new();
        registry.register_fn("A", |_: &RunState| Ok(json!({"v": 1})));
        registry.register_fn("B", |_: &RunState| Ok(json!({"v": 2})));
        registry.register_fn("C", |_: &RunState| Ok(json!("done")));

        let graph = GraphDefinition::new("A")
            .with_node("B")
            .with_node("C")
            .with_edge("A", Edge::to("B"))
            .with_edge("B", Edge::to("C"));

        let result = engine(registry).traverse(&graph, RunState::new()).await;

        assert_eq!(nodes(&result.trace), vec!["A", "B", "C"]);
        assert_eq!(json!(result.final_state), json!({"v": 2}));
        assert_eq!(result.trace[2].output, Some(json!("done")));
        assert_eq!(result.trace[0].output, None);
        assert_eq!(json!(result.trace[1].state_before), json!({"v": 1}));
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_self_edge_until_score_reached() {
        let mut registry = StepRegistry::new();
        registry.register_fn("S", |state: &RunState| {
            Ok(json!({"score": state.integer_or("score", 0) + 30}))
        });

        let graph = GraphDefinition::new("S").with_edge(
            "S",
            Edge::conditional("state['score'] < 70", Some("S"), None),
        );

        let mut initial = RunState::new();
        initial.insert("score".into(), json!(0));
        let result = engine(registry).traverse(&graph, initial).await;

        assert_eq!(result.trace.len(), 3);
        assert_eq!(result.final_state["score"], 90);
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_loop_cap_overrides_true_condition() {
        let mut registry = StepRegistry::new();
        registry.register_fn("tick", |state: &RunState| {
            Ok(json!({"iteration": state.integer_or("iteration", 0) + 1}))
        });
        registry.register_fn("after", |_: &RunState| Ok(json!("after")));

        let graph = GraphDefinition::new("tick")
            .with_node("after")
            .with_edge("tick", Edge::to("after"))
            .with_config(NodeConfig::looping("tick", "True", 2));

        let result = engine(registry).traverse(&graph, RunState::new()).await;

        // First visit plus two revisits, then the edge.
        assert_eq!(nodes(&result.trace), vec!["tick", "tick", "tick", "after"]);
        assert_eq!(result.final_state["iteration"], 3);
        assert_eq!(result.final_state[ITERATIONS_KEY], json!({"tick": 2}));
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_false_loop_condition_falls_through_to_edge() {
        let graph = GraphDefinition::new("a")
            .with_node("b")
            .with_edge("a", Edge::to("b"))
            .with_config(NodeConfig::looping("a", "state.get('again', False)", 5));

        let result = engine(noop_registry(&["a", "b"])).traverse(&graph, RunState::new()).await;
        assert_eq!(nodes(&result.trace), vec!["a", "b"]);
        assert!(!result.final_state.contains_key(ITERATIONS_KEY));
    }

    #[tokio::test]
    async fn test_unbounded_cycle_hits_visit_ceiling() {
        let graph = GraphDefinition::new("a")
            .with_node("b")
            .with_edge("a", Edge::to("b"))
            .with_edge("b", Edge::to("a"));

        let result = engine(noop_registry(&["a", "b"])).traverse(&graph, RunState::new()).await;

        assert_eq!(result.trace.len(), 101);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(
            result.final_state[ERROR_KEY],
            "Maximum visit limit of 100 exceeded"
        );
    }

    #[tokio::test]
    async fn test_custom_visit_ceiling() {
        let graph = GraphDefinition::new("a").with_edge("a", Edge::to("a"));
        let config = EngineConfig {
            max_visits: 4,
            ..EngineConfig::default()
        };
        let engine = GraphEngine::new(Arc::new(noop_registry(&["a"])), config);

        let result = engine.traverse(&graph, RunState::new()).await;
        assert_eq!(result.trace.len(), 5);
        assert_eq!(result.failure.as_deref(), Some("Maximum visit limit of 4 exceeded"));
    }

    #[tokio::test]
    async fn test_multi_branch_first_true_guard_wins() {
        let mut registry = noop_registry(&["start", "low", "high", "other"]);
        registry.register_fn("start", |_: &RunState| Ok(json!({"x": 10})));

        let graph: GraphDefinition = serde_json::from_value(json!({
            "nodes": ["start", "low", "high", "other"],
            "edges": {
                "start": {
                    "state['x'] > 100": "other",
                    "state['x'] > 5": "high",
                    "state['x'] > 1": "low",
                    "True": null
                }
            },
            "start_node": "start"
        }))
        .unwrap();

        let result = engine(registry).traverse(&graph, RunState::new()).await;
        assert_eq!(nodes(&result.trace), vec!["start", "high"]);
    }

    #[tokio::test]
    async fn test_later_guards_are_not_evaluated() {
        let mut registry = noop_registry(&["start", "high", "never"]);
        registry.register_fn("start", |_: &RunState| Ok(json!({"x": 10})));

        let graph = GraphDefinition::new("start")
            .with_node("high")
            .with_node("never")
            .with_edge(
                "start",
                Edge::branches([
                    ("state['x'] > 5", Some("high")),
                    ("state['missing'] > 1", Some("never")),
                ]),
            );
        let config = EngineConfig {
            strict_conditions: true,
            ..EngineConfig::default()
        };

        let result = GraphEngine::new(Arc::new(registry), config)
            .traverse(&graph, RunState::new())
            .await;
        assert_eq!(nodes(&result.trace), vec!["start", "high"]);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.failure, None);
        assert!(!result.final_state.contains_key(ERROR_KEY));
    }

    #[tokio::test]
    async fn test_trace_snapshots_chain_through_routing() {
        let mut registry = StepRegistry::new();
        registry.register_fn("tick", |state: &RunState| {
            Ok(json!({"x": state.get("x").and_then(Value::as_i64).unwrap_or(0) + 1}))
        });

        let graph = GraphDefinition::new("tick")
            .with_config(NodeConfig::looping("tick", "True", 2));
        let result = engine(registry).traverse(&graph, RunState::new()).await;

        assert_eq!(result.trace.len(), 3);
        for pair in result.trace.windows(2) {
            assert_eq!(pair[0].state_after, pair[1].state_before);
        }
        assert_eq!(
            json!(result.trace[0].state_after),
            json!({"x": 1, "_iterations": {"tick": 1}})
        );
        assert_eq!(result.trace.last().map(|e| &e.state_after), Some(&result.final_state));
    }

    #[tokio::test]
    async fn test_strict_condition_failure_is_in_last_entry() {
        let graph = GraphDefinition::new("a")
            .with_node("b")
            .with_edge("a", Edge::conditional("state['missing'] > 1", Some("b"), None));
        let config = EngineConfig {
            strict_conditions: true,
            ..EngineConfig::default()
        };

        let result = GraphEngine::new(Arc::new(noop_registry(&["a", "b"])), config)
            .traverse(&graph, RunState::new())
            .await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.trace[0].state_after, result.final_state);
        assert!(result.trace[0].state_after.contains_key(ERROR_KEY));
    }

    #[tokio::test]
    async fn test_no_matching_guard_terminates() {
        let graph = GraphDefinition::new("a").with_node("b").with_edge(
            "a",
            Edge::branches([("state.get('x', 0) > 1", Some("b"))]),
        );

        let result = engine(noop_registry(&["a", "b"])).traverse(&graph, RunState::new()).await;
        assert_eq!(nodes(&result.trace), vec!["a"]);
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_handler_error_keeps_traversing_then_fails() {
        let mut registry = noop_registry(&["after"]);
        registry.register_fn("boom", |_: &RunState| -> anyhow::Result<Value> { Err(anyhow!("bad input")) });

        let graph = GraphDefinition::new("boom")
            .with_node("after")
            .with_edge("boom", Edge::to("after"));

        let result = engine(registry).traverse(&graph, RunState::new()).await;

        assert_eq!(nodes(&result.trace), vec!["boom", "after"]);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(
            result.trace[0].error.as_deref(),
            Some("Error in node 'boom': bad input")
        );
        assert_eq!(result.final_state[ERROR_KEY], "Error in node 'boom': bad input");
    }

    #[tokio::test]
    async fn test_error_marker_visible_to_conditions() {
        let mut registry = noop_registry(&["recover", "finish"]);
        registry.register_fn("risky", |_: &RunState| -> anyhow::Result<Value> { Err(anyhow!("nope")) });

        let graph = GraphDefinition::new("risky")
            .with_node("recover")
            .with_node("finish")
            .with_edge(
                "risky",
                Edge::conditional("'_error' in state", Some("recover"), Some("finish")),
            );

        let result = engine(registry).traverse(&graph, RunState::new()).await;
        assert_eq!(nodes(&result.trace), vec!["risky", "recover"]);
    }

    #[tokio::test]
    async fn test_unknown_step_fails_run() {
        let graph = GraphDefinition::new("missing");
        let result = engine(StepRegistry::new()).traverse(&graph, RunState::new()).await;

        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.failure.unwrap().contains("not found in registry"));
    }

    #[tokio::test]
    async fn test_bad_condition_is_false_unless_strict() {
        let graph = GraphDefinition::new("a")
            .with_node("b")
            .with_edge("a", Edge::conditional("state['missing'] > 1", Some("b"), None));

        let lenient = engine(noop_registry(&["a", "b"])).traverse(&graph, RunState::new()).await;
        assert_eq!(lenient.trace.len(), 1);
        assert_eq!(lenient.status, RunStatus::Completed);

        let config = EngineConfig {
            strict_conditions: true,
            ..EngineConfig::default()
        };
        let strict = GraphEngine::new(Arc::new(noop_registry(&["a", "b"])), config)
            .traverse(&graph, RunState::new())
            .await;
        assert_eq!(strict.trace.len(), 1);
        assert_eq!(strict.status, RunStatus::Failed);
        assert!(strict.final_state[ERROR_KEY]
            .as_str()
            .unwrap()
            .starts_with("Condition 'state['missing'] > 1' failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_run() {
        let mut registry = StepRegistry::new();
        registry.register_async("slow", |_: RunState| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });

        let config = EngineConfig {
            step_timeout: Some(Duration::from_secs(5)),
            ..EngineConfig::default()
        };
        let engine = GraphEngine::new(Arc::new(registry), config);
        let result = engine.traverse(&GraphDefinition::new("slow"), RunState::new()).await;

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.failure.unwrap().contains("timed out"));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Option<String>)>>);

    impl TraceSink for Recorder {
        fn record(&self, entry: &TraceEntry, next: Option<&str>) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((entry.node.clone(), next.map(str::to_string)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_sees_each_step_with_next_node() {
        let graph = GraphDefinition::new("a").with_node("b").with_edge("a", Edge::to("b"));
        let recorder = Recorder::default();

        engine(noop_registry(&["a", "b"]))
            .traverse_with(&graph, RunState::new(), Some(&recorder))
            .await;

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![("a".to_string(), Some("b".to_string())), ("b".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn test_code_review_workflow() {
        let engine = engine(StepRegistry::with_builtin_steps());
        let result = engine
            .traverse(&code_review_graph(), example_initial_state())
            .await;

        assert_eq!(
            nodes(&result.trace),
            vec!["extract", "analyze", "detect", "improve", "score", "score", "score"]
        );
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.final_state["quality_score"], json!(52.4));
        assert_eq!(result.final_state["iteration"], 3);
        assert_eq!(result.final_state["num_functions"], 2);
        assert_eq!(result.final_state["num_suggestions"], 3);
        assert_eq!(result.final_state[ITERATIONS_KEY], json!({"score": 2}));
    }

    #[test]
    fn test_engine_config_from_toml_like_values() {
        let config: EngineConfig =
            serde_json::from_value(json!({"max_visits": 10, "step_timeout_secs": 2.5})).unwrap();
        assert_eq!(config.max_visits, 10);
        assert_eq!(config.step_timeout, Some(Duration::from_millis(2500)));
        assert!(!config.strict_conditions);

        let config: EngineConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
