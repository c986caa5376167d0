use super::engine::{GraphEngine, TraceSink};
use super::graph::GraphDefinition;
use crate::error::WaypointError;
use crate::steps::StepRegistry;
use crate::storage::{GraphStore, RunLedger};
use crate::types::{GraphId, Run, RunId, RunState, TraceEntry};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Forwards each trace entry to the ledger while the run is in flight
struct LedgerSink<'a> {
    ledger: &'a dyn RunLedger,
    run_id: RunId,
}

impl TraceSink for LedgerSink<'_> {
    fn record(&self, entry: &TraceEntry, next: Option<&str>) -> Result<()> {
        self.ledger.record_step(&self.run_id, entry.clone(), next)
    }
}

/// Workflow executor that ties the engine to graph storage and the run ledger
pub struct WorkflowExecutor {
    engine: Arc<GraphEngine>,
    graphs: Arc<dyn GraphStore>,
    ledger: Arc<dyn RunLedger>,
}

impl WorkflowExecutor {
    pub fn new(engine: Arc<GraphEngine>, graphs: Arc<dyn GraphStore>, ledger: Arc<dyn RunLedger>) -> Self {
        Self {
            engine,
            graphs,
            ledger,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        self.engine.registry()
    }

    /// Validate and store a graph definition
    pub fn create_graph(&self, definition: GraphDefinition) -> Result<GraphId> {
        self.graphs.create_graph(definition)
    }

    pub fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>> {
        self.graphs.get_graph(graph_id)
    }

    pub fn list_graphs(&self) -> Result<Vec<GraphId>> {
        self.graphs.list_graphs()
    }

    /// Run a stored graph to completion
    pub async fn run_graph(&self, graph_id: GraphId, initial_state: RunState) -> Result<Run> {
        let graph = self
            .graphs
            .get_graph(&graph_id)?
            .ok_or_else(|| WaypointError::GraphNotFound(graph_id.to_string()))?;

        self.execute(graph_id, &graph, initial_state).await
    }

    /// Run `graph` to completion, recording it in the ledger under `graph_id`
    pub async fn execute(&self, graph_id: GraphId, graph: &GraphDefinition, initial_state: RunState) -> Result<Run> {
        let run_id = self.ledger.create_run(graph_id, initial_state.clone())?;
        tracing::info!(run_id = %run_id, graph_id = %graph_id, "Starting graph run");

        let sink = LedgerSink {
            ledger: self.ledger.as_ref(),
            run_id,
        };
        let traversal = self
            .engine
            .traverse_with(graph, initial_state, Some(&sink))
            .await;

        match &traversal.failure {
            Some(failure) => tracing::error!(
                run_id = %run_id,
                steps = traversal.trace.len(),
                failure = %failure,
                "Graph run failed"
            ),
            None => tracing::info!(
                run_id = %run_id,
                steps = traversal.trace.len(),
                "Graph run completed"
            ),
        }

        self.ledger.update_run(
            &run_id,
            traversal.final_state,
            traversal.trace,
            traversal.status,
        )?;

        self.ledger
            .get_run(&run_id)?
            .context("Run disappeared from the ledger")
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.ledger.get_run(run_id)
    }

    pub fn list_runs(&self, graph_id: Option<&GraphId>) -> Result<Vec<Run>> {
        self.ledger.list_runs(graph_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, RedbStore};
    use crate::types::{RunStatus, ERROR_KEY};
    use crate::workflow::code_review::{code_review_graph, example_initial_state};
    use crate::workflow::{Edge, EngineConfig};
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn executor_with(registry: StepRegistry) -> WorkflowExecutor {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(GraphEngine::new(Arc::new(registry), EngineConfig::default()));
        WorkflowExecutor::new(engine, store.clone(), store)
    }

    #[tokio::test]
    async fn test_run_stored_graph() {
        let executor = executor_with(StepRegistry::with_builtin_steps());
        let graph_id = executor.create_graph(code_review_graph()).unwrap();

        let run = executor.run_graph(graph_id, example_initial_state()).await.unwrap();

        assert_eq!(run.graph_id, graph_id);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.execution_log.len(), 7);
        assert_eq!(run.current_state["quality_score"], json!(52.4));
        assert_eq!(run.initial_state, example_initial_state());
        assert!(run.current_node.is_none());

        let listed = executor.list_runs(Some(&graph_id)).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].run_id, run.run_id);
    }

    #[tokio::test]
    async fn test_unknown_graph() {
        let executor = executor_with(StepRegistry::new());
        let missing = GraphId::new();

        let err = executor.run_graph(missing, RunState::new()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<WaypointError>(),
            Some(&WaypointError::GraphNotFound(missing.to_string()))
        );
        assert!(executor.list_runs(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_recorded_as_failed_run() {
        let mut registry = StepRegistry::new();
        registry.register_fn("a", |_: &RunState| -> Result<Value> { Err(anyhow!("no data")) });
        registry.register_fn("b", |_: &RunState| Ok(json!({"reached": true})));

        let executor = executor_with(registry);
        let graph_id = executor
            .create_graph(GraphDefinition::new("a").with_node("b").with_edge("a", Edge::to("b")))
            .unwrap();

        let run = executor.run_graph(graph_id, RunState::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.execution_log.len(), 2);
        assert_eq!(run.current_state["reached"], true);
        assert_eq!(run.current_state[ERROR_KEY], "Error in node 'a': no data");

        let stored = executor.get_run(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_runs_on_redb() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::new(dir.path().join("waypoint.redb")).unwrap());
        let engine = Arc::new(GraphEngine::new(
            Arc::new(StepRegistry::with_builtin_steps()),
            EngineConfig::default(),
        ));
        let executor = WorkflowExecutor::new(engine, store.clone(), store);

        let graph_id = executor.create_graph(code_review_graph()).unwrap();
        let run = executor.run_graph(graph_id, example_initial_state()).await.unwrap();

        let stored = executor.get_run(&run.run_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.execution_log, run.execution_log);
        assert_eq!(executor.list_graphs().unwrap(), vec![graph_id]);
    }
}
