use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use waypoint_core::{
    state::StateExt,
    workflow::{
        code_review::{code_review_graph, example_initial_state},
        GraphDefinition,
    },
    GraphId, Run, RunId, RunState, RunStatus, TraceEntry, WaypointError,
};

/// Create a new graph
pub async fn create_graph(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GraphDefinition>, JsonRejection>,
) -> ApiResult<Json<CreateGraphResponse>> {
    let Json(definition) = payload?;
    let graph_id = state.workflow_executor.create_graph(definition)?;

    Ok(Json(CreateGraphResponse {
        graph_id,
        message: "Graph created successfully".to_string(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGraphResponse {
    pub graph_id: GraphId,
    pub message: String,
}

/// Run a stored graph to completion
pub async fn run_graph(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunGraphRequest>, JsonRejection>,
) -> ApiResult<Json<RunGraphResponse>> {
    let Json(req) = payload?;
    let graph_id: GraphId = req.graph_id.parse()?;

    let run = state
        .workflow_executor
        .run_graph(graph_id, req.initial_state)
        .await?;

    Ok(Json(RunGraphResponse::from(run)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunGraphRequest {
    pub graph_id: String,
    #[serde(default)]
    pub initial_state: RunState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunGraphResponse {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub final_state: RunState,
    pub execution_log: Vec<TraceEntry>,
    pub status: RunStatus,
}

impl From<Run> for RunGraphResponse {
    fn from(run: Run) -> Self {
        Self {
            run_id: run.run_id,
            graph_id: run.graph_id,
            final_state: run.current_state,
            execution_log: run.execution_log,
            status: run.status,
        }
    }
}

/// Get the current state of a run
pub async fn get_run_state(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunStateResponse>> {
    let run_id: RunId = run_id.parse()?;

    let run = state
        .workflow_executor
        .get_run(&run_id)?
        .ok_or_else(|| WaypointError::RunNotFound(run_id.to_string()))?;

    Ok(Json(RunStateResponse {
        run_id: run.run_id,
        graph_id: run.graph_id,
        current_state: run.current_state,
        current_node: run.current_node,
        status: run.status,
        execution_log: run.execution_log,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunStateResponse {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub current_state: RunState,
    pub current_node: Option<String>,
    pub status: RunStatus,
    pub execution_log: Vec<TraceEntry>,
}

/// List all graphs
pub async fn list_graphs(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListGraphsResponse>> {
    let graphs = state.workflow_executor.list_graphs()?;
    Ok(Json(ListGraphsResponse {
        count: graphs.len(),
        graphs,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListGraphsResponse {
    pub graphs: Vec<GraphId>,
    pub count: usize,
}

/// List runs, optionally for one graph
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListRunsQuery>, QueryRejection>,
) -> ApiResult<Json<ListRunsResponse>> {
    let Query(query) = query?;
    let graph_id = query
        .graph_id
        .as_deref()
        .map(str::parse::<GraphId>)
        .transpose()?;

    let runs = state.workflow_executor.list_runs(graph_id.as_ref())?;
    Ok(Json(ListRunsResponse {
        count: runs.len(),
        runs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub graph_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
    pub count: usize,
}

/// List registered steps
pub async fn list_steps(State(state): State<Arc<AppState>>) -> Json<ListStepsResponse> {
    let registry = state.workflow_executor.registry();
    let steps = registry.list_names();
    let descriptions = registry
        .describe()
        .into_iter()
        .filter_map(|(name, description)| description.map(|d| (name, d)))
        .collect();

    Json(ListStepsResponse {
        count: steps.len(),
        steps,
        descriptions,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListStepsResponse {
    pub steps: Vec<String>,
    pub count: usize,
    pub descriptions: std::collections::BTreeMap<String, String>,
}

/// Register a step (placeholder: steps are registered in code)
pub async fn register_step(
    payload: Result<Json<RegisterStepRequest>, JsonRejection>,
) -> ApiResult<Json<RegisterStepResponse>> {
    let Json(req) = payload?;
    tracing::info!(step = %req.name, "Ignoring runtime step registration");

    Ok(Json(RegisterStepResponse {
        message: "Step registration endpoint (not implemented)".to_string(),
        step_name: req.name,
        note: "Register steps with StepRegistry::register when building the server".to_string(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterStepRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterStepResponse {
    pub message: String,
    pub step_name: String,
    pub note: String,
}

/// The built-in code-review workflow, ready to submit
pub async fn example_workflow() -> Json<ExampleWorkflowResponse> {
    Json(ExampleWorkflowResponse {
        workflow: code_review_graph(),
        example_initial_state: example_initial_state(),
        usage: "POST /api/graph/create with this workflow, then POST /api/graph/run with the example_initial_state".to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExampleWorkflowResponse {
    pub workflow: GraphDefinition,
    pub example_initial_state: RunState,
    pub usage: String,
}

/// Store and run the built-in code-review workflow on the sample code
pub async fn run_example(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ExampleRunResponse>> {
    let executor = &state.workflow_executor;
    let graph_id = executor.create_graph(code_review_graph())?;
    let run = executor.run_graph(graph_id, example_initial_state()).await?;

    let final_state = run.current_state;
    let execution_summary = ExecutionSummary {
        total_steps: run.execution_log.len(),
        quality_score: final_state.get("quality_score").cloned(),
        num_issues: final_state.get("num_issues").cloned(),
        num_suggestions: final_state.get("num_suggestions").cloned(),
        iterations: final_state.get("iteration").cloned(),
    };

    if let Some(error) = final_state.error_marker() {
        tracing::warn!(run_id = %run.run_id, error = %error, "Example run failed");
    }

    Ok(Json(ExampleRunResponse {
        run_id: run.run_id,
        graph_id,
        final_state,
        execution_summary,
        status: run.status,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub quality_score: Option<Value>,
    pub num_issues: Option<Value>,
    pub num_suggestions: Option<Value>,
    pub iterations: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExampleRunResponse {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub final_state: RunState,
    pub execution_summary: ExecutionSummary,
    pub status: RunStatus,
}
