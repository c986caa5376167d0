use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use waypoint_core::WaypointError;

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_index))
        .route("/api/health", get(health_check))
        // Graphs and runs
        .route("/api/graph/create", post(handlers::create_graph))
        .route("/api/graph/run", post(handlers::run_graph))
        .route("/api/graph/state/{run_id}", get(handlers::get_run_state))
        .route("/api/graphs", get(handlers::list_graphs))
        .route("/api/runs", get(handlers::list_runs))
        // Step registry
        .route("/api/steps", get(handlers::list_steps))
        .route("/api/steps/register", post(handlers::register_step))
        // Built-in example
        .route("/api/example/code-review", get(handlers::example_workflow))
        .route("/api/example/run", post(handlers::run_example))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "waypoint",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Service info and endpoint index
async fn api_index() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Waypoint workflow graph engine",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "create_graph": "POST /api/graph/create",
            "run_graph": "POST /api/graph/run",
            "get_state": "GET /api/graph/state/{run_id}",
            "list_graphs": "GET /api/graphs",
            "list_runs": "GET /api/runs?graph_id={graph_id}",
            "list_steps": "GET /api/steps",
            "register_step": "POST /api/steps/register",
            "example_workflow": "GET /api/example/code-review",
            "run_example": "POST /api/example/run",
        }
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<WaypointError>() {
            if err.is_not_found() {
                return StatusCode::NOT_FOUND;
            }
            if err.is_invalid_input() {
                return StatusCode::BAD_REQUEST;
            }
        }

        if self.0.is::<JsonRejection>() || self.0.is::<QueryRejection>() {
            return StatusCode::BAD_REQUEST;
        }

        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState::new(&ServerConfig::default()).unwrap();
        create_router(state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_index() {
        let app = app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "waypoint");

        let (status, body) = send(&app, "GET", "/api", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoints"]["run_graph"], "POST /api/graph/run");
    }

    #[tokio::test]
    async fn test_create_and_run_graph() {
        let app = app();
        let definition = json!({
            "nodes": ["extract", "analyze"],
            "edges": {"extract": "analyze"},
            "start_node": "extract",
            "node_configs": {
                "extract": {"name": "extract", "type": "standard", "tool": "extract_functions"},
                "analyze": {"name": "analyze", "tool": "check_complexity"}
            }
        });

        let (status, created) = send(&app, "POST", "/api/graph/create", Some(definition)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["message"], "Graph created successfully");
        let graph_id = created["graph_id"].as_str().unwrap().to_string();

        let (status, run) = send(
            &app,
            "POST",
            "/api/graph/run",
            Some(json!({
                "graph_id": graph_id,
                "initial_state": {"code": "def one(a):\n    return a\n"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "completed");
        assert_eq!(run["graph_id"], graph_id.as_str());
        assert_eq!(run["final_state"]["num_functions"], 1);
        assert_eq!(run["execution_log"].as_array().unwrap().len(), 2);
        assert_eq!(run["execution_log"][0]["node"], "extract");

        let run_id = run["run_id"].as_str().unwrap();
        let (status, state) = send(&app, "GET", &format!("/api/graph/state/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["status"], "completed");
        assert_eq!(state["current_node"], Value::Null);
        assert_eq!(state["current_state"], run["final_state"]);

        let (_, graphs) = send(&app, "GET", "/api/graphs", None).await;
        assert_eq!(graphs["count"], 1);
        assert_eq!(graphs["graphs"][0], graph_id.as_str());

        let (_, runs) = send(&app, "GET", &format!("/api/runs?graph_id={}", graph_id), None).await;
        assert_eq!(runs["count"], 1);
        assert_eq!(runs["runs"][0]["run_id"], run_id);
    }

    #[tokio::test]
    async fn test_definition_errors_are_bad_requests() {
        let app = app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/graph/create",
            Some(json!({"nodes": ["a"], "edges": {}, "start_node": "b"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Start node 'b' is not one of the graph's nodes");

        let (status, _) = send(
            &app,
            "POST",
            "/api/graph/create",
            Some(json!({"nodes": ["a"], "edges": {"a": "z"}, "start_node": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/graph/create",
            Some(json!({"nodes": ["a"], "edges": {"a": 5}, "start_node": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let app = app();

        let (status, _) = send(&app, "GET", "/api/graph/state/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = waypoint_core::RunId::new();
        let (status, body) = send(&app, "GET", &format!("/api/graph/state/{}", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], format!("Run not found: {}", missing));

        let (status, _) = send(
            &app,
            "POST",
            "/api/graph/run",
            Some(json!({"graph_id": waypoint_core::GraphId::new().to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_steps_endpoints() {
        let app = app();

        let (status, body) = send(&app, "GET", "/api/steps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 5);
        assert_eq!(body["steps"][0], "calculate_quality_score");

        let (status, body) = send(
            &app,
            "POST",
            "/api/steps/register",
            Some(json!({"name": "lint", "description": "Run a linter"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["step_name"], "lint");

        let (_, body) = send(&app, "GET", "/api/steps", None).await;
        assert_eq!(body["count"], 5);
    }

    #[tokio::test]
    async fn test_example_endpoints() {
        let app = app();

        let (status, example) = send(&app, "GET", "/api/example/code-review", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(example["workflow"]["start_node"], "extract");
        assert_eq!(example["example_initial_state"]["quality_threshold"], 70);

        let (status, body) = send(&app, "POST", "/api/example/run", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(
            body["execution_summary"],
            json!({
                "total_steps": 7,
                "quality_score": 52.4,
                "num_issues": 3,
                "num_suggestions": 3,
                "iterations": 3
            })
        );

        let (_, graphs) = send(&app, "GET", "/api/graphs", None).await;
        assert_eq!(graphs["graphs"][0], body["graph_id"]);
    }
}
