use crate::error::WaypointError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Mutable, schema-free state threaded through a run.
pub type RunState = serde_json::Map<String, Value>;

/// State key holding the error marker for a failed step or a runaway run.
pub const ERROR_KEY: &str = "_error";

/// State key holding the engine's per-node loop counters.
pub const ITERATIONS_KEY: &str = "_iterations";

/// Unique identifier for a stored graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub Uuid);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GraphId {
    type Err = WaypointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| WaypointError::InvalidId(s.to_string()))
    }
}

/// Unique identifier for a graph run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = WaypointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| WaypointError::InvalidId(s.to_string()))
    }
}

/// Status of a graph run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One executed step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub state_before: RunState,
    pub state_after: RunState,
    #[serde(default)]
    pub output: Option<Value>,
    /// Handler failure for this step, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A traversal of a graph, with its state and trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub initial_state: RunState,
    pub current_state: RunState,
    pub current_node: Option<String>,
    pub status: RunStatus,
    pub execution_log: Vec<TraceEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(graph_id: GraphId, initial_state: RunState) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            graph_id,
            current_state: initial_state.clone(),
            initial_state,
            current_node: None,
            status: RunStatus::Running,
            execution_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn ensure_running(&self) -> Result<(), WaypointError> {
        if self.status.is_terminal() {
            return Err(WaypointError::RunFinished(self.run_id.to_string()));
        }
        Ok(())
    }

    /// Append one executed step; `next` becomes the current node.
    pub fn record_step(&mut self, entry: TraceEntry, next: Option<&str>) -> Result<(), WaypointError> {
        self.ensure_running()?;
        self.current_state = entry.state_after.clone();
        self.current_node = next.map(str::to_string);
        self.execution_log.push(entry);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace state and trace with the traversal's final view.
    pub fn finish(
        &mut self,
        final_state: RunState,
        trace: Vec<TraceEntry>,
        status: RunStatus,
    ) -> Result<(), WaypointError> {
        self.ensure_running()?;
        self.current_state = final_state;
        self.execution_log = trace;
        self.status = status;
        if status.is_terminal() {
            self.current_node = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}
