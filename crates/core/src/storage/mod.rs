pub mod memory;
pub mod redb_store;

pub use memory::InMemoryStore;
pub use redb_store::RedbStore;

use crate::types::{GraphId, Run, RunId, RunState, RunStatus, TraceEntry};
use crate::workflow::GraphDefinition;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store of graph definitions, keyed by generated id
pub trait GraphStore: Send + Sync {
    /// Validate and store a graph
    fn create_graph(&self, definition: GraphDefinition) -> Result<GraphId>;

    /// Get a graph by ID
    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>>;

    /// List graph IDs, oldest first
    fn list_graphs(&self) -> Result<Vec<GraphId>>;
}

/// Bookkeeping for runs; no traversal logic lives here
pub trait RunLedger: Send + Sync {
    /// Create a running entry for a new run
    fn create_run(&self, graph_id: GraphId, initial_state: RunState) -> Result<RunId>;

    /// Append a trace entry and move the run to `next_node`
    fn record_step(&self, run_id: &RunId, entry: TraceEntry, next_node: Option<&str>) -> Result<()>;

    /// Store the final state, trace and status of a run
    fn update_run(
        &self,
        run_id: &RunId,
        final_state: RunState,
        trace: Vec<TraceEntry>,
        status: RunStatus,
    ) -> Result<()>;

    /// Get a run by ID
    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// List runs, oldest first, optionally for a single graph
    fn list_runs(&self, graph_id: Option<&GraphId>) -> Result<Vec<Run>>;
}

/// Graph definition as persisted, with its id and creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredGraph {
    pub graph_id: GraphId,
    pub created_at: DateTime<Utc>,
    pub definition: GraphDefinition,
}

impl StoredGraph {
    /// Validate `definition` and stamp it with a fresh id.
    ///
    /// Lint findings do not block creation; they are logged.
    pub fn admit(definition: GraphDefinition) -> Result<Self> {
        definition.validate()?;

        let graph_id = GraphId::new();
        for warning in definition.lint() {
            tracing::warn!(graph_id = %graph_id, "{}", warning);
        }

        Ok(Self {
            graph_id,
            created_at: Utc::now(),
            definition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaypointError;
    use crate::workflow::Edge;

    #[test]
    fn test_admit_rejects_invalid_graph() {
        let bad = GraphDefinition::new("a").with_edge("a", Edge::to("nowhere"));
        let err = StoredGraph::admit(bad).unwrap_err();
        assert_eq!(
            err.downcast_ref::<WaypointError>(),
            Some(&WaypointError::DanglingEdge {
                from: "a".to_string(),
                target: "nowhere".to_string()
            })
        );
    }

    #[test]
    fn test_admit_accepts_graph_with_warnings() {
        let graph = GraphDefinition::new("a").with_node("orphan");
        let stored = StoredGraph::admit(graph.clone()).unwrap();
        assert_eq!(stored.definition, graph);
    }
}
