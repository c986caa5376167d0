use thiserror::Error;

/// Typed failures raised by the graph model, step registry and storage.
///
/// These travel inside `anyhow::Error` through the storage and executor
/// layers and are recovered with `downcast_ref` where callers need to tell
/// them apart (for example, to answer "not found" over HTTP).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaypointError {
    #[error("Step '{0}' not found in registry")]
    UnknownStep(String),

    #[error("Start node '{0}' is not one of the graph's nodes")]
    StartNodeMissing(String),

    #[error("Edge from '{from}' points at unknown node '{target}'")]
    DanglingEdge { from: String, target: String },

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} has already finished")]
    RunFinished(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}

impl WaypointError {
    /// Lookup failures the caller should see as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::GraphNotFound(_) | Self::RunNotFound(_))
    }

    /// Problems with a submitted graph or identifier.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::StartNodeMissing(_)
                | Self::DanglingEdge { .. }
                | Self::InvalidEdge(_)
                | Self::InvalidId(_)
        )
    }
}
