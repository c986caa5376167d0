pub mod code_review;
pub mod condition;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod step_executor;

pub use condition::{evaluate_condition, Condition, ConditionError};
pub use engine::{EngineConfig, GraphEngine, TraceSink, Traversal};
pub use executor::WorkflowExecutor;
pub use graph::{Edge, GraphDefinition, NodeConfig, NodeKind};
pub use step_executor::{StepExecutor, StepOutcome};
