use super::graph::NodeConfig;
use crate::steps::{StepOutput, StepRegistry};
use crate::types::{RunState, ERROR_KEY};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Result of executing one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Opaque value returned by the handler; `None` when it updated state
    pub output: Option<Value>,
    /// Failure message, also written to the state's error marker
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Step executor with optional timeout logic
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Run the handler bound to `node` and fold its result into `state`.
    ///
    /// Failures never escape: an unknown step, a handler error or a timeout
    /// leaves `_error` on the state and is reported in the outcome.
    pub async fn execute(&self, node: &str, config: &NodeConfig, state: &mut RunState) -> StepOutcome {
        let handler_name = config.handler_name(node);
        tracing::debug!(node = %node, step = %handler_name, "Executing node");

        match self.invoke(handler_name, state).await {
            Ok(StepOutput::Update(update)) => {
                state.extend(update);
                StepOutcome::default()
            }
            Ok(StepOutput::Output(Value::Null)) => StepOutcome::default(),
            Ok(StepOutput::Output(value)) => StepOutcome {
                output: Some(value),
                error: None,
            },
            Err(e) => {
                let message = format!("Error in node '{}': {}", node, e);
                tracing::error!(node = %node, error = %e, "Step failed");
                state.insert(ERROR_KEY.to_string(), Value::String(message.clone()));
                StepOutcome {
                    output: None,
                    error: Some(message),
                }
            }
        }
    }

    async fn invoke(&self, handler_name: &str, state: &RunState) -> Result<StepOutput> {
        let handler = self.registry.resolve(handler_name)?;

        match self.timeout {
            Some(limit) => match timeout(limit, handler.run(state)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("Step timed out after {:?}", limit)),
            },
            None => handler.run(state).await,
        }
    }
}
