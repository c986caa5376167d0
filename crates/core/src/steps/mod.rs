// Step handlers and the registry the engine resolves them from

pub mod code_review;

use crate::error::WaypointError;
use crate::types::RunState;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What a step hands back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// Keys to merge into the run state, overwriting existing ones
    Update(RunState),
    /// An opaque value recorded on the trace; state is left alone
    Output(Value),
}

impl StepOutput {
    pub fn none() -> Self {
        Self::Output(Value::Null)
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Update(map),
            other => Self::Output(other),
        }
    }
}

impl From<RunState> for StepOutput {
    fn from(map: RunState) -> Self {
        Self::Update(map)
    }
}

/// Unit of work bound to a graph node.
///
/// Handlers that only compute and handlers that wait on I/O share this one
/// interface; the engine awaits every call the same way.
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, state: &RunState) -> Result<StepOutput>;

    fn description(&self) -> Option<&str> {
        None
    }
}

type SyncStepFn = dyn Fn(&RunState) -> Result<StepOutput> + Send + Sync;
type AsyncStepFn = dyn Fn(RunState) -> BoxFuture<'static, Result<StepOutput>> + Send + Sync;

/// Handler backed by a plain function
pub struct FnStep {
    func: Box<SyncStepFn>,
    description: Option<String>,
}

impl FnStep {
    pub fn new<F, T>(func: F) -> Self
    where
        F: Fn(&RunState) -> Result<T> + Send + Sync + 'static,
        T: Into<StepOutput>,
    {
        Self {
            func: Box::new(move |state: &RunState| func(state).map(Into::into)),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait::async_trait]
impl StepHandler for FnStep {
    async fn run(&self, state: &RunState) -> Result<StepOutput> {
        (self.func)(state)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Handler backed by an async function; it receives its own copy of the state.
pub struct AsyncFnStep {
    func: Box<AsyncStepFn>,
    description: Option<String>,
}

impl AsyncFnStep {
    pub fn new<F, Fut, T>(func: F) -> Self
    where
        F: Fn(RunState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Into<StepOutput> + Send + 'static,
    {
        Self {
            func: Box::new(move |state: RunState| {
                let fut = func(state);
                async move { fut.await.map(Into::into) }.boxed()
            }),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[async_trait::async_trait]
impl StepHandler for AsyncFnStep {
    async fn run(&self, state: &RunState) -> Result<StepOutput> {
        (self.func)(state.clone()).await
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Registry mapping step names to handlers
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with the code-review steps
    pub fn with_builtin_steps() -> Self {
        let mut registry = Self::new();
        code_review::register(&mut registry);
        registry
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(step = %name, "Replaced registered step");
        }
    }

    pub fn register_fn<F, T>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&RunState) -> Result<T> + Send + Sync + 'static,
        T: Into<StepOutput>,
    {
        self.register(name, Arc::new(FnStep::new(func)));
    }

    pub fn register_async<F, Fut, T>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(RunState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Into<StepOutput> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncFnStep::new(func)));
    }

    /// Get a handler by name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn StepHandler>, WaypointError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| WaypointError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered step names, sorted
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Step names paired with their descriptions, sorted by name
    pub fn describe(&self) -> Vec<(String, Option<String>)> {
        self.list_names()
            .into_iter()
            .map(|name| {
                let description = self.handlers[&name].description().map(str::to_string);
                (name, description)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
