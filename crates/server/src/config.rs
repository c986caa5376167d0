use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use waypoint_core::steps::StepRegistry;
use waypoint_core::storage::{GraphStore, InMemoryStore, RedbStore, RunLedger};
use waypoint_core::workflow::{EngineConfig, GraphEngine, WorkflowExecutor};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Where graphs and runs are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "waypoint.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content)?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the redb database path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// One store serving as both graph store and run ledger
fn shared<S>(store: S) -> (Arc<dyn GraphStore>, Arc<dyn RunLedger>)
where
    S: GraphStore + RunLedger + 'static,
{
    let store = Arc::new(store);
    (store.clone(), store)
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub workflow_executor: Arc<WorkflowExecutor>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let (graphs, ledger) = match config.storage.backend {
            StorageBackend::Memory => shared(InMemoryStore::new()),
            StorageBackend::Redb => shared(
                RedbStore::new(config.index_path()).context("Failed to create redb store")?,
            ),
        };
        tracing::info!(backend = ?config.storage.backend, "Storage ready");

        let registry = Arc::new(StepRegistry::with_builtin_steps());
        tracing::info!(steps = registry.len(), "Registered built-in steps");

        let engine = Arc::new(GraphEngine::new(registry, config.engine.clone()));

        Ok(Self {
            workflow_executor: Arc::new(WorkflowExecutor::new(engine, graphs, ledger)),
        })
    }
}
