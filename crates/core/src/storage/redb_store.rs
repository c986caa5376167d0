use super::{GraphStore, RunLedger, StoredGraph};
use crate::error::WaypointError;
use crate::types::{GraphId, Run, RunId, RunState, RunStatus, TraceEntry};
use crate::workflow::GraphDefinition;
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;

/// JSON documents keyed by id
type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const GRAPHS_TABLE: JsonTable = TableDefinition::new("graphs");
const RUNS_TABLE: JsonTable = TableDefinition::new("runs");

/// Graph store and run ledger persisted in a redb database
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _graphs_table = write_txn
                .open_table(GRAPHS_TABLE)
                .context("Failed to open graphs table")?;
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table: JsonTable, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table.insert(key, value).context("Failed to insert entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get entry")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize entry")?,
            )),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut items = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            items.push(serde_json::from_slice(value.value()).context("Failed to deserialize entry")?);
        }
        Ok(items)
    }

    /// Read, change and write back one run inside a single write transaction
    fn modify_run<F>(&self, run_id: &RunId, change: F) -> Result<()>
    where
        F: FnOnce(&mut Run) -> Result<(), WaypointError>,
    {
        let key = run_id.to_string();
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

            let bytes = table
                .get(key.as_str())
                .context("Failed to get run")?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| WaypointError::RunNotFound(key.clone()))?;
            let mut run: Run = serde_json::from_slice(&bytes).context("Failed to deserialize run")?;

            change(&mut run)?;

            let value = serde_json::to_vec(&run).context("Failed to serialize run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to update run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

impl GraphStore for RedbStore {
    fn create_graph(&self, definition: GraphDefinition) -> Result<GraphId> {
        let stored = StoredGraph::admit(definition)?;
        let value = serde_json::to_vec(&stored).context("Failed to serialize graph")?;
        self.put(GRAPHS_TABLE, &stored.graph_id.to_string(), &value)?;

        tracing::info!(graph_id = %stored.graph_id, "Created graph");
        Ok(stored.graph_id)
    }

    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>> {
        let stored: Option<StoredGraph> = self.fetch(GRAPHS_TABLE, &graph_id.to_string())?;
        Ok(stored.map(|g| g.definition))
    }

    fn list_graphs(&self) -> Result<Vec<GraphId>> {
        let mut graphs: Vec<StoredGraph> = self.scan(GRAPHS_TABLE)?;
        graphs.sort_by_key(|g| g.created_at);
        Ok(graphs.into_iter().map(|g| g.graph_id).collect())
    }
}

impl RunLedger for RedbStore {
    fn create_run(&self, graph_id: GraphId, initial_state: RunState) -> Result<RunId> {
        let run = Run::new(graph_id, initial_state);
        let value = serde_json::to_vec(&run).context("Failed to serialize run")?;
        self.put(RUNS_TABLE, &run.run_id.to_string(), &value)?;
        Ok(run.run_id)
    }

    fn record_step(&self, run_id: &RunId, entry: TraceEntry, next_node: Option<&str>) -> Result<()> {
        self.modify_run(run_id, |run| run.record_step(entry, next_node))
    }

    fn update_run(
        &self,
        run_id: &RunId,
        final_state: RunState,
        trace: Vec<TraceEntry>,
        status: RunStatus,
    ) -> Result<()> {
        self.modify_run(run_id, |run| run.finish(final_state, trace, status))
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.fetch(RUNS_TABLE, &run_id.to_string())
    }

    fn list_runs(&self, graph_id: Option<&GraphId>) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.scan(RUNS_TABLE)?;
        runs.retain(|run| graph_id.map_or(true, |id| run.graph_id == *id));
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }
}
