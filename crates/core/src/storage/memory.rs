use super::{GraphStore, RunLedger, StoredGraph};
use crate::error::WaypointError;
use crate::types::{GraphId, Run, RunId, RunState, RunStatus, TraceEntry};
use crate::workflow::GraphDefinition;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Entries plus the order they were created in
struct Table<K, V> {
    entries: HashMap<K, V>,
    order: Vec<K>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<K: Copy + Eq + std::hash::Hash, V> Table<K, V> {
    fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key, value).is_none() {
            self.order.push(key);
        }
    }

    fn in_order(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }
}

/// Process-local store for graphs and runs.
///
/// Every change to a run happens under the runs write lock.
#[derive(Default)]
pub struct InMemoryStore {
    graphs: RwLock<Table<GraphId, StoredGraph>>,
    runs: RwLock<Table<RunId, Run>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("Store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("Store lock poisoned"))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<F>(&self, run_id: &RunId, change: F) -> Result<()>
    where
        F: FnOnce(&mut Run) -> Result<(), WaypointError>,
    {
        let mut runs = write(&self.runs)?;
        let run = runs
            .entries
            .get_mut(run_id)
            .ok_or_else(|| WaypointError::RunNotFound(run_id.to_string()))?;
        change(run)?;
        Ok(())
    }
}

impl GraphStore for InMemoryStore {
    fn create_graph(&self, definition: GraphDefinition) -> Result<GraphId> {
        let stored = StoredGraph::admit(definition)?;
        let graph_id = stored.graph_id;
        write(&self.graphs)?.insert(graph_id, stored);
        tracing::info!(graph_id = %graph_id, "Created graph");
        Ok(graph_id)
    }

    fn get_graph(&self, graph_id: &GraphId) -> Result<Option<GraphDefinition>> {
        Ok(read(&self.graphs)?
            .entries
            .get(graph_id)
            .map(|g| g.definition.clone()))
    }

    fn list_graphs(&self) -> Result<Vec<GraphId>> {
        Ok(read(&self.graphs)?.in_order().map(|g| g.graph_id).collect())
    }
}

impl RunLedger for InMemoryStore {
    fn create_run(&self, graph_id: GraphId, initial_state: RunState) -> Result<RunId> {
        let run = Run::new(graph_id, initial_state);
        let run_id = run.run_id;
        write(&self.runs)?.insert(run_id, run);
        Ok(run_id)
    }

    fn record_step(&self, run_id: &RunId, entry: TraceEntry, next_node: Option<&str>) -> Result<()> {
        self.with_run(run_id, |run| run.record_step(entry, next_node))
    }

    fn update_run(
        &self,
        run_id: &RunId,
        final_state: RunState,
        trace: Vec<TraceEntry>,
        status: RunStatus,
    ) -> Result<()> {
        self.with_run(run_id, |run| run.finish(final_state, trace, status))
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        Ok(read(&self.runs)?.entries.get(run_id).cloned())
    }

    fn list_runs(&self, graph_id: Option<&GraphId>) -> Result<Vec<Run>> {
        Ok(read(&self.runs)?
            .in_order()
            .filter(|run| graph_id.map_or(true, |id| run.graph_id == *id))
            .cloned()
            .collect())
    }
}
