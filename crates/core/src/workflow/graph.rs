use super::condition::Condition;
use crate::error::WaypointError;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};

fn default_max_iterations() -> u32 {
    10
}

/// Role a node plays in the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Standard,
    /// Marker for nodes whose outgoing edge branches
    Conditional,
    /// Revisits itself while its loop condition holds, up to `max_iterations`
    Loop,
}

/// Per-node configuration, fixed when the graph is defined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NodeKind,
    /// Registered step to invoke; the node name when absent
    #[serde(rename = "tool", alias = "handler", default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_condition: Option<Condition>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl NodeConfig {
    pub fn standard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Standard,
            handler: None,
            loop_condition: None,
            max_iterations: default_max_iterations(),
        }
    }

    pub fn looping(
        name: impl Into<String>,
        loop_condition: impl Into<Condition>,
        max_iterations: u32,
    ) -> Self {
        Self {
            kind: NodeKind::Loop,
            loop_condition: Some(loop_condition.into()),
            max_iterations,
            ..Self::standard(name)
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn handler_name<'a>(&'a self, node: &'a str) -> &'a str {
        self.handler.as_deref().unwrap_or(node)
    }

    pub fn is_loop(&self) -> bool {
        self.kind == NodeKind::Loop || self.loop_condition.is_some()
    }
}

/// Rule choosing the node that follows another.
///
/// On the wire an edge is either a bare target name, an object
/// `{"condition": ..., "true": ..., "false": ...}`, or an ordered object of
/// `guard -> target` pairs where the first true guard wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Edge {
    Direct(String),
    Conditional {
        condition: Condition,
        on_true: Option<String>,
        on_false: Option<String>,
    },
    Branches(Vec<(Condition, Option<String>)>),
}

impl Edge {
    pub fn to(target: impl Into<String>) -> Self {
        Self::Direct(target.into())
    }

    pub fn conditional(
        condition: impl Into<Condition>,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> Self {
        Self::Conditional {
            condition: condition.into(),
            on_true: on_true.map(str::to_string),
            on_false: on_false.map(str::to_string),
        }
    }

    pub fn branches<C: Into<Condition>>(guards: impl IntoIterator<Item = (C, Option<&'static str>)>) -> Self {
        Self::Branches(
            guards
                .into_iter()
                .map(|(c, t)| (c.into(), t.map(str::to_string)))
                .collect(),
        )
    }

    /// Non-null targets this edge can lead to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Direct(target) => vec![target.as_str()],
            Self::Conditional {
                on_true, on_false, ..
            } => on_true.iter().chain(on_false).map(String::as_str).collect(),
            Self::Branches(guards) => guards
                .iter()
                .filter_map(|(_, t)| t.as_deref())
                .collect(),
        }
    }

    pub fn conditions(&self) -> Vec<&Condition> {
        match self {
            Self::Direct(_) => Vec::new(),
            Self::Conditional { condition, .. } => vec![condition],
            Self::Branches(guards) => guards.iter().map(|(c, _)| c).collect(),
        }
    }
}

fn target_from(value: Value, context: &str) -> Result<Option<String>, WaypointError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(WaypointError::InvalidEdge(format!(
            "{} must be a node name or null, got {}",
            context, other
        ))),
    }
}

impl TryFrom<Value> for Edge {
    type Error = WaypointError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(target) => Ok(Self::Direct(target)),
            Value::Object(mut map) if map.contains_key("condition") => {
                let condition = match map.remove("condition") {
                    Some(Value::String(c)) => Condition::new(c),
                    other => {
                        return Err(WaypointError::InvalidEdge(format!(
                            "condition must be a string, got {}",
                            other.unwrap_or(Value::Null)
                        )))
                    }
                };
                let on_true = target_from(map.remove("true").unwrap_or(Value::Null), "'true' branch")?;
                let on_false =
                    target_from(map.remove("false").unwrap_or(Value::Null), "'false' branch")?;
                Ok(Self::Conditional {
                    condition,
                    on_true,
                    on_false,
                })
            }
            Value::Object(map) => {
                let guards = map
                    .into_iter()
                    .map(|(guard, target)| {
                        let target = target_from(target, &format!("target of guard '{}'", guard))?;
                        Ok((Condition::new(guard), target))
                    })
                    .collect::<Result<Vec<_>, WaypointError>>()?;
                Ok(Self::Branches(guards))
            }
            other => Err(WaypointError::InvalidEdge(format!(
                "expected a node name or an object, got {}",
                other
            ))),
        }
    }
}

impl From<Edge> for Value {
    fn from(edge: Edge) -> Self {
        let target = |t: Option<String>| t.map(Value::String).unwrap_or(Value::Null);
        match edge {
            Edge::Direct(t) => Value::String(t),
            Edge::Conditional {
                condition,
                on_true,
                on_false,
            } => {
                let mut map = Map::new();
                map.insert("condition".into(), Value::String(condition.as_str().to_string()));
                map.insert("true".into(), target(on_true));
                map.insert("false".into(), target(on_false));
                Value::Object(map)
            }
            Edge::Branches(guards) => Value::Object(
                guards
                    .into_iter()
                    .map(|(c, t)| (c.as_str().to_string(), target(t)))
                    .collect(),
            ),
        }
    }
}

/// Edges given as `null` are the same as no edge at all.
fn deserialize_edges<'de, D>(deserializer: D) -> Result<BTreeMap<String, Edge>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<Edge>>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(from, edge)| edge.map(|e| (from, e)))
        .collect())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Immutable description of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub nodes: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_edges")]
    pub edges: BTreeMap<String, Edge>,
    pub start_node: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub node_configs: BTreeMap<String, NodeConfig>,
}

impl GraphDefinition {
    pub fn new(start_node: impl Into<String>) -> Self {
        let start_node = start_node.into();
        Self {
            nodes: vec![start_node.clone()],
            edges: BTreeMap::new(),
            start_node,
            node_configs: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        let node = node.into();
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, edge: Edge) -> Self {
        self.edges.insert(from.into(), edge);
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.node_configs.insert(config.name.clone(), config);
        self
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Explicit configuration for `node`, or a standard one named after it.
    pub fn config_for(&self, node: &str) -> Cow<'_, NodeConfig> {
        match self.node_configs.get(node) {
            Some(config) => Cow::Borrowed(config),
            None => Cow::Owned(NodeConfig::standard(node)),
        }
    }

    /// Reject graphs whose start node or edge targets are not declared nodes.
    pub fn validate(&self) -> Result<(), WaypointError> {
        let nodes: HashSet<&str> = self.nodes.iter().map(String::as_str).collect();

        if !nodes.contains(self.start_node.as_str()) {
            return Err(WaypointError::StartNodeMissing(self.start_node.clone()));
        }

        for (from, edge) in &self.edges {
            if let Some(target) = edge.targets().into_iter().find(|t| !nodes.contains(t)) {
                return Err(WaypointError::DanglingEdge {
                    from: from.clone(),
                    target: target.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Non-fatal problems worth telling the graph author about.
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for from in self.edges.keys().filter(|f| !self.contains(f)) {
            warnings.push(format!("edge source '{}' is not a declared node", from));
        }

        for (key, config) in &self.node_configs {
            if !self.contains(key) {
                warnings.push(format!("node config '{}' is not a declared node", key));
            }
            if !config.name.is_empty() && config.name != *key {
                warnings.push(format!(
                    "node config '{}' is named '{}'",
                    key, config.name
                ));
            }
            if config.kind == NodeKind::Loop && config.loop_condition.is_none() {
                warnings.push(format!(
                    "loop node '{}' has no loop_condition and will never repeat",
                    key
                ));
            }
        }

        let conditions = self
            .edges
            .values()
            .flat_map(Edge::conditions)
            .chain(self.node_configs.values().filter_map(|c| c.loop_condition.as_ref()));
        for condition in conditions {
            if let Err(e) = condition.parse() {
                warnings.push(format!("condition '{}' will always be false: {}", condition, e));
            }
        }

        for node in self.unreachable_nodes() {
            warnings.push(format!("node '{}' is unreachable from '{}'", node, self.start_node));
        }

        warnings
    }

    /// Declared nodes that no path from the start node can reach
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let indices: HashMap<&str, NodeIndex> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), graph.add_node(n.as_str())))
            .collect();

        for (from, edge) in &self.edges {
            let Some(&from_idx) = indices.get(from.as_str()) else {
                continue;
            };
            for target in edge.targets() {
                if let Some(&to_idx) = indices.get(target) {
                    graph.add_edge(from_idx, to_idx, ());
                }
            }
        }

        let Some(&start) = indices.get(self.start_node.as_str()) else {
            return self.nodes.clone();
        };

        let mut reached = HashSet::new();
        let mut dfs = Dfs::new(&graph, start);
        while let Some(idx) = dfs.next(&graph) {
            reached.insert(graph[idx]);
        }

        self.nodes
            .iter()
            .filter(|n| !reached.contains(n.as_str()))
            .cloned()
            .collect()
    }
}
