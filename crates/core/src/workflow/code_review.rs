// Built-in code-review workflow: a linear pipeline with a scoring loop

use super::graph::{Edge, GraphDefinition, NodeConfig};
use crate::types::RunState;
use serde_json::json;

/// Sample input: two undocumented functions, one with a debug print.
pub const EXAMPLE_CODE: &str = r#"
def calculate_total(items):
    total = 0
    for item in items:
        if item > 0:
            total += item
    print(f"Total: {total}")
    return total

def process_data(data):
    result = []
    for i in range(len(data)):
        if data[i] % 2 == 0:
            result.append(data[i] * 2)
        else:
            result.append(data[i])
    return result
"#;

/// Keep improving while the score is low, for at most three passes.
pub const IMPROVE_CONDITION: &str =
    "state.get('quality_score', 0) < 70 and state.get('iteration', 0) < 3";

/// extract -> analyze -> detect -> improve -> score, where `score` loops on
/// itself and falls back to `improve` while [`IMPROVE_CONDITION`] holds.
pub fn code_review_graph() -> GraphDefinition {
    GraphDefinition::new("extract")
        .with_node("analyze")
        .with_node("detect")
        .with_node("improve")
        .with_node("score")
        .with_edge("extract", Edge::to("analyze"))
        .with_edge("analyze", Edge::to("detect"))
        .with_edge("detect", Edge::to("improve"))
        .with_edge("improve", Edge::to("score"))
        .with_edge(
            "score",
            Edge::conditional(IMPROVE_CONDITION, Some("improve"), None),
        )
        .with_config(NodeConfig::standard("extract").with_handler("extract_functions"))
        .with_config(NodeConfig::standard("analyze").with_handler("check_complexity"))
        .with_config(NodeConfig::standard("detect").with_handler("detect_issues"))
        .with_config(NodeConfig::standard("improve").with_handler("suggest_improvements"))
        .with_config(
            NodeConfig::looping("score", IMPROVE_CONDITION, 3)
                .with_handler("calculate_quality_score"),
        )
}

/// Initial state for running [`code_review_graph`] over `code`.
pub fn initial_state(code: &str) -> RunState {
    let mut state = RunState::new();
    state.insert("code".to_string(), json!(code));
    state.insert("quality_threshold".to_string(), json!(70));
    state.insert("iteration".to_string(), json!(0));
    state
}

pub fn example_initial_state() -> RunState {
    initial_state(EXAMPLE_CODE)
}
