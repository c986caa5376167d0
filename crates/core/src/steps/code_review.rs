//! Built-in steps for the code-review workflow.
//!
//! They read Python source from `state.code` and publish their findings as
//! state updates, so later steps (and branch conditions) can build on them.

use super::{FnStep, StepRegistry};
use crate::state::{round2, StateExt};
use crate::types::RunState;
use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};

static DEF_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:async[ \t]+)?def[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*\(([^)]*)\)")
});

/// Register every code-review step under its canonical name.
pub fn register(registry: &mut StepRegistry) {
    let steps: [(&str, fn(&RunState) -> Result<Value>, &str); 5] = [
        (
            "extract_functions",
            extract_functions,
            "List function definitions found in `code` (line scan, syntax errors are not reported)",
        ),
        (
            "check_complexity",
            check_complexity,
            "Score each function by size, loops and branches",
        ),
        (
            "detect_issues",
            detect_issues,
            "Flag debug prints, long files and missing docstrings",
        ),
        (
            "suggest_improvements",
            suggest_improvements,
            "Turn detected issues into suggestions",
        ),
        (
            "calculate_quality_score",
            calculate_quality_score,
            "Compute a 0-100 quality score and bump `iteration`",
        ),
    ];

    for (name, func, description) in steps {
        registry.register(name, Arc::new(FnStep::new(func).with_description(description)));
    }
}

struct FunctionDef<'a> {
    name: &'a str,
    line_start: usize,
    num_args: usize,
    /// Source following the parameter list
    body: &'a str,
}

fn find_functions(code: &str) -> Result<Vec<FunctionDef<'_>>> {
    let pattern = DEF_PATTERN
        .as_ref()
        .map_err(|e| anyhow!("Failed to compile function pattern: {}", e))?;

    Ok(pattern
        .captures_iter(code)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?.as_str();
            let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");

            // Positional parameters only: stop at *args / keyword-only marker.
            let num_args = params
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty() && *p != "/")
                .take_while(|p| !p.starts_with('*'))
                .count();

            Some(FunctionDef {
                name,
                line_start: code[..whole.start()].matches('\n').count() + 1,
                num_args,
                body: &code[whole.end()..],
            })
        })
        .collect())
}

fn has_docstring(function: &FunctionDef<'_>) -> bool {
    let Some(colon) = function.body.find(':') else {
        return false;
    };
    let first_statement = function.body[colon + 1..].trim_start();
    let unprefixed = first_statement.trim_start_matches(['r', 'R', 'u', 'U', 'b', 'B']);
    unprefixed.starts_with('"') || unprefixed.starts_with('\'')
}

/// `def` lines are matched, not parsed: source with syntax errors still
/// yields the definitions it contains and never produces an error entry.
fn extract_functions(state: &RunState) -> Result<Value> {
    let code = state.str_or("code", "");
    let functions: Vec<Value> = find_functions(code)?
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "line_start": f.line_start,
                "num_args": f.num_args,
            })
        })
        .collect();

    Ok(json!({
        "num_functions": functions.len(),
        "functions": functions,
    }))
}

fn check_complexity(state: &RunState) -> Result<Value> {
    let code = state.str_or("code", "");
    let functions = state.list_or_empty("functions");

    // File-wide metrics, attributed to every function
    let lines = code.split('\n').count() as f64;
    let loops = (code.matches("for ").count() + code.matches("while ").count()) as f64;
    let conditions = (code.matches("if ").count() + code.matches("elif ").count()) as f64;
    let score = round2(lines * 0.1 + loops * 2.0 + conditions * 1.5);

    let scores: Vec<(&str, f64)> = functions
        .iter()
        .map(|f| {
            let name = f.get("name").and_then(Value::as_str).unwrap_or("unknown");
            (name, score)
        })
        .collect();

    let avg_complexity = if scores.is_empty() {
        0.0
    } else {
        round2(scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64)
    };

    let complexity: Vec<Value> = scores
        .into_iter()
        .map(|(name, score)| json!({"function": name, "score": score}))
        .collect();

    Ok(json!({
        "complexity": complexity,
        "avg_complexity": avg_complexity,
    }))
}

fn detect_issues(state: &RunState) -> Result<Value> {
    let code = state.str_or("code", "");
    let mut issues = Vec::new();

    if code.contains("print(") {
        issues.push(json!({"type": "debug_code", "message": "Found print statements"}));
    }

    if code.split('\n').count() > 100 {
        issues.push(json!({"type": "long_file", "message": "File is too long"}));
    }

    for function in find_functions(code)? {
        if !has_docstring(&function) {
            issues.push(json!({
                "type": "missing_docstring",
                "message": format!("Function '{}' missing docstring", function.name),
            }));
        }
    }

    Ok(json!({
        "num_issues": issues.len(),
        "issues": issues,
    }))
}

fn suggest_improvements(state: &RunState) -> Result<Value> {
    let complexity = state.number_or("avg_complexity", 0.0);

    let mut suggestions: Vec<String> = state
        .list_or_empty("issues")
        .iter()
        .filter_map(|issue| {
            let message = issue.get("message").and_then(Value::as_str).unwrap_or("");
            match issue.get("type").and_then(Value::as_str)? {
                "debug_code" => Some("Remove debug print statements before production".to_string()),
                "missing_docstring" => Some(format!("Add docstring: {}", message)),
                "long_file" => Some("Consider splitting file into smaller modules".to_string()),
                _ => None,
            }
        })
        .collect();

    if complexity > 10.0 {
        suggestions.push("Consider refactoring complex functions".to_string());
    }

    Ok(json!({
        "num_suggestions": suggestions.len(),
        "suggestions": suggestions,
    }))
}

fn calculate_quality_score(state: &RunState) -> Result<Value> {
    let num_issues = state.integer_or("num_issues", 0) as f64;
    let avg_complexity = state.number_or("avg_complexity", 0.0);

    let issue_penalty = num_issues * 10.0;
    let complexity_penalty = (avg_complexity * 2.0).min(30.0);
    let quality_score = (100.0 - issue_penalty - complexity_penalty).max(0.0);

    Ok(json!({
        "quality_score": round2(quality_score),
        "iteration": state.integer_or("iteration", 0) + 1,
    }))
}
